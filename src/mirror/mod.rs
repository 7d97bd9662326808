//! A local, strictly additive mirror of the target VM's class registry.
//! Entries map type descriptors and numeric class identifiers to remote
//! handles for class metadata; the target assigns the identifiers
//! monotonically and never unloads a class, so the mirror only ever grows.

use std::collections::HashMap;
use std::sync::Arc;

use crate::util::Address;

/// Numeric class identifier assigned by the target process.
pub type ClassId = u32;

/// A remote handle for one class's metadata in the target.
#[derive(Debug)]
pub struct ClassHandle {
    pub id: ClassId,
    /// The type descriptor, e.g. `Ljava/lang/Object;`.
    pub descriptor: String,
    /// Origin of the class metadata object in the target's address space.
    pub metadata_origin: Address,
}

/// A constraint of the target's class registry was violated by a refresh.
/// The mirror refuses the offending entries rather than guessing; an
/// inconsistent mirror would silently mislabel objects.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("class id {id} is not above the last registered id {last}")]
    NonMonotonicId { id: ClassId, last: ClassId },
    #[error("descriptor {descriptor:?} already registered with id {existing}")]
    DuplicateDescriptor { descriptor: String, existing: ClassId },
}

/// The mirror itself.  Bulk-populated with the boot-image classes at
/// construction, appended to as the target loads more classes.
pub struct ClassRegistryMirror {
    by_id: HashMap<ClassId, Arc<ClassHandle>>,
    by_descriptor: HashMap<String, Arc<ClassHandle>>,
    by_metadata_origin: HashMap<Address, Arc<ClassHandle>>,
    last_id: Option<ClassId>,
}

impl ClassRegistryMirror {
    /// Create the mirror from the boot-image classes.
    pub fn new(boot_classes: Vec<ClassHandle>) -> Result<ClassRegistryMirror, MirrorError> {
        let mut mirror = ClassRegistryMirror {
            by_id: HashMap::new(),
            by_descriptor: HashMap::new(),
            by_metadata_origin: HashMap::new(),
            last_id: None,
        };
        mirror.append(boot_classes)?;
        Ok(mirror)
    }

    /// Incrementally add classes discovered during a refresh.  Identifiers
    /// must continue the target's monotonic assignment.  Returns the number
    /// of entries added.
    pub fn append(&mut self, classes: Vec<ClassHandle>) -> Result<usize, MirrorError> {
        let mut added = 0;
        for class in classes {
            if let Some(last) = self.last_id {
                if class.id <= last {
                    return Err(MirrorError::NonMonotonicId { id: class.id, last });
                }
            }
            if let Some(existing) = self.by_descriptor.get(&class.descriptor) {
                return Err(MirrorError::DuplicateDescriptor {
                    descriptor: class.descriptor.clone(),
                    existing: existing.id,
                });
            }
            trace!("class registry mirror: {} = {}", class.id, class.descriptor);
            self.last_id = Some(class.id);
            let class = Arc::new(class);
            self.by_id.insert(class.id, class.clone());
            self.by_descriptor
                .insert(class.descriptor.clone(), class.clone());
            self.by_metadata_origin
                .insert(class.metadata_origin, class);
            added += 1;
        }
        if added > 0 {
            debug!("class registry mirror grew by {} to {} entries", added, self.len());
        }
        Ok(added)
    }

    pub fn find_by_id(&self, id: ClassId) -> Option<Arc<ClassHandle>> {
        self.by_id.get(&id).cloned()
    }

    pub fn find_by_descriptor(&self, descriptor: &str) -> Option<Arc<ClassHandle>> {
        self.by_descriptor.get(descriptor).cloned()
    }

    /// The class whose metadata object lives at `origin`, used to decode the
    /// header word of a remote object.
    pub fn find_by_metadata_origin(&self, origin: Address) -> Option<Arc<ClassHandle>> {
        self.by_metadata_origin.get(&origin).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The highest identifier registered so far.
    pub fn last_id(&self) -> Option<ClassId> {
        self.last_id
    }
}

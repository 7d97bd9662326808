use std::collections::HashMap;

use enum_map::EnumMap;

use crate::heap::remote_ref::{ObjectStatus, RefHandle, RefStateTag, RemoteRef};
use crate::heap::Space;
use crate::util::Address;
use crate::vm::StopToken;

/// Owns every [`RemoteRef`] discovered in the target heap, keyed by origin
/// address in either semispace, and drives the bulk state transitions at
/// collection-cycle boundaries.
///
/// The registry has no locking of its own: every mutating operation requires
/// a [`StopToken`], so mutation is single-threaded from the observer's side
/// by construction.  Lookups hand out clones of the same handle for the same
/// origin: object identity is the handle, not the address.
pub struct RemoteRefRegistry {
    /// Origin → reference for objects whose known copy is in the current
    /// to-space (the only live space outside of analysis).
    to_refs: HashMap<Address, RefHandle>,
    /// Origin → reference for old copies in from-space; populated only while
    /// analyzing.
    from_refs: HashMap<Address, RefHandle>,
    /// References that died in a recent cycle, kept for diagnostics with the
    /// number of the cycle they died in.  Never consulted by address lookups.
    dead: Vec<(u64, RefHandle)>,
    /// Completed collection cycles observed.
    cycles: u64,
    analyzing: bool,
}

impl RemoteRefRegistry {
    pub fn new() -> RemoteRefRegistry {
        RemoteRefRegistry {
            to_refs: HashMap::new(),
            from_refs: HashMap::new(),
            dead: Vec::new(),
            cycles: 0,
            analyzing: false,
        }
    }

    /// Number of live or analyzing references currently tracked.
    pub fn len(&self) -> usize {
        // From+to references appear in both maps.
        let dual = self
            .from_refs
            .values()
            .filter(|r| r.state_tag() == RefStateTag::LiveFromTo)
            .count();
        self.to_refs.len() + self.from_refs.len() - dual
    }

    pub fn is_empty(&self) -> bool {
        self.to_refs.is_empty() && self.from_refs.is_empty()
    }

    pub fn is_analyzing(&self) -> bool {
        self.analyzing
    }

    /// Completed collection cycles observed so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// The reference tracking `origin`, if that address is a known origin of
    /// a live or analyzing object in either space.  Dead references are never
    /// returned.
    pub fn find(&self, origin: Address) -> Option<RefHandle> {
        self.to_refs
            .get(&origin)
            .or_else(|| self.from_refs.get(&origin))
            .cloned()
    }

    /// Return the existing reference for `origin` in the hinted space, or
    /// create and register one in the initial state appropriate for the
    /// discovery context.  Calling this twice with the same origin and space
    /// returns the identical handle.
    pub fn lookup_or_create(
        &mut self,
        origin: Address,
        hint: Space,
        _token: &StopToken,
    ) -> RefHandle {
        debug_assert!(!origin.is_zero());
        match hint {
            Space::To => {
                if let Some(existing) = self.to_refs.get(&origin) {
                    return existing.clone();
                }
                let reference = if self.analyzing {
                    RemoteRef::create_to_only(origin)
                } else {
                    RemoteRef::create_live(origin)
                };
                self.to_refs.insert(origin, reference.clone());
                reference
            }
            Space::From => {
                assert!(
                    self.analyzing,
                    "from-space discovery at {} outside an analysis phase",
                    origin
                );
                if let Some(existing) = self.from_refs.get(&origin) {
                    return existing.clone();
                }
                let reference = RemoteRef::create_from_only(origin);
                self.from_refs.insert(origin, reference.clone());
                reference
            }
        }
    }

    /// The target's collector swapped its spaces and began a collection
    /// cycle: every `LIVE` reference moves to the from side with its
    /// reachability now unknown.
    ///
    /// There is deliberately no reentry latch here: calling this twice
    /// without an intervening [`RemoteRefRegistry::end_analysis`] hits the
    /// illegal-transition fault of the first reference it touches, which is
    /// the desynchronization diagnostic the caller should get.
    pub fn begin_analysis(&mut self, _token: &StopToken) {
        debug!(
            "begin analysis: {} references move to from-space",
            self.to_refs.len()
        );
        // Nothing can legally be tracked under a from-space origin when a
        // cycle begins; a leftover reference is in an analyzing state and
        // faults the transition.
        for reference in self.from_refs.values() {
            reference.analysis_begins();
        }
        for (origin, reference) in std::mem::take(&mut self.to_refs) {
            reference.analysis_begins();
            self.from_refs.insert(origin, reference);
        }
        self.analyzing = true;
    }

    /// A forwarding pointer was discovered: the object whose old copy is at
    /// `from_origin` was copied to `to_origin`.  Updates whichever partial
    /// reference already tracks either end, or creates a dual-known reference
    /// if this is the first sighting of the object.
    ///
    /// If both ends are already tracked by *different* references, the
    /// observer's model has desynchronized and this fails loudly.
    pub fn note_forwarded(
        &mut self,
        from_origin: Address,
        to_origin: Address,
        _token: &StopToken,
    ) -> RefHandle {
        assert!(self.analyzing, "forwarding discovered outside an analysis phase");
        let from_ref = self.from_refs.get(&from_origin).cloned();
        let to_ref = self.to_refs.get(&to_origin).cloned();
        match (from_ref, to_ref) {
            (Some(reference), None) => {
                reference.add_to_origin(to_origin);
                self.to_refs.insert(to_origin, reference.clone());
                reference
            }
            (None, Some(reference)) => {
                reference.add_from_origin(from_origin);
                self.from_refs.insert(from_origin, reference.clone());
                reference
            }
            (None, None) => {
                let reference = RemoteRef::create_from_to(from_origin, to_origin);
                self.from_refs.insert(from_origin, reference.clone());
                self.to_refs.insert(to_origin, reference.clone());
                reference
            }
            (Some(from_ref), Some(to_ref)) => {
                if std::sync::Arc::ptr_eq(&from_ref, &to_ref) {
                    // The same forwarding relation reported again.
                    return from_ref;
                }
                panic!(
                    "forwarding {} -> {} collides with two distinct references: {} and {}",
                    from_origin, to_origin, from_ref, to_ref
                );
            }
        }
    }

    /// The analysis phase ended: every reference still in an analyzing state
    /// takes its end-of-cycle transition.  Unforwarded from-space references
    /// become dead and are moved out of the lookup maps (they remain
    /// available to [`RemoteRefRegistry::state_counts`] until retired);
    /// everything else is confirmed live at its current origin.
    pub fn end_analysis(&mut self, _token: &StopToken) {
        let mut live = HashMap::new();
        let mut died = 0usize;
        for (_, reference) in self
            .to_refs
            .drain()
            .chain(std::mem::take(&mut self.from_refs))
        {
            match reference.state_tag() {
                // A from+to reference is registered under both origins and
                // was already transitioned when its first entry was visited.
                RefStateTag::Live => {
                    live.insert(reference.origin(), reference);
                }
                RefStateTag::Dead => {}
                _ => {
                    reference.analysis_ends();
                    if reference.status() == ObjectStatus::Dead {
                        died += 1;
                        self.dead.push((self.cycles, reference));
                    } else {
                        live.insert(reference.origin(), reference);
                    }
                }
            }
        }
        self.to_refs = live;
        self.analyzing = false;
        self.cycles += 1;
        debug!(
            "end analysis: cycle {} complete, {} live, {} collected",
            self.cycles,
            self.to_refs.len(),
            died
        );
    }

    /// Drop dead references from completed cycles before the most recent
    /// one.  Returns how many were evicted.
    pub fn retire_dead(&mut self) -> usize {
        let keep_from = self.cycles.saturating_sub(1);
        let before = self.dead.len();
        self.dead.retain(|(cycle, _)| *cycle >= keep_from);
        before - self.dead.len()
    }

    /// Origins of references whose old copy has not yet been matched with a
    /// forwarding pointer.  The heap view walks these when it sweeps the
    /// from-space for forwarders.
    pub fn unknown_from_origins(&self) -> Vec<Address> {
        self.from_refs
            .iter()
            .filter(|(_, r)| r.state_tag() == RefStateTag::UnknownFromOnly)
            .map(|(origin, _)| *origin)
            .collect()
    }

    /// References currently registered under a to-space origin.
    pub fn to_space_count(&self) -> usize {
        self.to_refs.len()
    }

    /// References currently registered under a from-space origin.
    pub fn from_space_count(&self) -> usize {
        self.from_refs.len()
    }

    /// A breakdown of the tracked population by state, including recently
    /// dead references.  Purely diagnostic; the counts are not part of the
    /// identity contract.
    pub fn state_counts(&self) -> EnumMap<RefStateTag, usize> {
        let mut counts = EnumMap::default();
        for reference in self.iter_unique() {
            counts[reference.state_tag()] += 1;
        }
        for (_, reference) in &self.dead {
            counts[reference.state_tag()] += 1;
        }
        counts
    }

    /// Every live or analyzing reference exactly once (dual-known references
    /// are registered under both origins).
    fn iter_unique(&self) -> impl Iterator<Item = &RefHandle> {
        self.to_refs.values().chain(
            self.from_refs
                .values()
                .filter(|r| r.state_tag() != RefStateTag::LiveFromTo),
        )
    }
}

impl Default for RemoteRefRegistry {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::Arc;

use crate::heap::semispace::is_forwarding_word;
use crate::heap::{MemoryRegion, SemiSpaceRemoteHeap};
use crate::mirror::{ClassHandle, ClassRegistryMirror, MirrorError};
use crate::util::{Address, ByteOffset};
use crate::vm::{ChannelError, ChannelProtocol, StopToken};

/// An inspector session attached to one target VM process.
///
/// Ties together the channel to the target, the class registry mirror, and
/// the semispace heap view.  Sessions are plain values: several probes can be
/// attached to several targets in one inspector process, and tests construct
/// them freely.
pub struct VmProbe<C: ChannelProtocol> {
    channel: Arc<C>,
    pub mirror: ClassRegistryMirror,
    pub heap: SemiSpaceRemoteHeap<C>,
}

impl<C: ChannelProtocol> VmProbe<C> {
    /// Attach a session.  `hub_word_offset` names the header word the
    /// target's collector overwrites with forwarding pointers (and which
    /// otherwise holds the class metadata pointer); `boot_classes` bulk-
    /// populates the class registry mirror.
    pub fn new(
        channel: Arc<C>,
        to_space: MemoryRegion,
        from_space: MemoryRegion,
        hub_word_offset: ByteOffset,
        boot_classes: Vec<ClassHandle>,
    ) -> Result<VmProbe<C>, MirrorError> {
        crate::util::logger::try_init();
        let mirror = ClassRegistryMirror::new(boot_classes)?;
        let heap = SemiSpaceRemoteHeap::new(channel.clone(), to_space, from_space, hub_word_offset);
        info!(
            "session attached: to-space {} @ {}, from-space {} @ {}, {} boot classes",
            heap.to_space().name,
            heap.to_space().start,
            heap.from_space().name,
            heap.from_space().start,
            mirror.len()
        );
        Ok(VmProbe {
            channel,
            mirror,
            heap,
        })
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// Block until the target halts and return the capability that the
    /// heap-mutating operations require.
    pub fn wait_for_stop(&self) -> Result<StopToken, ChannelError> {
        let state = self.channel.wait_until_stopped()?;
        StopToken::acquire(state).ok_or(ChannelError::Terminated)
    }

    /// A one-line diagnostic label for the object at `origin`: its dynamic
    /// type as resolved through the class registry mirror, plus the tracked
    /// reference state if the registry knows the address.  Never decides
    /// liveness and never fails the session; unreadable or unknown headers
    /// degrade to placeholder labels.
    pub fn describe_object(&self, origin: Address) -> String {
        let state = self
            .heap
            .registry()
            .find(origin)
            .map(|r| format!(" {}", r.state_tag()))
            .unwrap_or_default();
        let type_label = match self.heap.read_hub_word(origin) {
            Ok(word) if is_forwarding_word(word) => "<forwarded>".to_string(),
            Ok(word) => match self.mirror.find_by_metadata_origin(Address::from_raw(word)) {
                Some(class) => class.descriptor.clone(),
                None => format!("<unknown hub {:#x}>", word),
            },
            Err(_) => "<unreadable>".to_string(),
        };
        format!("{} @ {}{}", type_label, origin, state)
    }
}

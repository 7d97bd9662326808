use std::sync::Arc;

use crate::heap::registry::RemoteRefRegistry;
use crate::heap::remote_ref::RefHandle;
use crate::heap::Space;
use crate::util::{Address, ByteOffset, ByteSize};
use crate::vm::{ChannelError, ChannelProtocol, StopToken};

/// Word-aligned addresses are the only plausible object origins.
const WORD_BYTES: u64 = 8;

/// The tag the collector sets in the low bit of a header word it has
/// overwritten with a forwarding pointer.
const FORWARDING_TAG: u64 = 1;

/// A contiguous region of the target's address space, as reported by the
/// target's heap bookkeeping.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub name: String,
    pub start: Address,
    pub size: ByteSize,
}

impl MemoryRegion {
    pub fn new(name: impl Into<String>, start: Address, size: ByteSize) -> MemoryRegion {
        MemoryRegion {
            name: name.into(),
            start,
            size,
        }
    }

    pub fn end(&self) -> Address {
        self.start + self.size
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end()
    }
}

/// Phase of the target's collection cycle, as observed externally.  Outside
/// of [`HeapPhase::Analyzing`] every live object sits in a single definite
/// space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum HeapPhase {
    #[strum(serialize = "ALLOCATING")]
    Allocating,
    #[strum(serialize = "ANALYZING")]
    Analyzing,
    #[strum(serialize = "RECLAIMING")]
    Reclaiming,
}

/// Inspector support for a target using a simple semispace collector.
///
/// Owns the two space descriptors, tracks the observed collection phase, and
/// keeps the [`RemoteRefRegistry`] synchronized with what the collector did:
/// when the target halts during a collection, the from-space is swept for
/// forwarding pointers and each discovery is fed to the registry.
///
/// The collector stores a forwarding pointer in a fixed header word of the
/// old copy, tagged in its low bit; `hub_word_offset` names that word's
/// offset from an object's origin.
pub struct SemiSpaceRemoteHeap<C: ChannelProtocol> {
    channel: Arc<C>,
    to_space: MemoryRegion,
    from_space: MemoryRegion,
    phase: HeapPhase,
    hub_word_offset: ByteOffset,
    registry: RemoteRefRegistry,
}

impl<C: ChannelProtocol> SemiSpaceRemoteHeap<C> {
    pub fn new(
        channel: Arc<C>,
        to_space: MemoryRegion,
        from_space: MemoryRegion,
        hub_word_offset: ByteOffset,
    ) -> SemiSpaceRemoteHeap<C> {
        SemiSpaceRemoteHeap {
            channel,
            to_space,
            from_space,
            phase: HeapPhase::Allocating,
            hub_word_offset,
            registry: RemoteRefRegistry::new(),
        }
    }

    pub fn phase(&self) -> HeapPhase {
        self.phase
    }

    pub fn to_space(&self) -> &MemoryRegion {
        &self.to_space
    }

    pub fn from_space(&self) -> &MemoryRegion {
        &self.from_space
    }

    pub fn registry(&self) -> &RemoteRefRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RemoteRefRegistry {
        &mut self.registry
    }

    /// Do either of the heap regions contain the address?
    pub fn contains(&self, address: Address) -> bool {
        self.to_space.contains(address) || self.from_space.contains(address)
    }

    /// Could `origin` be the origin of an object in the current phase?
    /// Outside of analysis only to-space origins qualify; during analysis an
    /// object may be found in either space.
    pub fn is_object_origin(&self, origin: Address) -> bool {
        if origin.is_zero() || !origin.is_aligned_to(WORD_BYTES) {
            return false;
        }
        match self.phase {
            HeapPhase::Allocating | HeapPhase::Reclaiming => self.to_space.contains(origin),
            HeapPhase::Analyzing => self.contains(origin),
        }
    }

    /// The reference for the object at `origin`, creating and registering one
    /// if this is its first discovery.  Returns `None` for an address that is
    /// not a plausible object origin in the current phase.  `origin` must lie
    /// inside the heap regions.
    pub fn make_reference(&mut self, origin: Address, token: &StopToken) -> Option<RefHandle> {
        assert!(
            self.contains(origin),
            "{} is outside the semispace heap regions",
            origin
        );
        if !self.is_object_origin(origin) {
            return None;
        }
        let hint = if self.phase == HeapPhase::Analyzing && self.from_space.contains(origin) {
            Space::From
        } else {
            Space::To
        };
        Some(self.registry.lookup_or_create(origin, hint, token))
    }

    /// The target began a collection: its collector swapped the spaces, so
    /// the observer swaps its descriptors and moves every live reference into
    /// its analysis state.
    pub fn begin_analysis(&mut self, token: &StopToken) {
        assert!(
            self.phase == HeapPhase::Allocating,
            "analysis began while the observed phase is {}",
            self.phase
        );
        std::mem::swap(&mut self.to_space, &mut self.from_space);
        self.phase = HeapPhase::Analyzing;
        self.registry.begin_analysis(token);
    }

    /// Sweep the from-space copies of all still-unresolved references for
    /// forwarding pointers and record every discovery in the registry.
    /// Returns the number of newly discovered forwardings.
    pub fn update_forwarded_references(
        &mut self,
        token: &StopToken,
    ) -> Result<usize, ChannelError> {
        assert!(
            self.phase == HeapPhase::Analyzing,
            "reference update while the observed phase is {}",
            self.phase
        );
        let mut discovered = 0;
        for from_origin in self.registry.unknown_from_origins() {
            let word = self.read_hub_word(from_origin)?;
            if !is_forwarding_word(word) {
                continue;
            }
            let to_origin = forwarded_origin(word);
            assert!(
                self.to_space.contains(to_origin),
                "forwarding pointer at {} leads outside to-space: {}",
                from_origin,
                to_origin
            );
            self.registry.note_forwarded(from_origin, to_origin, token);
            discovered += 1;
        }
        trace!("from-space sweep found {} forwarded objects", discovered);
        Ok(discovered)
    }

    /// The analysis phase ended: unresolved references are dead, forwarded
    /// ones live on at their new origins, and the target moves on to
    /// reclaiming the from-space.
    pub fn end_analysis(&mut self, token: &StopToken) {
        assert!(
            self.phase == HeapPhase::Analyzing,
            "analysis ended while the observed phase is {}",
            self.phase
        );
        self.registry.end_analysis(token);
        self.phase = HeapPhase::Reclaiming;
        self.log_session_stats();
    }

    /// The collection cycle is over; the target is allocating again.
    pub fn collection_completed(&mut self) {
        assert!(
            self.phase == HeapPhase::Reclaiming,
            "collection completed while the observed phase is {}",
            self.phase
        );
        self.phase = HeapPhase::Allocating;
    }

    /// Using only low-level mechanisms, return a plausible location for a
    /// forwarded copy of the object presumed to be at `origin`.  Applies the
    /// sanity checks that minimize false positives: the heap must be
    /// analyzing, the origin must be in from-space, the header word must be
    /// tagged, and the forwarded origin must land in to-space.
    pub fn forwarding_address_unsafe(
        &self,
        origin: Address,
    ) -> Result<Option<Address>, ChannelError> {
        if self.phase != HeapPhase::Analyzing || !self.from_space.contains(origin) {
            return Ok(None);
        }
        let word = self.read_hub_word(origin)?;
        if !is_forwarding_word(word) {
            return Ok(None);
        }
        let to_origin = forwarded_origin(word);
        Ok(self.to_space.contains(to_origin).then_some(to_origin))
    }

    /// Read the header word the collector overwrites with a forwarding
    /// pointer.
    pub fn read_hub_word(&self, origin: Address) -> Result<u64, ChannelError> {
        self.channel.read_word(origin + self.hub_word_offset)
    }

    fn log_session_stats(&self) {
        let counts = self.registry.state_counts();
        info!(
            "phase={}, collections completed={}",
            self.phase,
            self.registry.cycles()
        );
        info!(
            "total object refs: fromSpace({})={}, toSpace({})={}",
            self.from_space.name,
            self.registry.from_space_count(),
            self.to_space.name,
            self.registry.to_space_count()
        );
        for (tag, count) in counts {
            if count != 0 {
                info!("  {}={}", tag, count);
            }
        }
    }
}

/// Does a word read from the hub slot represent a forwarding pointer, as
/// tagged by this collector?
pub(crate) fn is_forwarding_word(word: u64) -> bool {
    word & FORWARDING_TAG == FORWARDING_TAG
}

/// The origin a forwarding word points to.
pub(crate) fn forwarded_origin(word: u64) -> Address {
    Address::from_raw(word - FORWARDING_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::heap::ObjectStatus;
    use crate::vm::{ProcessState, RemoteThreadId};

    /// An in-memory stand-in for the transport: a sparse map of target words.
    struct MapChannel {
        words: Mutex<HashMap<Address, u64>>,
    }

    impl MapChannel {
        fn new() -> MapChannel {
            MapChannel {
                words: Mutex::new(HashMap::new()),
            }
        }

        fn poke(&self, at: Address, word: u64) {
            self.words.lock().unwrap().insert(at, word);
        }
    }

    impl ChannelProtocol for MapChannel {
        fn read_bytes(&self, src: Address, buf: &mut [u8]) -> Result<usize, ChannelError> {
            let word = self
                .words
                .lock()
                .unwrap()
                .get(&src)
                .copied()
                .unwrap_or_default();
            let bytes = word.to_le_bytes();
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(n)
        }
        fn write_bytes(&self, _dst: Address, buf: &[u8]) -> Result<usize, ChannelError> {
            Ok(buf.len())
        }
        fn read_registers(&self, _thread: RemoteThreadId) -> Result<Vec<u64>, ChannelError> {
            Ok(vec![])
        }
        fn suspend(&self, _thread: RemoteThreadId) -> Result<(), ChannelError> {
            Ok(())
        }
        fn resume(&self, _thread: RemoteThreadId) -> Result<(), ChannelError> {
            Ok(())
        }
        fn single_step(&self, _thread: RemoteThreadId) -> Result<(), ChannelError> {
            Ok(())
        }
        fn wait_until_stopped(&self) -> Result<ProcessState, ChannelError> {
            Ok(ProcessState::Stopped)
        }
    }

    const SPACE_A: Address = Address::from_raw(0x10_0000);
    const SPACE_B: Address = Address::from_raw(0x20_0000);
    const SPACE_BYTES: u64 = 0x10_0000;

    fn heap(channel: Arc<MapChannel>) -> SemiSpaceRemoteHeap<MapChannel> {
        SemiSpaceRemoteHeap::new(
            channel,
            MemoryRegion::new("Heap-To", SPACE_A, SPACE_BYTES),
            MemoryRegion::new("Heap-From", SPACE_B, SPACE_BYTES),
            0,
        )
    }

    fn token() -> StopToken {
        StopToken::acquire(ProcessState::Stopped).unwrap()
    }

    #[test]
    fn make_reference_rejects_implausible_origins() {
        let token = token();
        let mut heap = heap(Arc::new(MapChannel::new()));
        // Misaligned.
        assert!(heap.make_reference(SPACE_A + 3u64, &token).is_none());
        // From-space origins are not objects outside of analysis.
        assert!(heap.make_reference(SPACE_B, &token).is_none());
        assert!(heap.make_reference(SPACE_A + 8u64, &token).is_some());
    }

    #[test]
    #[should_panic(expected = "outside the semispace heap regions")]
    fn make_reference_outside_heap_is_fatal() {
        let token = token();
        let mut heap = heap(Arc::new(MapChannel::new()));
        heap.make_reference(Address::from_raw(0x40_0000), &token);
    }

    #[test]
    fn forwarding_sweep_updates_references() {
        let token = token();
        let channel = Arc::new(MapChannel::new());
        let mut heap = heap(channel.clone());

        let obj = heap.make_reference(SPACE_A + 0x100u64, &token).unwrap();
        let doomed = heap.make_reference(SPACE_A + 0x200u64, &token).unwrap();

        heap.begin_analysis(&token);
        // After the swap the old copies live in what is now from-space.
        assert!(heap.from_space().contains(obj.origin()));

        // The collector copied `obj` and left a tagged forwarding pointer.
        let new_origin = SPACE_B + 0x300u64;
        channel.poke(SPACE_A + 0x100u64, new_origin.as_u64() | 1);
        let discovered = heap.update_forwarded_references(&token).unwrap();
        assert_eq!(discovered, 1);
        assert_eq!(obj.origin(), new_origin);
        assert_eq!(obj.forwarded_from(), SPACE_A + 0x100u64);

        heap.end_analysis(&token);
        assert_eq!(obj.status(), ObjectStatus::Live);
        assert_eq!(doomed.status(), ObjectStatus::Dead);
        heap.collection_completed();
        assert_eq!(heap.phase(), HeapPhase::Allocating);
    }

    #[test]
    fn forwarding_address_unsafe_checks_spaces() {
        let token = token();
        let channel = Arc::new(MapChannel::new());
        let mut heap = heap(channel.clone());
        heap.make_reference(SPACE_A + 0x100u64, &token).unwrap();
        heap.begin_analysis(&token);

        let old = SPACE_A + 0x100u64;
        // Untagged word: not a forwarder.
        channel.poke(old, (SPACE_B + 0x300u64).as_u64());
        assert_eq!(heap.forwarding_address_unsafe(old).unwrap(), None);
        // Tagged but pointing outside to-space: rejected.
        channel.poke(old, 0x40_0001);
        assert_eq!(heap.forwarding_address_unsafe(old).unwrap(), None);
        // Tagged and plausible.
        channel.poke(old, (SPACE_B + 0x300u64).as_u64() | 1);
        assert_eq!(
            heap.forwarding_address_unsafe(old).unwrap(),
            Some(SPACE_B + 0x300u64)
        );
    }

    #[test]
    #[should_panic(expected = "analysis began while the observed phase is ANALYZING")]
    fn phase_mismatch_is_fatal() {
        let token = token();
        let mut heap = heap(Arc::new(MapChannel::new()));
        heap.begin_analysis(&token);
        heap.begin_analysis(&token);
    }
}

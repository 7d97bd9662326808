use std::fmt;
use std::sync::{Arc, Mutex};

use crate::util::Address;

/// Liveness of a remote object as currently known to the observer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, enum_map::Enum, strum_macros::Display)]
pub enum ObjectStatus {
    /// The object is reachable, or was copied to the new space this cycle.
    #[strum(serialize = "LIVE")]
    Live,
    /// The heap is being analyzed and the object's reachability is not yet
    /// determined.
    #[strum(serialize = "UNKNOWN")]
    Unknown,
    /// The object was not reachable at the end of an analysis cycle.
    #[strum(serialize = "DEAD")]
    Dead,
}

/// The distinct states a remote reference can be in, used for diagnostic
/// histograms.  [`RefState`] carries the addresses; this is just the label.
#[derive(Debug, Copy, Clone, PartialEq, Eq, enum_map::Enum, strum_macros::Display)]
pub enum RefStateTag {
    #[strum(serialize = "LIVE")]
    Live,
    #[strum(serialize = "UNKNOWN(Analyzing: from-space)")]
    UnknownFromOnly,
    #[strum(serialize = "LIVE(Analyzing: to-space only)")]
    LiveToOnly,
    #[strum(serialize = "LIVE(Analyzing: from+to)")]
    LiveFromTo,
    #[strum(serialize = "DEAD")]
    Dead,
}

/// What the observer knows about where one remote object is, relative to the
/// collector's two semispaces.
///
/// During an analysis phase the collector can independently reveal (a) that
/// an object was copied, and (b) where it was copied from, in either order or
/// not at all; the four live/analyzing states represent every reachable
/// combination of partial knowledge, so no boolean-flag bookkeeping is
/// needed.  Transitions are exhaustive matches: a state accepts exactly the
/// transitions the collector's protocol allows from it, and anything else is
/// a fatal desynchronization between the observer and the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RefState {
    /// Live object with a single known origin; the heap is not being
    /// analyzed.
    Live { to: Address },
    /// Known only in the old space during analysis; reachability
    /// undetermined.
    UnknownFromOnly { from: Address },
    /// Known only in the new space during analysis: presumed forwarded, old
    /// copy not yet found.
    LiveToOnly { to: Address },
    /// Both copies known during analysis.
    LiveFromTo { from: Address, to: Address },
    /// Terminal.  Retains the last known origin for diagnostics; no further
    /// transitions are accepted.
    Dead { last: Address },
}

impl RefState {
    fn tag(&self) -> RefStateTag {
        match self {
            RefState::Live { .. } => RefStateTag::Live,
            RefState::UnknownFromOnly { .. } => RefStateTag::UnknownFromOnly,
            RefState::LiveToOnly { .. } => RefStateTag::LiveToOnly,
            RefState::LiveFromTo { .. } => RefStateTag::LiveFromTo,
            RefState::Dead { .. } => RefStateTag::Dead,
        }
    }
}

/// A stable handle for one logical object in the target heap, tracked across
/// the collector's copying activity.  The inspector refers to objects only
/// through these handles, never through raw addresses; the handle stays valid
/// (and identical, see [`crate::heap::RemoteRefRegistry`]) while the object
/// is reachable.
pub struct RemoteRef {
    state: Mutex<RefState>,
}

/// Handles are shared between the registry and the inspector.
pub type RefHandle = Arc<RemoteRef>;

impl RemoteRef {
    /// A reference to a live object discovered while the heap is *not* being
    /// analyzed.
    pub fn create_live(to: Address) -> RefHandle {
        RemoteRef::with_state(RefState::Live { to })
    }

    /// A reference to an object discovered in the old space during analysis,
    /// reachability unknown.
    pub fn create_from_only(from: Address) -> RefHandle {
        RemoteRef::with_state(RefState::UnknownFromOnly { from })
    }

    /// A reference to an object discovered in the new space during analysis;
    /// its old copy has not been found.
    pub fn create_to_only(to: Address) -> RefHandle {
        RemoteRef::with_state(RefState::LiveToOnly { to })
    }

    /// A reference to an object discovered during analysis with both copies
    /// known at once.
    pub fn create_from_to(from: Address, to: Address) -> RefHandle {
        RemoteRef::with_state(RefState::LiveFromTo { from, to })
    }

    fn with_state(state: RefState) -> RefHandle {
        debug_assert!(match state {
            RefState::Live { to } | RefState::LiveToOnly { to } => !to.is_zero(),
            RefState::UnknownFromOnly { from } => !from.is_zero(),
            RefState::LiveFromTo { from, to } => !from.is_zero() && !to.is_zero(),
            RefState::Dead { .. } => false,
        });
        Arc::new(RemoteRef {
            state: Mutex::new(state),
        })
    }

    pub fn status(&self) -> ObjectStatus {
        match *self.state.lock().unwrap() {
            RefState::Live { .. } | RefState::LiveToOnly { .. } | RefState::LiveFromTo { .. } => {
                ObjectStatus::Live
            }
            RefState::UnknownFromOnly { .. } => ObjectStatus::Unknown,
            RefState::Dead { .. } => ObjectStatus::Dead,
        }
    }

    /// Is the object known to have been copied this cycle?
    pub fn is_forwarded(&self) -> bool {
        matches!(
            *self.state.lock().unwrap(),
            RefState::LiveToOnly { .. } | RefState::LiveFromTo { .. }
        )
    }

    /// The preferred current address of the object: the new-space copy if
    /// known, otherwise the old-space copy.  For a dead reference this is the
    /// last origin the object was known at.
    pub fn origin(&self) -> Address {
        match *self.state.lock().unwrap() {
            RefState::Live { to } | RefState::LiveToOnly { to } | RefState::LiveFromTo { to, .. } => to,
            RefState::UnknownFromOnly { from } => from,
            RefState::Dead { last } => last,
        }
    }

    /// The old-space address the object was copied from, if both copies are
    /// known; zero otherwise.
    pub fn forwarded_from(&self) -> Address {
        match *self.state.lock().unwrap() {
            RefState::LiveFromTo { from, .. } => from,
            _ => Address::ZERO,
        }
    }

    pub fn state_tag(&self) -> RefStateTag {
        self.state.lock().unwrap().tag()
    }

    /// The collector's two spaces were conceptually swapped: the known origin
    /// becomes the old-space ("from") origin and the object's reachability is
    /// now unknown.  Invoked exactly once per collection cycle, and only on a
    /// `LIVE` reference.
    pub fn analysis_begins(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            RefState::Live { to } => *state = RefState::UnknownFromOnly { from: to },
            other => illegal_transition("analysis_begins", other),
        }
    }

    /// A forwarding pointer was found in the object's old copy, naming its
    /// new copy at `to`.
    pub fn add_to_origin(&self, to: Address) {
        debug_assert!(!to.is_zero());
        let mut state = self.state.lock().unwrap();
        match *state {
            RefState::UnknownFromOnly { from } => *state = RefState::LiveFromTo { from, to },
            other => illegal_transition("add_to_origin", other),
        }
    }

    /// The old copy of an already-discovered forwarded object was found at
    /// `from`.
    pub fn add_from_origin(&self, from: Address) {
        debug_assert!(!from.is_zero());
        let mut state = self.state.lock().unwrap();
        match *state {
            RefState::LiveToOnly { to } => *state = RefState::LiveFromTo { from, to },
            other => illegal_transition("add_from_origin", other),
        }
    }

    /// The analysis phase ended.  A reference whose forwarding was never
    /// discovered is dead; a forwarded reference is confirmed live and its
    /// old copy becomes unimportant.
    pub fn analysis_ends(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            RefState::UnknownFromOnly { from } => *state = RefState::Dead { last: from },
            RefState::LiveToOnly { to } => *state = RefState::Live { to },
            RefState::LiveFromTo { to, .. } => *state = RefState::Live { to },
            other => illegal_transition("analysis_ends", other),
        }
    }
}

/// The observer's model of the target has desynchronized; there is no
/// recovery for this object and the inspection session must not guess one.
fn illegal_transition(operation: &str, state: RefState) -> ! {
    panic!(
        "illegal remote reference transition {} in state {:?}",
        operation, state
    );
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = *self.state.lock().unwrap();
        write!(f, "RemoteRef({:?})", state)
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = *self.state.lock().unwrap();
        match state {
            RefState::LiveFromTo { from, to } => {
                write!(f, "{} origin: {} from: {}", state.tag(), to, from)
            }
            _ => write!(f, "{} origin: {}", state.tag(), self.origin()),
        }
    }
}

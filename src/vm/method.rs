use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::compile::record::CompiledState;
use crate::mirror::ClassId;
use crate::vm::compiler::{CodeHandle, Nature};

/// Method attribute flags, a subset of what the target VM tracks.
pub mod flags {
    /// The method contains unsafe/low-level operations; only the optimizing
    /// compiler can produce correct code for it.
    pub const UNSAFE: u32 = 1 << 0;
    /// The method is implemented natively in the target.
    pub const NATIVE: u32 = 1 << 1;
    /// The method is an entry point invoked directly by the VM.
    pub const VM_ENTRY_POINT: u32 = 1 << 2;
}

/// Identity of a method in the target VM, and the anchor for its compilation
/// state.  The method object doubles as the per-method serialization point:
/// reading and installing its current compilation happens under
/// `compiled_state`'s lock, which is what guarantees at most one in-flight
/// compilation per method.
pub struct Method {
    holder: ClassId,
    name: String,
    flags: u32,
    /// Entry counter driving recompilation candidacy.
    pub profile: MethodProfile,
    pub(crate) compiled_state: Mutex<CompiledState>,
}

/// Methods are shared between requesting threads, compilation records and the
/// scheduler.
pub type MethodRef = Arc<Method>;

impl Method {
    pub fn new(holder: ClassId, name: impl Into<String>, flags: u32) -> MethodRef {
        Arc::new(Method {
            holder,
            name: name.into(),
            flags,
            profile: MethodProfile::new(),
            compiled_state: Mutex::new(CompiledState::default()),
        })
    }

    pub fn holder(&self) -> ClassId {
        self.holder
    }

    /// Full name of the method, e.g. `com.acme.util.Strings.hash(Ljava/lang/String;)I`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unsafe(&self) -> bool {
        self.flags & flags::UNSAFE != 0
    }

    pub fn is_native(&self) -> bool {
        self.flags & flags::NATIVE != 0
    }

    pub fn is_vm_entry_point(&self) -> bool {
        self.flags & flags::VM_ENTRY_POINT != 0
    }

    /// The most recent completed code for this method honoring an optional
    /// nature constraint, or `None` if nothing suitable has been compiled.
    /// An in-flight compilation is not waited for; its predecessor is
    /// reported instead.
    pub fn current_code(&self, nature: Option<Nature>) -> Option<CodeHandle> {
        match &*self.compiled_state.lock().unwrap() {
            CompiledState::Terminal(history) => history.current_code(nature),
            CompiledState::InFlight(record) => record.prev().current_code(nature),
        }
    }

    /// Is a compilation of this method currently in flight?
    pub fn is_compilation_pending(&self) -> bool {
        matches!(
            &*self.compiled_state.lock().unwrap(),
            CompiledState::InFlight(_)
        )
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Method({})", self.name)
    }
}

/// Number of entries to wait before re-reporting an overflow when a
/// recompilation cannot be started right now.
pub const SHORT_RECOUNT: i64 = 1_000;
/// Number of entries to wait when a newer compilation is already pending.
pub const LONG_RECOUNT: i64 = 10_000;

const DISARMED: i64 = i64::MAX;

/// Per-method instrumentation counter.  Baseline-compiled code decrements the
/// counter on entry; when it crosses zero the method becomes a candidate for
/// promotion to the optimizing compiler.  The counting itself is performed by
/// instrumented target code in the real system; this collaborator mirrors the
/// bookkeeping the scheduler needs.
pub struct MethodProfile {
    entry_countdown: AtomicI64,
}

impl MethodProfile {
    fn new() -> MethodProfile {
        MethodProfile {
            entry_countdown: AtomicI64::new(DISARMED),
        }
    }

    /// Arm the counter so that `threshold` recorded entries trigger an
    /// overflow.
    pub fn arm(&self, threshold: usize) {
        self.entry_countdown
            .store(threshold as i64, Ordering::Relaxed);
    }

    pub fn is_armed(&self) -> bool {
        self.entry_countdown.load(Ordering::Relaxed) != DISARMED
    }

    /// Record one entry of the method.  Returns true exactly once per arming,
    /// when the countdown crosses zero.
    pub fn record_entry(&self) -> bool {
        self.entry_countdown.fetch_sub(1, Ordering::Relaxed) == 1
    }

    /// Postpone the next overflow by `entries`.
    pub fn postpone(&self, entries: i64) {
        self.entry_countdown.store(entries, Ordering::Relaxed);
    }

    /// Stop counting entirely, once promotion has succeeded.
    pub fn disarm(&self) {
        self.entry_countdown.store(DISARMED, Ordering::Relaxed);
    }
}

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::compile::CompilationError;
use crate::vm::{CodeHandle, MethodRef, Nature, RuntimeCompiler};

/// The terminal compiled state of a method: the most recent completed code of
/// each nature.  Replaced wholesale when a newer compilation completes.
#[derive(Clone, Default)]
pub struct Compilations {
    pub baseline: Option<CodeHandle>,
    pub optimized: Option<CodeHandle>,
}

impl Compilations {
    pub const EMPTY: Compilations = Compilations {
        baseline: None,
        optimized: None,
    };

    pub fn is_empty(&self) -> bool {
        self.baseline.is_none() && self.optimized.is_none()
    }

    /// The code a caller with the given nature constraint should run.
    /// Unconstrained callers prefer optimized code.
    pub fn current_code(&self, nature: Option<Nature>) -> Option<CodeHandle> {
        match nature {
            Some(Nature::Baseline) => self.baseline.clone(),
            Some(Nature::Optimizing) => self.optimized.clone(),
            None => self.optimized.clone().or_else(|| self.baseline.clone()),
        }
    }

    /// This history extended with one newly completed compilation.
    pub fn with(&self, code: CodeHandle) -> Compilations {
        let mut next = self.clone();
        match code.nature {
            Nature::Baseline => next.baseline = Some(code),
            Nature::Optimizing => next.optimized = Some(code),
        }
        next
    }
}

/// A method's compiled state: either a terminal history (possibly empty), or
/// the record of the compilation currently in flight.  Guarded by the
/// method's `compiled_state` lock; a terminal state is never mutated, only
/// replaced.
pub(crate) enum CompiledState {
    Terminal(Compilations),
    InFlight(Arc<Compilation>),
}

impl Default for CompiledState {
    fn default() -> Self {
        CompiledState::Terminal(Compilations::EMPTY)
    }
}

enum Stage {
    /// Compile requested, not complete.  Waiters block.
    Pending,
    /// Target code produced.
    Done(CodeHandle),
    /// The compile failed terminally (after any failover attempt).
    Failed(CompilationError),
}

/// The state of one compilation of one method.  Created when a compile is
/// requested and no compatible in-flight record exists; threads that request
/// the same method while it is pending block on [`Compilation::wait`] instead
/// of compiling again.  Once terminal the record is never reused; a later
/// request installs a fresh one.
///
/// During failover the same record stays pending while the owning thread
/// retries with the other compiler, so joiners observe a single extended
/// compile attempt and only its terminal outcome.
pub(crate) struct Compilation {
    method: MethodRef,
    /// The nature constraint of the original request, `None` if any nature
    /// is acceptable.
    nature: Option<Nature>,
    /// Completed compilations preceding this one, for failover bookkeeping
    /// and for readers while this record is pending.
    prev: Compilations,
    /// The thread that installed the record and performs the compile (and
    /// any retry).
    compiling_thread: ThreadId,
    /// The compiler producing the code.  Replaced under the method's state
    /// lock when the owning thread fails over.
    compiler: Mutex<Arc<dyn RuntimeCompiler>>,
    stage: Mutex<Stage>,
    completed: Condvar,
}

impl Compilation {
    pub fn new(
        method: MethodRef,
        nature: Option<Nature>,
        prev: Compilations,
        compiler: Arc<dyn RuntimeCompiler>,
    ) -> Arc<Compilation> {
        Arc::new(Compilation {
            method,
            nature,
            prev,
            compiling_thread: thread::current().id(),
            compiler: Mutex::new(compiler),
            stage: Mutex::new(Stage::Pending),
            completed: Condvar::new(),
        })
    }

    pub fn method(&self) -> &MethodRef {
        &self.method
    }

    pub fn requested_nature(&self) -> Option<Nature> {
        self.nature
    }

    pub fn prev(&self) -> &Compilations {
        &self.prev
    }

    pub fn compiling_thread(&self) -> ThreadId {
        self.compiling_thread
    }

    pub fn compiler(&self) -> Arc<dyn RuntimeCompiler> {
        self.compiler.lock().unwrap().clone()
    }

    /// Substitute the failover compiler.  Only the compiling thread may do
    /// this, and only while the record is pending.
    pub fn set_compiler(&self, compiler: Arc<dyn RuntimeCompiler>) {
        debug_assert_eq!(thread::current().id(), self.compiling_thread);
        *self.compiler.lock().unwrap() = compiler;
    }

    /// Mark the record done and wake every waiter.
    pub fn complete(&self, code: CodeHandle) {
        let mut stage = self.stage.lock().unwrap();
        debug_assert!(matches!(*stage, Stage::Pending));
        *stage = Stage::Done(code);
        self.completed.notify_all();
    }

    /// Mark the record failed and wake every waiter.
    pub fn fail(&self, error: CompilationError) {
        let mut stage = self.stage.lock().unwrap();
        debug_assert!(matches!(*stage, Stage::Pending));
        *stage = Stage::Failed(error);
        self.completed.notify_all();
    }

    /// Block until the record is terminal and return its outcome.  This is a
    /// real suspension on a condition variable, not a spin.
    pub fn wait(&self) -> Result<CodeHandle, CompilationError> {
        let mut stage = self.stage.lock().unwrap();
        while matches!(*stage, Stage::Pending) {
            stage = self.completed.wait(stage).unwrap();
        }
        match &*stage {
            Stage::Done(code) => Ok(code.clone()),
            Stage::Failed(error) => Err(error.clone()),
            Stage::Pending => unreachable!(),
        }
    }
}

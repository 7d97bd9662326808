use std::cell::Cell;
use std::sync::{Arc, Mutex};
use std::thread;

use crate::compile::queue::{self, CompileRequest};
use crate::compile::record::{Compilation, CompiledState, Compilations};
use crate::compile::CompilationStats;
use crate::util::options::{CompileDirectives, Options};
use crate::vm::{
    CodeHandle, CompileError, MethodRef, Nature, RuntimeCompiler, LONG_RECOUNT, SHORT_RECOUNT,
};

/// A terminally failed compilation request, delivered to the requesting
/// thread and to every thread that joined the pending record.
#[derive(Debug, Clone, thiserror::Error)]
#[error("compilation of {method} by {compiler} failed: {source}")]
pub struct CompilationError {
    pub method: String,
    pub compiler: String,
    #[source]
    pub source: CompileError,
}

thread_local! {
    /// Set while this thread is inside a compiler, so a counter overflow
    /// observed during compilation never requests a recursive compile.
    static IN_COMPILER: Cell<bool> = const { Cell::new(false) };
}

/// The adaptive compilation scheduler.  Selects between a baseline and an
/// optimizing compiler per method, drives synchronous compilation with
/// request coalescing, and fails over to the other compiler when a compile
/// fails.
///
/// All scheduling knobs are instance fields taken from [`Options`]; multiple
/// independent brokers can coexist (e.g. in tests).
pub struct CompilationBroker {
    /// The baseline compiler, absent in an optimizing-only configuration.
    baseline_compiler: Option<Arc<dyn RuntimeCompiler>>,
    /// The optimizing compiler.  Always configured.
    optimizing_compiler: Arc<dyn RuntimeCompiler>,
    /// The compiler used when neither the method nor the request constrains
    /// the choice.
    default_compiler: Arc<dyn RuntimeCompiler>,
    fail_over: bool,
    recompilation_threshold: usize,
    directives: CompileDirectives,
    pub stats: CompilationStats,
    background: Mutex<Option<crossbeam::channel::Sender<CompileRequest>>>,
}

impl CompilationBroker {
    /// Create a broker from the configured compilers.  `optimizing` must have
    /// the optimizing nature; `baseline`, if present, the baseline nature.
    pub fn new(
        baseline: Option<Arc<dyn RuntimeCompiler>>,
        optimizing: Arc<dyn RuntimeCompiler>,
        options: &Options,
    ) -> Arc<CompilationBroker> {
        assert_eq!(
            optimizing.nature(),
            Nature::Optimizing,
            "{} is not an optimizing compiler",
            optimizing.name()
        );
        if let Some(baseline) = &baseline {
            assert_eq!(
                baseline.nature(),
                Nature::Baseline,
                "{} is not a baseline compiler",
                baseline.name()
            );
        }
        let default_compiler = match &baseline {
            Some(baseline) if !options.optimize_first => baseline.clone(),
            _ => optimizing.clone(),
        };
        let broker = Arc::new(CompilationBroker {
            baseline_compiler: baseline,
            optimizing_compiler: optimizing,
            default_compiler,
            fail_over: options.fail_over_compilation,
            recompilation_threshold: options.recompilation_threshold,
            directives: options.compile_directives.clone(),
            stats: CompilationStats::default(),
            background: Mutex::new(None),
        });
        info!("compilation broker created: {}", broker.mode());
        if options.background_compilation {
            broker.enable_background(options.compile_threads);
        }
        broker
    }

    /// A string describing the compilation mode, suitable for version
    /// banners.
    pub fn mode(&self) -> &'static str {
        if self.recompilation_threshold != 0 && self.baseline_compiler.is_some() {
            if self.is_default_baseline() {
                "mixed mode, baseline-compile first"
            } else {
                "mixed mode, optimize first"
            }
        } else {
            "optimizing-only"
        }
    }

    fn is_default_baseline(&self) -> bool {
        self.baseline_compiler
            .as_ref()
            .is_some_and(|b| Arc::ptr_eq(b, &self.default_compiler))
    }

    /// Produce target code for `method`.  If another thread is currently
    /// compiling it with a compatible nature, this thread blocks on that
    /// record and receives its result.  Otherwise a new record is installed
    /// and the compile runs synchronously on this thread, failing over once
    /// to the other configured compiler if the first attempt fails.
    ///
    /// On a terminal failure the method's compiled state is reset to empty so
    /// the next request starts from scratch, and the failure is returned to
    /// this thread and every joined waiter.
    pub fn compile(
        &self,
        method: &MethodRef,
        nature: Option<Nature>,
    ) -> Result<CodeHandle, CompilationError> {
        let mut retry_run = false;
        loop {
            let mut do_compile = true;
            let record = {
                let mut state = method.compiled_state.lock().unwrap();
                assert!(
                    !(method.is_native() && method.is_vm_entry_point()),
                    "cannot compile native VM entry point {}",
                    method.name()
                );
                match &*state {
                    CompiledState::InFlight(current)
                        if nature.is_none() || nature == current.requested_nature() =>
                    {
                        // Only join a pending compilation if it is compatible
                        // with the current request: either the request does
                        // not constrain the nature, or it matches the pending
                        // record's.
                        let current = current.clone();
                        if retry_run {
                            assert_eq!(current.compiling_thread(), thread::current().id());
                            current.set_compiler(self.select_retry_compiler(&current.compiler()));
                        } else {
                            // The method is currently being compiled; just
                            // wait for the result.
                            do_compile = false;
                        }
                        current
                    }
                    _ => {
                        let prev = match &*state {
                            CompiledState::InFlight(current) => current.prev().clone(),
                            CompiledState::Terminal(history) => history.clone(),
                        };
                        let mut compiler = self.select_compiler(method, nature);
                        if retry_run {
                            compiler = self.select_retry_compiler(&compiler);
                        }
                        let record = Compilation::new(method.clone(), nature, prev, compiler);
                        *state = CompiledState::InFlight(record.clone());
                        record
                    }
                }
            };

            if !do_compile {
                return record.wait();
            }

            match self.run(&record) {
                Ok(code) => return Ok(code),
                Err(error) => {
                    debug!("{}", error);
                    // A natured request is not retried: the other compiler
                    // could not satisfy the constraint anyway.
                    let final_failure = !self.fail_over
                        || retry_run
                        || nature.is_some()
                        || self.baseline_compiler.is_none();
                    if final_failure {
                        {
                            let mut state = method.compiled_state.lock().unwrap();
                            if matches!(&*state, CompiledState::InFlight(current) if Arc::ptr_eq(current, &record))
                            {
                                *state = CompiledState::Terminal(Compilations::EMPTY);
                            }
                        }
                        record.fail(error.clone());
                        return Err(error);
                    }
                    retry_run = true;
                    debug!(
                        "retrying {} with {}",
                        method.name(),
                        self.select_retry_compiler(&record.compiler()).name()
                    );
                }
            }
        }
    }

    /// Perform the compile described by `record` on the current thread and,
    /// on success, install the result as the method's terminal state.  On
    /// failure the record stays pending: the caller decides between failover
    /// and terminal failure.
    fn run(&self, record: &Arc<Compilation>) -> Result<CodeHandle, CompilationError> {
        let compiler = record.compiler();
        let method = record.method().clone();
        self.stats.count_started();
        trace!("{}: compiling {}", compiler.name(), method.name());

        let outcome = {
            IN_COMPILER.with(|flag| flag.set(true));
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                compiler.compile(&method, false, &self.stats)
            }));
            IN_COMPILER.with(|flag| flag.set(false));
            match result {
                Ok(outcome) => outcome,
                Err(panic) => {
                    // A panicking compiler must not leave waiters blocked on
                    // a record that can never complete.
                    {
                        let mut state = method.compiled_state.lock().unwrap();
                        if matches!(&*state, CompiledState::InFlight(current) if Arc::ptr_eq(current, record))
                        {
                            *state = CompiledState::Terminal(Compilations::EMPTY);
                        }
                    }
                    record.fail(CompilationError {
                        method: method.name().to_string(),
                        compiler: compiler.name().to_string(),
                        source: CompileError::Fatal("compiler panicked".to_string()),
                    });
                    std::panic::resume_unwind(panic);
                }
            }
        };

        match outcome {
            Ok(code) => {
                {
                    // A request with a mismatching nature constraint may have
                    // replaced this record while it was compiling; in that
                    // case the newer record stays and only the waiters on
                    // this one receive the code.
                    let mut state = method.compiled_state.lock().unwrap();
                    if matches!(&*state, CompiledState::InFlight(current) if Arc::ptr_eq(current, record))
                    {
                        *state = CompiledState::Terminal(record.prev().with(code.clone()));
                    }
                }
                record.complete(code.clone());
                self.stats.count_completed();
                debug!(
                    "{}: compiled {} @ {} ({} bytes)",
                    compiler.name(),
                    method.name(),
                    code.code_start,
                    code.code_size
                );
                Ok(code)
            }
            Err(source) => {
                self.stats.count_failure(source.is_bailout());
                Err(CompilationError {
                    method: method.name().to_string(),
                    compiler: compiler.name().to_string(),
                    source,
                })
            }
        }
    }

    /// Select the compiler for a fresh compilation of `method`.
    ///
    /// An unsafe/low-level method is always given to the optimizing compiler;
    /// the baseline compiler cannot produce correct code for it.  Otherwise
    /// an explicit nature request is honored, then per-method directives,
    /// then the process-wide default.
    fn select_compiler(
        &self,
        method: &MethodRef,
        nature: Option<Nature>,
    ) -> Arc<dyn RuntimeCompiler> {
        if method.is_unsafe() {
            assert!(
                nature != Some(Nature::Baseline),
                "cannot produce baseline version of {}",
                method.name()
            );
            trace!(
                "{} selected to compile {}, reason: unsafe",
                self.optimizing_compiler.name(),
                method.name()
            );
            return self.optimizing_compiler.clone();
        }

        let mut compiler = match nature {
            Some(Nature::Baseline) => self
                .baseline_compiler
                .clone()
                .expect("baseline compilation requested but no baseline compiler is configured"),
            Some(Nature::Optimizing) => self.optimizing_compiler.clone(),
            None => self.default_compiler.clone(),
        };

        if let Some(name) = self.directives.compiler_for(method.name()) {
            if self.optimizing_compiler.matches(name) {
                compiler = self.optimizing_compiler.clone();
            } else if let Some(baseline) = &self.baseline_compiler {
                if baseline.matches(name) {
                    compiler = baseline.clone();
                }
            }
        }

        compiler
    }

    /// The compiler to use for the failover retry: the other one of the
    /// configured pair.
    fn select_retry_compiler(&self, previous: &Arc<dyn RuntimeCompiler>) -> Arc<dyn RuntimeCompiler> {
        if Arc::ptr_eq(previous, &self.optimizing_compiler) {
            self.baseline_compiler
                .clone()
                .expect("failover requires a baseline compiler")
        } else {
            self.optimizing_compiler.clone()
        }
    }

    /// Arm `method`'s entry counter if this configuration recompiles at all.
    pub fn arm_profile(&self, method: &MethodRef) {
        if self.recompilation_threshold != 0 && self.baseline_compiler.is_some() {
            method.profile.arm(self.recompilation_threshold);
        }
    }

    /// Handle an entry-counter overflow reported for a profiled method.  Must
    /// be called on the thread that observed the overflow.  Requests an
    /// optimizing recompilation unless one cannot be started right now, in
    /// which case the counter is postponed instead.
    pub fn instrumentation_counter_overflow(&self, method: &MethodRef) {
        if IN_COMPILER.with(|flag| flag.get()) {
            trace!(
                "not recompiling {}: overflow observed inside a compiler",
                method.name()
            );
            method.profile.postpone(SHORT_RECOUNT);
            return;
        }
        if method.is_compilation_pending() {
            // A newer compiled version may be on the way already.
            method.profile.postpone(LONG_RECOUNT);
            return;
        }
        debug!("entry counter overflow for {}", method.name());
        match self.compile(method, Some(Nature::Optimizing)) {
            Ok(_) => method.profile.disarm(),
            Err(error) => {
                // Optimization failed; stay with the baseline code.  The
                // postponed counter keeps the next overflow a while away.
                debug!("{}", error);
                method.profile.postpone(LONG_RECOUNT);
            }
        }
    }

    /// Start background compilation: requests submitted with
    /// [`CompilationBroker::submit`] are drained by `threads` dedicated
    /// worker threads.  The workers go through [`CompilationBroker::compile`]
    /// and therefore observe the same per-method in-flight coalescing as
    /// synchronous requesters.
    pub fn enable_background(self: &Arc<Self>, threads: usize) {
        let mut background = self.background.lock().unwrap();
        if background.is_some() {
            return;
        }
        *background = Some(queue::spawn_workers(self, threads));
    }

    /// Queue `method` for asynchronous compilation.  Falls back to
    /// synchronous compilation when background workers are not enabled.
    pub fn submit(&self, method: MethodRef, nature: Option<Nature>) {
        let background = self.background.lock().unwrap();
        match &*background {
            Some(sender) => {
                // The worker threads live as long as the broker; a send can
                // only fail while the broker is being dropped.
                let _ = sender.send(CompileRequest { method, nature });
            }
            None => {
                drop(background);
                if let Err(error) = self.compile(&method, nature) {
                    warn!("{}", error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::CompilationStats;
    use crate::util::Address;
    use crate::vm::{flags, Method, TargetCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedCompiler {
        name: &'static str,
        nature: Nature,
        compiles: AtomicUsize,
    }

    impl FixedCompiler {
        fn new(name: &'static str, nature: Nature) -> Arc<FixedCompiler> {
            Arc::new(FixedCompiler {
                name,
                nature,
                compiles: AtomicUsize::new(0),
            })
        }
    }

    impl RuntimeCompiler for FixedCompiler {
        fn name(&self) -> &str {
            self.name
        }
        fn nature(&self) -> Nature {
            self.nature
        }
        fn compile(
            &self,
            method: &MethodRef,
            _is_deopt: bool,
            _stats: &CompilationStats,
        ) -> Result<CodeHandle, CompileError> {
            let n = self.compiles.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TargetCode {
                method_name: method.name().to_string(),
                nature: self.nature,
                code_start: Address::from_raw(0x10000 + n as u64 * 0x100),
                code_size: 64,
            }))
        }
    }

    fn broker_pair() -> (Arc<FixedCompiler>, Arc<FixedCompiler>, Arc<CompilationBroker>) {
        let baseline = FixedCompiler::new("t1", Nature::Baseline);
        let opt = FixedCompiler::new("opt", Nature::Optimizing);
        let broker = CompilationBroker::new(
            Some(baseline.clone()),
            opt.clone(),
            &Options::default(),
        );
        (baseline, opt, broker)
    }

    #[test]
    fn default_compiler_is_baseline() {
        let (baseline, _opt, broker) = broker_pair();
        let method = Method::new(1, "t.C.m()", 0);
        let code = broker.compile(&method, None).unwrap();
        assert_eq!(code.nature, Nature::Baseline);
        assert_eq!(baseline.compiles.load(Ordering::SeqCst), 1);
        assert_eq!(broker.mode(), "mixed mode, baseline-compile first");
    }

    #[test]
    fn optimize_first_overrides_default() {
        let baseline = FixedCompiler::new("t1", Nature::Baseline);
        let opt = FixedCompiler::new("opt", Nature::Optimizing);
        let mut options = Options::default();
        options.optimize_first = true;
        let broker = CompilationBroker::new(Some(baseline), opt.clone(), &options);
        let method = Method::new(1, "t.C.m()", 0);
        assert_eq!(broker.compile(&method, None).unwrap().nature, Nature::Optimizing);
        assert_eq!(broker.mode(), "mixed mode, optimize first");
    }

    #[test]
    fn unsafe_method_forces_optimizing() {
        let (baseline, opt, broker) = broker_pair();
        let method = Method::new(1, "t.C.peek()", flags::UNSAFE);
        let code = broker.compile(&method, None).unwrap();
        assert_eq!(code.nature, Nature::Optimizing);
        assert_eq!(baseline.compiles.load(Ordering::SeqCst), 0);
        assert_eq!(opt.compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nature_request_is_honored() {
        let (_baseline, opt, broker) = broker_pair();
        let method = Method::new(1, "t.C.m()", 0);
        let code = broker.compile(&method, Some(Nature::Optimizing)).unwrap();
        assert_eq!(code.nature, Nature::Optimizing);
        assert_eq!(opt.compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn directives_override_default() {
        let baseline = FixedCompiler::new("t1", Nature::Baseline);
        let opt = FixedCompiler::new("opt", Nature::Optimizing);
        let mut options = Options::default();
        options.compile_directives = "acme.util:opt".parse().unwrap();
        let broker = CompilationBroker::new(Some(baseline.clone()), opt, &options);
        let method = Method::new(1, "com.acme.util.Strings.hash()", 0);
        assert_eq!(broker.compile(&method, None).unwrap().nature, Nature::Optimizing);
        assert_eq!(baseline.compiles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completed_code_becomes_current() {
        let (_baseline, _opt, broker) = broker_pair();
        let method = Method::new(1, "t.C.m()", 0);
        assert!(method.current_code(None).is_none());
        let code = broker.compile(&method, None).unwrap();
        let current = method.current_code(None).unwrap();
        assert!(Arc::ptr_eq(&code, &current));
    }

    #[test]
    fn counter_overflow_promotes_to_optimizing() {
        let (_baseline, opt, broker) = broker_pair();
        let method = Method::new(1, "t.C.hot()", 0);
        broker.arm_profile(&method);
        assert!(method.profile.is_armed());
        broker.compile(&method, None).unwrap();

        broker.instrumentation_counter_overflow(&method);
        assert_eq!(opt.compiles.load(Ordering::SeqCst), 1);
        assert_eq!(
            method.current_code(None).unwrap().nature,
            Nature::Optimizing
        );
        // Promotion succeeded; the counter stops.
        assert!(!method.profile.is_armed());
    }

    #[test]
    fn optimizing_only_mode() {
        let opt = FixedCompiler::new("opt", Nature::Optimizing);
        let broker = CompilationBroker::new(None, opt, &Options::default());
        assert_eq!(broker.mode(), "optimizing-only");
        let method = Method::new(1, "t.C.m()", 0);
        assert_eq!(broker.compile(&method, None).unwrap().nature, Nature::Optimizing);
        // No baseline compiler, so profiles never arm.
        broker.arm_profile(&method);
        assert!(!method.profile.is_armed());
    }
}

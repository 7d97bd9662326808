//! Concurrency properties of the compilation scheduler: request coalescing
//! between racing threads, failover between the configured compilers, and
//! the compiled-state reset after a terminal failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use vmprobe::compile::{CompilationBroker, CompilationStats};
use vmprobe::util::address::Address;
use vmprobe::util::options::Options;
use vmprobe::vm::{
    CodeHandle, CompileError, Method, MethodRef, Nature, RuntimeCompiler, TargetCode,
};

/// A compiler that succeeds after an optional delay, failing its first
/// `fail_first` invocations.
struct TestCompiler {
    name: &'static str,
    nature: Nature,
    delay: Duration,
    fail_first: usize,
    bailout: bool,
    compiles: AtomicUsize,
}

impl TestCompiler {
    fn new(name: &'static str, nature: Nature) -> TestCompiler {
        TestCompiler {
            name,
            nature,
            delay: Duration::ZERO,
            fail_first: 0,
            bailout: false,
            compiles: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> TestCompiler {
        self.delay = delay;
        self
    }

    fn failing(mut self, times: usize, bailout: bool) -> TestCompiler {
        self.fail_first = times;
        self.bailout = bailout;
        self
    }

    fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl RuntimeCompiler for TestCompiler {
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
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if n < self.fail_first {
            return if self.bailout {
                Err(CompileError::Bailout(format!("{} declined", self.name)))
            } else {
                Err(CompileError::Fatal(format!("{} broke", self.name)))
            };
        }
        Ok(Arc::new(TargetCode {
            method_name: method.name().to_string(),
            nature: self.nature,
            code_start: Address::from_raw(0x4_0000 + n as u64 * 0x100),
            code_size: 128,
        }))
    }
}

fn broker_with(
    baseline: TestCompiler,
    optimizing: TestCompiler,
) -> (Arc<TestCompiler>, Arc<TestCompiler>, Arc<CompilationBroker>) {
    let baseline = Arc::new(baseline);
    let optimizing = Arc::new(optimizing);
    let broker = CompilationBroker::new(
        Some(baseline.clone()),
        optimizing.clone(),
        &Options::default(),
    );
    (baseline, optimizing, broker)
}

#[test]
fn racing_requesters_share_one_compile() {
    let (baseline, _opt, broker) = broker_with(
        TestCompiler::new("t1", Nature::Baseline).with_delay(Duration::from_millis(150)),
        TestCompiler::new("opt", Nature::Optimizing),
    );
    let method = Method::new(1, "t.C.contended()", 0);

    const THREADS: usize = 8;
    let barrier = Barrier::new(THREADS);
    let results: Vec<CodeHandle> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let broker = &broker;
                let method = &method;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    broker.compile(method, None).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Exactly one physical compile, and every thread got the identical handle.
    assert_eq!(baseline.compile_count(), 1);
    for code in &results {
        assert!(Arc::ptr_eq(code, &results[0]));
    }
    assert!(Arc::ptr_eq(&method.current_code(None).unwrap(), &results[0]));
}

#[test]
fn bailout_fails_over_to_the_other_compiler() {
    let (baseline, opt, broker) = broker_with(
        TestCompiler::new("t1", Nature::Baseline).failing(1, true),
        TestCompiler::new("opt", Nature::Optimizing),
    );
    let method = Method::new(1, "t.C.tricky()", 0);

    let code = broker.compile(&method, None).unwrap();
    // One attempt per compiler: the bailout triggered exactly one retry,
    // performed with the other configured compiler.
    assert_eq!(baseline.compile_count(), 1);
    assert_eq!(opt.compile_count(), 1);
    assert_eq!(code.nature, Nature::Optimizing);
    assert_eq!(broker.stats.bailouts.load(Ordering::SeqCst), 1);
    assert_eq!(broker.stats.completed.load(Ordering::SeqCst), 1);
}

#[test]
fn joiners_see_the_failover_result() {
    let (baseline, opt, broker) = broker_with(
        TestCompiler::new("t1", Nature::Baseline)
            .with_delay(Duration::from_millis(150))
            .failing(1, true),
        TestCompiler::new("opt", Nature::Optimizing),
    );
    let method = Method::new(1, "t.C.joined()", 0);

    const THREADS: usize = 4;
    let barrier = Barrier::new(THREADS);
    let results: Vec<CodeHandle> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let broker = &broker;
                let method = &method;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    broker.compile(method, None).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // The losing threads joined the record during the first (bailing)
    // attempt and observed only the terminal outcome of the retry.
    assert_eq!(baseline.compile_count(), 1);
    assert_eq!(opt.compile_count(), 1);
    for code in &results {
        assert_eq!(code.nature, Nature::Optimizing);
        assert!(Arc::ptr_eq(code, &results[0]));
    }
}

#[test]
fn terminal_failure_resets_the_compiled_state() {
    let (baseline, opt, broker) = broker_with(
        TestCompiler::new("t1", Nature::Baseline).failing(1, true),
        TestCompiler::new("opt", Nature::Optimizing).failing(1, false),
    );
    let method = Method::new(1, "t.C.doomed()", 0);

    let error = broker.compile(&method, None).unwrap_err();
    assert!(error.to_string().contains("t.C.doomed()"));
    assert_eq!(baseline.compile_count(), 1);
    assert_eq!(opt.compile_count(), 1);

    // The method's compiled state is empty again: no code, nothing pending.
    assert!(method.current_code(None).is_none());
    assert!(!method.is_compilation_pending());

    // The next request starts from scratch — and this time both compilers
    // are past their failures.
    let code = broker.compile(&method, None).unwrap();
    assert_eq!(code.nature, Nature::Baseline);
    assert_eq!(baseline.compile_count(), 2);
}

#[test]
fn failure_without_failover_is_terminal() {
    let baseline = Arc::new(TestCompiler::new("t1", Nature::Baseline).failing(usize::MAX, false));
    let optimizing = Arc::new(TestCompiler::new("opt", Nature::Optimizing));
    let mut options = Options::default();
    options.fail_over_compilation = false;
    let broker = CompilationBroker::new(Some(baseline.clone()), optimizing.clone(), &options);
    let method = Method::new(1, "t.C.m()", 0);

    assert!(broker.compile(&method, None).is_err());
    assert_eq!(baseline.compile_count(), 1);
    assert_eq!(optimizing.compile_count(), 0);
    assert!(method.current_code(None).is_none());
}

#[test]
fn natured_request_does_not_fail_over() {
    let (baseline, opt, broker) = broker_with(
        TestCompiler::new("t1", Nature::Baseline).failing(usize::MAX, true),
        TestCompiler::new("opt", Nature::Optimizing),
    );
    let method = Method::new(1, "t.C.m()", 0);

    assert!(broker.compile(&method, Some(Nature::Baseline)).is_err());
    assert_eq!(baseline.compile_count(), 1);
    assert_eq!(opt.compile_count(), 0);
}

#[test]
fn panicking_compiler_releases_joiners() {
    struct PanickingCompiler;

    impl RuntimeCompiler for PanickingCompiler {
        fn name(&self) -> &str {
            "panicky"
        }
        fn nature(&self) -> Nature {
            Nature::Optimizing
        }
        fn compile(
            &self,
            _method: &MethodRef,
            _is_deopt: bool,
            _stats: &CompilationStats,
        ) -> Result<CodeHandle, CompileError> {
            thread::sleep(Duration::from_millis(100));
            panic!("compiler blew up");
        }
    }

    let broker = CompilationBroker::new(None, Arc::new(PanickingCompiler), &Options::default());
    let method = Method::new(1, "t.C.m()", 0);

    thread::scope(|scope| {
        let joiner = {
            let broker = &broker;
            let method = &method;
            scope.spawn(move || {
                thread::sleep(Duration::from_millis(30));
                broker.compile(method, None)
            })
        };
        // This thread installs the record and compiles; the panic propagates
        // to it, while the joiner is released with a terminal failure rather
        // than blocking forever.
        let winner = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            broker.compile(&method, None)
        }));
        assert!(winner.is_err());
        assert!(joiner.join().unwrap().is_err());
    });
    assert!(method.current_code(None).is_none());
    assert!(!method.is_compilation_pending());
}

#[test]
fn distinct_methods_compile_independently() {
    let (baseline, _opt, broker) = broker_with(
        TestCompiler::new("t1", Nature::Baseline),
        TestCompiler::new("opt", Nature::Optimizing),
    );

    let methods: Vec<_> = (0..4)
        .map(|i| Method::new(1, format!("t.C.m{}()", i), 0))
        .collect();
    thread::scope(|scope| {
        for method in &methods {
            let broker = &broker;
            scope.spawn(move || broker.compile(method, None).unwrap());
        }
    });

    assert_eq!(baseline.compile_count(), 4);
    for method in &methods {
        assert!(method.current_code(None).is_some());
    }
}

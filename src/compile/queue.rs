use std::sync::{Arc, Weak};
use std::thread;

use crossbeam::channel;

use crate::compile::broker::CompilationBroker;
use crate::vm::{MethodRef, Nature};

/// A pending request on the background compilation queue.
pub(crate) struct CompileRequest {
    pub method: MethodRef,
    pub nature: Option<Nature>,
}

/// Spawn the background compilation workers and return the queue's sender.
///
/// Each worker drains the queue and hands every request to
/// [`CompilationBroker::compile`], so the per-method record install/compile/
/// complete sequence (and with it the at-most-one-in-flight invariant) is
/// identical to the synchronous path.  Workers hold only a weak reference to
/// the broker and exit when the queue disconnects (the broker was dropped).
pub(crate) fn spawn_workers(
    broker: &Arc<CompilationBroker>,
    threads: usize,
) -> channel::Sender<CompileRequest> {
    let (sender, receiver) = channel::unbounded::<CompileRequest>();
    for ordinal in 0..threads {
        let receiver = receiver.clone();
        let broker: Weak<CompilationBroker> = Arc::downgrade(broker);
        thread::Builder::new()
            .name(format!("compile-worker-{}", ordinal))
            .spawn(move || {
                debug!("compile worker {} started", ordinal);
                while let Ok(request) = receiver.recv() {
                    let Some(broker) = broker.upgrade() else {
                        break;
                    };
                    broker.stats.background
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if let Err(error) = broker.compile(&request.method, request.nature) {
                        warn!("background {}", error);
                    }
                }
                debug!("compile worker {} exiting", ordinal);
            })
            .expect("failed to spawn compile worker");
    }
    sender
}

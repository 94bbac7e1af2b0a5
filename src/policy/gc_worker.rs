//! An optional background thread that periodically drives collection and
//! compaction on behalf of a [`CollectedSpace`](super::CollectedSpace), so
//! a mutator that never calls `collect_garbage` itself still has its
//! garbage reclaimed.
//!
//! The worker is a plain OS thread with a stop flag, not a cooperative
//! task on some async runtime; nothing in this crate assumes one exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::policy::collected_space::CollectedSpace;
use crate::util::options::GcWorkerSpec;

/// Handle to a running background GC thread. Dropping this without calling
/// [`GcWorker::stop`] leaves the thread running detached; `stop` is the
/// normal shutdown path and is what `CollectedSpace::stop_gc` calls.
pub struct GcWorker {
    should_run: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GcWorker {
    pub(crate) fn spawn(cs: Arc<CollectedSpace>, spec: GcWorkerSpec) -> Self {
        let should_run = Arc::new(AtomicBool::new(true));
        let worker_should_run = should_run.clone();
        let handle = std::thread::spawn(move || {
            log::debug!("gc worker started (delay={:?}, shift={}, trigger={})", spec.delay, spec.shift, spec.shift_trigger);
            while worker_should_run.load(Ordering::Acquire) {
                std::thread::sleep(spec.delay);
                if !worker_should_run.load(Ordering::Acquire) {
                    break;
                }
                if cs.allocations_since_last_gc() > spec.shift_trigger {
                    cs.collect_garbage();
                    if spec.shift {
                        cs.try_full_shift();
                    }
                }
            }
            log::debug!("gc worker stopped");
        });
        GcWorker { should_run, handle: Some(handle) }
    }

    /// Signal the worker to stop and wait for its thread to exit.
    pub(crate) fn stop(mut self) {
        self.should_run.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

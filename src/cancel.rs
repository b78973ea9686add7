//! Cancellation of a running monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that asks a harness to stop its run.
///
/// Clones share the flag, so one clone can be handed to a harness and
/// another kept by whoever decides to cancel (a watchdog thread, a signal
/// handler, a test). The harness checks it once per loop iteration; on
/// cancellation the monitor gets SIGTERM, the pipes are drained and `wait()`
/// returns `WaitError::Cancelled`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

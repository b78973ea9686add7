//! Timing and buffering limits for a monitor run.

use std::time::Duration;

/// Limits applied while driving a monitor process.
///
/// When the timeout elapses the child is killed with SIGKILL, reaped,
/// and `WaitError::Timeout` is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Wall-clock timeout for the whole run, or `None` for no limit.
    ///
    /// Default: 30 seconds.
    pub timeout: Option<Duration>,

    /// Upper bound on a single readiness poll.
    ///
    /// This is how often the harness gets to check whether the child has
    /// exited while no descriptor is ready. Default: 100 ms.
    pub poll_interval: Duration,

    /// Maximum bytes read from one descriptor per tick.
    ///
    /// Default: 4096.
    pub chunk_size: usize,

    /// Consecutive idle ticks tolerated while draining after exit.
    ///
    /// A grandchild that inherited stdout can keep the pipe open after the
    /// monitor itself has exited; draining gives up after this many polls
    /// in a row see nothing. Default: 10.
    pub drain_idle_ticks: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            poll_interval: Duration::from_millis(100),
            chunk_size: 4096,
            drain_idle_ticks: 10,
        }
    }
}

impl Limits {
    /// Set the overall timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Run without an overall timeout.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set the readiness poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-tick read size. Zero is bumped to one byte.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Set the drain idle budget.
    pub fn with_drain_idle_ticks(mut self, ticks: u32) -> Self {
        self.drain_idle_ticks = ticks;
        self
    }

    /// Poll interval in whole milliseconds, as `poll(2)` wants it.
    pub(crate) fn poll_timeout_ms(&self) -> libc::c_int {
        self.poll_interval
            .as_millis()
            .min(libc::c_int::MAX as u128) as libc::c_int
    }
}

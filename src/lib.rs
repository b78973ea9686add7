//! # monitor_harness
//!
//! Deterministic subprocess I/O harness for testing CUPS port monitors and
//! backends.
//!
//! `monitor_harness` starts a target program with piped stdin, stdout and
//! stderr plus an extra side-channel descriptor, feeds it a print job,
//! collects everything it writes and classifies how it exited. All pipes
//! are pumped from one readiness-polling loop, so a target that writes
//! before it reads (or floods stderr while its stdout is full) can never
//! deadlock the test.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use monitor_harness::{HarnessConfig, PrintJob, ProcessHarness};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Target comes from TEST_MONITOR_EXEC
//! let config = HarnessConfig::builder()
//!     .target_from_env()?
//!     .device_uri("socket://printer:9100")
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//!
//! let job = PrintJob::from_buffer(b"%!PS-Adobe-3.0\nshowpage\n".to_vec()).with_copies(2);
//!
//! let mut harness = ProcessHarness::spawn(&config, job)?;
//! harness.wait()?;
//! println!("device got {} bytes", harness.stdout().unwrap_or_default().len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Principles
//!
//! - **One loop, no threads**: non-blocking pipes, bounded `poll`, non-blocking `waitpid`
//! - **Exact descriptor layout**: the child sees 0, 1, 2 and the side-channel, nothing else
//! - **Explicit configuration**: the harness only takes a built `HarnessConfig`
//! - **Nothing leaks**: every exit path releases descriptors and reaps the child
//!
//! ## Platform Support
//!
//! Unix only (Linux, macOS, the BSDs). The harness is built on `fork`,
//! `execve`, `poll` and descriptor numbering, none of which exist on Windows.

#[cfg(windows)]
compile_error!(
    "monitor_harness does not support Windows. \
     It relies on fork/execve, poll(2) and fixed descriptor numbers."
);

mod cancel;
mod channel;
mod config;
pub mod diff;
mod error;
mod harness;
mod job;
mod limits;
mod mux;
mod output;
mod spawn;
mod target;

// Public API
pub use cancel::CancelToken;
pub use channel::{Channel, ChannelRole, Direction};
pub use config::{HarnessConfig, HarnessConfigBuilder, DEFAULT_SIDE_CHANNEL_FD, MONITOR_EXEC_VAR};
pub use diff::{assert_bytes_eq, describe_difference};
pub use error::{ConfigError, ExitDisposition, HarnessError, SpawnError, WaitError};
pub use harness::{HarnessState, ProcessHarness};
pub use job::PrintJob;
pub use limits::Limits;
pub use mux::{Multiplexer, Tick};
pub use output::Output;
pub use spawn::{FdAction, ParentEnd, PreparedSpawn, SpawnRequest, SpawnedChild};
pub use target::resolve_target;

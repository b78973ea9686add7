//! Error types for monitor_harness.
//!
//! Errors are split by the phase that produces them:
//! - [`ConfigError`]: bad configuration or job, detected before anything is spawned
//! - [`SpawnError`]: the OS refused to set up the child (pipes, fork, exec)
//! - [`WaitError`]: the child ran, but the run did not end in a clean exit

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// How the child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitDisposition {
    /// The process called `exit` with this code.
    Exited(i32),
    /// The process was terminated by this signal number.
    Signaled(i32),
}

impl ExitDisposition {
    /// Decode a raw `waitpid` status word.
    ///
    /// Returns `None` for statuses that do not describe termination
    /// (stopped or continued children).
    pub fn from_wait_status(status: libc::c_int) -> Option<Self> {
        if libc::WIFEXITED(status) {
            Some(ExitDisposition::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Some(ExitDisposition::Signaled(libc::WTERMSIG(status)))
        } else {
            None
        }
    }

    /// True only for `Exited(0)`.
    pub fn success(&self) -> bool {
        matches!(self, ExitDisposition::Exited(0))
    }

    /// The exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitDisposition::Exited(code) => Some(*code),
            ExitDisposition::Signaled(_) => None,
        }
    }

    /// The terminating signal, if the process was killed by one.
    pub fn signal(&self) -> Option<i32> {
        match self {
            ExitDisposition::Exited(_) => None,
            ExitDisposition::Signaled(sig) => Some(*sig),
        }
    }
}

impl fmt::Display for ExitDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitDisposition::Exited(code) => write!(f, "monitor exited with status {code}"),
            ExitDisposition::Signaled(sig) => write!(f, "monitor killed by signal {sig}"),
        }
    }
}

/// Configuration or job error detected before spawning.
///
/// No process has been started and no descriptor allocated when one of
/// these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    // Target binary errors
    /// `TEST_MONITOR_EXEC` (or an explicit target) was not provided
    #[error("TEST_MONITOR_EXEC is not set")]
    TargetUnset,

    /// Target binary does not exist
    #[error("TEST_MONITOR_EXEC file not found: {path}")]
    TargetNotFound { path: String },

    /// Failed to canonicalize or stat the target path
    #[error("failed to resolve target path {path}: {reason}")]
    TargetCanonicalizeFailed { path: String, reason: String },

    /// Target path points to a directory
    #[error("target is a directory: {path}")]
    TargetIsDirectory { path: String },

    /// Target is not a regular file
    #[error("target is not a regular file: {path}")]
    TargetNotRegularFile { path: String },

    /// Target is not executable by the current user
    #[error("target is not executable: {path}")]
    TargetNotExecutable { path: String },

    // Job errors
    /// Both an input buffer and an input file were given
    #[error("input buffer and input file are mutually exclusive")]
    InputConflict,

    /// Neither an input buffer nor an input file was given
    #[error("no input source: provide an input buffer or an input file")]
    InputMissing,

    /// The input file does not exist or is not a regular file
    #[error("input file not found: {path}")]
    InputFileNotFound { path: String },

    /// Copy count must be at least one
    #[error("copy count must be at least 1, got {copies}")]
    InvalidCopies { copies: u32 },

    // Spawn request errors
    /// Argument vector is empty
    #[error("argument vector must not be empty")]
    EmptyArgv,

    /// Environment key is empty or contains `=`
    #[error("invalid environment key: {key:?}")]
    InvalidEnvKey { key: String },

    /// A string handed to execve contains an interior NUL byte
    #[error("{what} contains a NUL byte")]
    NulByte { what: &'static str },

    /// Two remappings target the same child descriptor
    #[error("child descriptor {fd} is mapped more than once")]
    DuplicateFd { fd: i32 },

    /// A reserved child descriptor has no mapping
    #[error("child descriptor {fd} has no mapping")]
    MissingFd { fd: i32 },

    /// A child descriptor number is negative
    #[error("invalid child descriptor number: {fd}")]
    InvalidFd { fd: i32 },
}

/// The OS failed to set up or start the child.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Pipe allocation failed (usually descriptor exhaustion)
    #[error("failed to allocate pipe: {source}")]
    Pipe { source: std::io::Error },

    /// fork(2) failed
    #[error("failed to fork: {source}")]
    Fork { source: std::io::Error },

    /// execve(2) failed in the child; the child aborted
    #[error("failed to execute {program}: {}", os_reason(.errno))]
    Exec { program: String, errno: i32 },

    /// Descriptor setup in the parent failed
    #[error("failed to prepare descriptors: {source}")]
    Setup { source: std::io::Error },
}

/// The run did not end with the child exiting cleanly.
#[derive(Debug, Error)]
pub enum WaitError {
    /// Child exited with a non-zero code or was killed by a signal
    #[error("{disposition}")]
    ChildFailed {
        disposition: ExitDisposition,
        stderr: String,
    },

    /// Child exceeded the configured timeout and was killed
    #[error("monitor timed out after {elapsed:?} (limit: {limit:?})")]
    Timeout { limit: Duration, elapsed: Duration },

    /// The run was cancelled and the child terminated
    #[error("monitor run cancelled")]
    Cancelled,

    /// `wait()` was called on a harness that has already been waited on
    #[error("wait() already called on this harness")]
    AlreadyWaited,

    /// Polling, reading or reaping failed
    #[error("i/o error while driving monitor: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl WaitError {
    /// The child's exit disposition, for `ChildFailed`.
    pub fn disposition(&self) -> Option<ExitDisposition> {
        match self {
            WaitError::ChildFailed { disposition, .. } => Some(*disposition),
            _ => None,
        }
    }
}

fn os_reason(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

/// Combined error type for the spawn-and-wait flow.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl HarnessError {
    /// The child's exit disposition, if this is a `ChildFailed` error.
    pub fn disposition(&self) -> Option<ExitDisposition> {
        match self {
            HarnessError::Wait(err) => err.disposition(),
            _ => None,
        }
    }
}

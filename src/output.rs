//! Captured output of a finished monitor run.

use crate::error::ExitDisposition;
use std::borrow::Cow;

/// Everything the monitor produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Bytes written to the device (the monitor's stdout).
    pub stdout: Vec<u8>,

    /// Status and log lines (the monitor's stderr).
    pub stderr: Vec<u8>,

    /// How the monitor terminated.
    pub status: ExitDisposition,
}

impl Output {
    /// Get stdout as a string (lossy UTF-8 conversion).
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr as a string (lossy UTF-8 conversion).
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Check if the monitor exited with status 0.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stderr lines carrying a CUPS message prefix such as `ERROR:` or `DEBUG:`.
    ///
    /// Each line is decoded on its own, lossily, so one bad byte only
    /// affects the line it is in.
    pub fn status_lines<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = Cow<'a, str>> + 'a {
        self.stderr
            .split(|&b| b == b'\n')
            .filter_map(move |line| line.strip_prefix(prefix.as_bytes()))
            .map(|rest| match String::from_utf8_lossy(rest) {
                Cow::Borrowed(text) => Cow::Borrowed(text.trim()),
                Cow::Owned(text) => Cow::Owned(text.trim().to_string()),
            })
    }
}

//! Print job request.

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// A print job to feed through the monitor.
///
/// Exactly one input source must be set: an in-memory buffer that is piped
/// to the monitor's stdin, or a file whose path is passed as the last
/// argument. The job is validated when the harness is spawned.
#[derive(Debug, Clone)]
pub struct PrintJob {
    /// Bytes to write to the monitor's stdin.
    pub buffer: Option<Vec<u8>>,

    /// File the monitor should read instead of stdin.
    pub file: Option<PathBuf>,

    /// Number of copies requested. Must be at least 1.
    ///
    /// Passed to the monitor as an argument; the harness never repeats input.
    pub copies: u32,
}

/// Where the monitor's input comes from, after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputSource<'a> {
    Buffer(&'a [u8]),
    File(&'a Path),
}

impl PrintJob {
    /// A single-copy job reading from an in-memory buffer.
    pub fn from_buffer(buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            buffer: Some(buffer.into()),
            file: None,
            copies: 1,
        }
    }

    /// A single-copy job reading from a file.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            buffer: None,
            file: Some(path.into()),
            copies: 1,
        }
    }

    /// Set the copy count.
    pub fn with_copies(mut self, copies: u32) -> Self {
        self.copies = copies;
        self
    }

    /// Set the input buffer.
    pub fn with_buffer(mut self, buffer: impl Into<Vec<u8>>) -> Self {
        self.buffer = Some(buffer.into());
        self
    }

    /// Set the input file.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Check the copy count and pick the input source.
    pub(crate) fn input_source(&self) -> Result<InputSource<'_>, ConfigError> {
        if self.copies == 0 {
            return Err(ConfigError::InvalidCopies {
                copies: self.copies,
            });
        }

        match (&self.buffer, &self.file) {
            (Some(_), Some(_)) => Err(ConfigError::InputConflict),
            (None, None) => Err(ConfigError::InputMissing),
            (Some(buffer), None) => Ok(InputSource::Buffer(buffer)),
            (None, Some(path)) => {
                if !path.is_file() {
                    return Err(ConfigError::InputFileNotFound {
                        path: path.display().to_string(),
                    });
                }
                Ok(InputSource::File(path))
            }
        }
    }
}

impl Default for PrintJob {
    fn default() -> Self {
        Self {
            buffer: None,
            file: None,
            copies: 1,
        }
    }
}

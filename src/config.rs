//! Harness configuration.
//!
//! `HarnessConfig` captures everything about a run that is not the job
//! itself: which monitor binary to execute, the CUPS argument and
//! environment contract handed to it, the side-channel descriptor number
//! and the run limits. The target path is resolved once, at build time.

use crate::error::ConfigError;
use crate::limits::Limits;
use crate::target::resolve_target;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the monitor binary under test.
pub const MONITOR_EXEC_VAR: &str = "TEST_MONITOR_EXEC";

/// Descriptor CUPS hands backends for the back-channel.
pub const DEFAULT_SIDE_CHANNEL_FD: i32 = 3;

const DEFAULT_DEVICE_URI: &str = "socket://printer:9100";
const DEFAULT_PRINTER: &str = "test-printer";
const DEFAULT_CONTENT_TYPE: &str = "application/vnd.cups-postscript";

/// Resolved configuration for running a monitor.
///
/// Create using `HarnessConfig::builder()` or `HarnessConfig::from_env()`.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    target: PathBuf,
    device_uri: String,
    printer: String,
    content_type: String,
    job_id: String,
    user: String,
    title: String,
    options: String,
    extra_env: BTreeMap<String, String>,
    side_channel_fd: i32,
    limits: Limits,
}

impl HarnessConfig {
    /// Create a new configuration builder.
    pub fn builder() -> HarnessConfigBuilder {
        HarnessConfigBuilder::new()
    }

    /// Default configuration with the target taken from `TEST_MONITOR_EXEC`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().target_from_env()?.build()
    }

    /// Canonical path of the monitor binary.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Descriptor number of the side-channel in the child.
    pub fn side_channel_fd(&self) -> i32 {
        self.side_channel_fd
    }

    /// Run limits.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Build the argument vector for a job.
    ///
    /// The CUPS contract is `uri job-id user title copies options [file]`,
    /// where the device URI takes the place of `argv[0]`. The file path is passed byte for byte, whatever its encoding.
    pub fn argv(&self, copies: u32, file: Option<&Path>) -> Vec<OsString> {
        let mut argv: Vec<OsString> = vec![
            self.device_uri.clone().into(),
            self.job_id.clone().into(),
            self.user.clone().into(),
            self.title.clone().into(),
            copies.to_string().into(),
            self.options.clone().into(),
        ];
        if let Some(path) = file {
            argv.push(path.as_os_str().to_owned());
        }
        argv
    }

    /// Build the environment handed to the monitor.
    ///
    /// Nothing from the harness's own environment is inherited.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = self.extra_env.clone();
        env.insert("DEVICE_URI".to_string(), self.device_uri.clone());
        env.insert("PRINTER".to_string(), self.printer.clone());
        env.insert("FINAL_CONTENT_TYPE".to_string(), self.content_type.clone());
        env
    }
}

/// Builder for `HarnessConfig`.
#[derive(Debug, Clone)]
pub struct HarnessConfigBuilder {
    target: Option<PathBuf>,
    device_uri: String,
    printer: String,
    content_type: String,
    job_id: String,
    user: String,
    title: String,
    options: String,
    extra_env: BTreeMap<String, String>,
    side_channel_fd: i32,
    limits: Limits,
}

impl HarnessConfigBuilder {
    /// Create a builder with the default job parameters.
    pub fn new() -> Self {
        Self {
            target: None,
            device_uri: DEFAULT_DEVICE_URI.to_string(),
            printer: DEFAULT_PRINTER.to_string(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            job_id: "1".to_string(),
            user: "lpr".to_string(),
            title: "test-job".to_string(),
            options: String::new(),
            extra_env: BTreeMap::new(),
            side_channel_fd: DEFAULT_SIDE_CHANNEL_FD,
            limits: Limits::default(),
        }
    }

    /// Set the monitor binary. Resolved at build time.
    pub fn target(mut self, path: impl Into<PathBuf>) -> Self {
        self.target = Some(path.into());
        self
    }

    /// Take the monitor binary from `TEST_MONITOR_EXEC`.
    ///
    /// # Errors
    ///
    /// `TargetUnset` if the variable is not set or empty.
    pub fn target_from_env(self) -> Result<Self, ConfigError> {
        match std::env::var_os(MONITOR_EXEC_VAR) {
            Some(path) if !path.is_empty() => Ok(self.target(path)),
            _ => Err(ConfigError::TargetUnset),
        }
    }

    /// Set the device URI (`argv[0]` and `DEVICE_URI`).
    pub fn device_uri(mut self, uri: impl Into<String>) -> Self {
        self.device_uri = uri.into();
        self
    }

    /// Set the queue name (`PRINTER`).
    pub fn printer(mut self, printer: impl Into<String>) -> Self {
        self.printer = printer.into();
        self
    }

    /// Set `FINAL_CONTENT_TYPE`.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the job id argument.
    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    /// Set the user argument.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the title argument.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the options argument.
    pub fn options(mut self, options: impl Into<String>) -> Self {
        self.options = options.into();
        self
    }

    /// Add an extra environment variable.
    ///
    /// The three CUPS variables always win over extras with the same name.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// Set the side-channel descriptor number (default 3).
    pub fn side_channel_fd(mut self, fd: i32) -> Self {
        self.side_channel_fd = fd;
        self
    }

    /// Set the overall timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout = Some(timeout);
        self
    }

    /// Set all limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// - `TargetUnset` if no target was given
    /// - any target resolution error from the path check
    /// - `InvalidFd` if the side-channel number collides with stdio or is negative
    pub fn build(self) -> Result<HarnessConfig, ConfigError> {
        let target = self.target.ok_or(ConfigError::TargetUnset)?;
        let target = resolve_target(&target)?;

        if self.side_channel_fd <= libc::STDERR_FILENO {
            return Err(ConfigError::InvalidFd {
                fd: self.side_channel_fd,
            });
        }

        Ok(HarnessConfig {
            target,
            device_uri: self.device_uri,
            printer: self.printer,
            content_type: self.content_type,
            job_id: self.job_id,
            user: self.user,
            title: self.title,
            options: self.options,
            extra_env: self.extra_env,
            side_channel_fd: self.side_channel_fd,
            limits: self.limits,
        })
    }
}

impl Default for HarnessConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HarnessConfig {
        HarnessConfig::builder()
            .target("/bin/sh")
            .build()
            .expect("valid config")
    }

    #[test]
    fn test_builder_requires_target() {
        let result = HarnessConfig::builder().build();
        assert!(matches!(result, Err(ConfigError::TargetUnset)));
    }

    #[test]
    fn test_builder_resolves_target() {
        let result = HarnessConfig::builder().target("/nonexistent/monitor").build();
        assert!(matches!(result, Err(ConfigError::TargetNotFound { .. })));
    }

    #[test]
    fn test_side_channel_cannot_shadow_stdio() {
        let result = HarnessConfig::builder()
            .target("/bin/sh")
            .side_channel_fd(2)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidFd { fd: 2 })));
    }

    #[test]
    fn test_default_argv_for_piped_input() {
        let expected: Vec<OsString> = ["socket://printer:9100", "1", "lpr", "test-job", "1", ""]
            .into_iter()
            .map(OsString::from)
            .collect();
        assert_eq!(config().argv(1, None), expected);
    }

    #[test]
    fn test_file_argv_appends_path() {
        let argv = config().argv(3, Some(Path::new("/tmp/job.ps")));
        assert_eq!(argv.len(), 7);
        assert_eq!(argv[4], "3");
        assert_eq!(argv[6], "/tmp/job.ps");
    }

    #[test]
    fn test_file_argv_keeps_non_utf8_bytes() {
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new(std::ffi::OsStr::from_bytes(b"/tmp/job-\xff.ps"));
        let argv = config().argv(1, Some(path));
        assert_eq!(argv[6].as_bytes(), b"/tmp/job-\xff.ps");
    }

    #[test]
    fn test_env_contract() {
        let env = HarnessConfig::builder()
            .target("/bin/sh")
            .device_uri("usb://HP/LaserJet")
            .env_var("PRINTER", "ignored")
            .env_var("CUPS_SERVERROOT", "/etc/cups")
            .build()
            .unwrap()
            .env();

        assert_eq!(env.get("DEVICE_URI").unwrap(), "usb://HP/LaserJet");
        assert_eq!(env.get("PRINTER").unwrap(), "test-printer");
        assert_eq!(
            env.get("FINAL_CONTENT_TYPE").unwrap(),
            "application/vnd.cups-postscript"
        );
        assert_eq!(env.get("CUPS_SERVERROOT").unwrap(), "/etc/cups");
        assert_eq!(env.len(), 4);
    }
}

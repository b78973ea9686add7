//! Target binary resolution.
//!
//! The monitor under test is named by path, usually through
//! `TEST_MONITOR_EXEC`. Before anything is spawned the path is resolved
//! (symlinks followed) and checked to be a regular file the current user
//! may execute.

use crate::error::ConfigError;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Resolve a target path to the canonical path of an executable file.
///
/// Relative paths are resolved against the current directory.
///
/// # Errors
///
/// - `TargetNotFound` if nothing exists at `path`
/// - `TargetCanonicalizeFailed` for other resolution failures
/// - `TargetIsDirectory`, `TargetNotRegularFile`, `TargetNotExecutable`
///   if the file is not something execve can run
pub fn resolve_target(path: &Path) -> Result<PathBuf, ConfigError> {
    let path_str = path.display().to_string();

    let canonical = std::fs::canonicalize(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ConfigError::TargetNotFound {
            path: path_str.clone(),
        },
        _ => ConfigError::TargetCanonicalizeFailed {
            path: path_str.clone(),
            reason: e.to_string(),
        },
    })?;

    let metadata =
        std::fs::metadata(&canonical).map_err(|e| ConfigError::TargetCanonicalizeFailed {
            path: path_str.clone(),
            reason: e.to_string(),
        })?;

    if metadata.is_dir() {
        return Err(ConfigError::TargetIsDirectory { path: path_str });
    }
    if !metadata.is_file() {
        return Err(ConfigError::TargetNotRegularFile { path: path_str });
    }
    if !is_executable(&metadata) {
        return Err(ConfigError::TargetNotExecutable { path: path_str });
    }

    Ok(canonical)
}

/// Whether the execute bit applying to the current user is set.
fn is_executable(metadata: &Metadata) -> bool {
    let mode = metadata.permissions().mode();

    let uid = unsafe { libc::geteuid() };
    let gid = unsafe { libc::getegid() };

    // root may run anything with at least one execute bit
    if uid == 0 {
        return mode & 0o111 != 0;
    }
    if uid == metadata.uid() {
        return mode & 0o100 != 0;
    }
    if gid == metadata.gid() {
        return mode & 0o010 != 0;
    }
    mode & 0o001 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn test_missing_target() {
        let result = resolve_target(Path::new("/nonexistent/monitor"));
        assert!(matches!(result, Err(ConfigError::TargetNotFound { .. })));
    }

    #[test]
    fn test_directory_rejected() {
        let tmp = TempDir::new().unwrap();
        let result = resolve_target(tmp.path());
        assert!(matches!(result, Err(ConfigError::TargetIsDirectory { .. })));
    }

    #[test]
    fn test_device_file_rejected() {
        let result = resolve_target(Path::new("/dev/null"));
        assert!(matches!(
            result,
            Err(ConfigError::TargetNotRegularFile { .. })
        ));
    }

    #[test]
    fn test_non_executable_rejected() {
        // root bypasses the owner check, so only assert for ordinary users
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let file = write_script(tmp.path(), "monitor", 0o644);
        let result = resolve_target(&file);
        assert!(matches!(result, Err(ConfigError::TargetNotExecutable { .. })));
    }

    #[test]
    fn test_no_execute_bits_rejected_even_for_root() {
        let tmp = TempDir::new().unwrap();
        let file = write_script(tmp.path(), "monitor", 0o600);
        let result = resolve_target(&file);
        assert!(matches!(result, Err(ConfigError::TargetNotExecutable { .. })));
    }

    #[test]
    fn test_executable_accepted() {
        let tmp = TempDir::new().unwrap();
        let file = write_script(tmp.path(), "monitor", 0o755);
        let resolved = resolve_target(&file).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&file).unwrap());
    }

    #[test]
    fn test_symlink_resolves_to_real_file() {
        let tmp = TempDir::new().unwrap();
        let real = write_script(tmp.path(), "real_monitor", 0o755);
        let link = tmp.path().join("link");
        symlink(&real, &link).unwrap();

        let resolved = resolve_target(&link).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&real).unwrap());
    }

    #[test]
    fn test_broken_symlink_rejected() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("broken");
        symlink("/nonexistent/target", &link).unwrap();

        assert!(matches!(
            resolve_target(&link),
            Err(ConfigError::TargetNotFound { .. })
        ));
    }
}

//! Integration tests for monitor_harness.
//!
//! These tests drive real processes: the crate's own `echo-monitor` binary
//! and small shell scripts written into a temp directory.

use monitor_harness::{
    assert_bytes_eq, CancelToken, ConfigError, ExitDisposition, HarnessConfig, HarnessError,
    HarnessState, Limits, PrintJob, ProcessHarness, SpawnError, WaitError,
};
use proptest::prelude::*;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ECHO_MONITOR: &str = env!("CARGO_BIN_EXE_echo-monitor");

/// Helper to build a config running the echo monitor.
fn echo_config(options: &str) -> HarnessConfig {
    HarnessConfig::builder()
        .target(ECHO_MONITOR)
        .options(options)
        .timeout(Duration::from_secs(20))
        .build()
        .expect("valid config")
}

/// Helper to write an executable shell script.
fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn script_config(path: &Path) -> HarnessConfig {
    HarnessConfig::builder()
        .target(path)
        .timeout(Duration::from_secs(20))
        .build()
        .expect("valid config")
}

/// Deterministic, non-repeating-looking test payload.
fn payload(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

#[test]
fn test_buffer_round_trip() {
    let input = payload(64 * 1024);
    let mut harness =
        ProcessHarness::spawn(&echo_config(""), PrintJob::from_buffer(input.clone())).unwrap();
    assert_eq!(harness.state(), HarnessState::Running);
    assert_eq!(harness.stdout(), None);

    harness.wait().unwrap();

    assert_eq!(harness.state(), HarnessState::Done);
    assert_eq!(harness.disposition(), Some(ExitDisposition::Exited(0)));
    assert_bytes_eq(&input, harness.stdout().unwrap());
}

#[test]
fn test_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let input = payload(64 * 1024);
    let file = dir.path().join("job.ps");
    std::fs::write(&file, &input).unwrap();

    let output = ProcessHarness::run(&echo_config(""), PrintJob::from_file(&file)).unwrap();

    assert!(output.success());
    assert_bytes_eq(&input, &output.stdout);
}

#[test]
#[cfg(target_os = "linux")]
fn test_file_path_with_non_utf8_name() {
    use std::os::unix::ffi::OsStrExt;

    let dir = TempDir::new().unwrap();
    let file = dir.path().join(std::ffi::OsStr::from_bytes(b"job-\xff.ps"));
    std::fs::write(&file, b"hello").unwrap();

    let mut harness = ProcessHarness::spawn(&echo_config(""), PrintJob::from_file(&file)).unwrap();
    assert_eq!(harness.argv().last().map(|a| a.as_bytes()), Some(file.as_os_str().as_bytes()));
    harness.wait().unwrap();
    assert_eq!(harness.stdout(), Some(&b"hello"[..]));
}

#[test]
fn test_copies_from_buffer() {
    let input = b"%!PS-Adobe-3.0\nshowpage\n".to_vec();
    let output = ProcessHarness::run(
        &echo_config(""),
        PrintJob::from_buffer(input.clone()).with_copies(3),
    )
    .unwrap();

    assert_bytes_eq(&input.repeat(3), &output.stdout);
}

#[test]
fn test_copies_from_file() {
    let dir = TempDir::new().unwrap();
    let input = payload(10_000);
    let file = dir.path().join("job.prn");
    std::fs::write(&file, &input).unwrap();

    let output = ProcessHarness::run(&echo_config(""), PrintJob::from_file(&file).with_copies(2))
        .unwrap();

    assert_bytes_eq(&input.repeat(2), &output.stdout);
}

#[test]
fn test_input_sources_are_exclusive() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("job.ps");
    std::fs::write(&file, b"data").unwrap();

    let both = PrintJob::from_buffer(b"data".to_vec()).with_file(&file);
    let err = ProcessHarness::spawn(&echo_config(""), both).unwrap_err();
    assert!(matches!(err, HarnessError::Config(ConfigError::InputConflict)));

    let err = ProcessHarness::spawn(&echo_config(""), PrintJob::default()).unwrap_err();
    assert!(matches!(err, HarnessError::Config(ConfigError::InputMissing)));

    let err = ProcessHarness::spawn(
        &echo_config(""),
        PrintJob::from_file(dir.path().join("missing.ps")),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        HarnessError::Config(ConfigError::InputFileNotFound { .. })
    ));

    let err = ProcessHarness::spawn(
        &echo_config(""),
        PrintJob::from_buffer(b"data".to_vec()).with_copies(0),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        HarnessError::Config(ConfigError::InvalidCopies { copies: 0 })
    ));
}

#[test]
fn test_exit_code_reported() {
    let dir = TempDir::new().unwrap();
    let target = script(&dir, "fail.sh", "echo 'ERROR: out of paper' >&2\nexit 3");

    let mut harness =
        ProcessHarness::spawn(&script_config(&target), PrintJob::from_buffer(payload(1024)))
            .unwrap();
    let err = harness.wait().unwrap_err();

    assert_eq!(err.disposition(), Some(ExitDisposition::Exited(3)));
    match &err {
        WaitError::ChildFailed { stderr, .. } => assert!(stderr.contains("out of paper")),
        other => panic!("expected ChildFailed, got {other:?}"),
    }
    assert_eq!(err.to_string(), "monitor exited with status 3");

    // stderr stays readable after a failed run, stdout does not
    assert_eq!(harness.state(), HarnessState::Done);
    assert!(harness.stderr().is_some());
    assert_eq!(harness.stdout(), None);
}

#[test]
fn test_exit_status_option() {
    let err = ProcessHarness::run(
        &echo_config("exit-status=5"),
        PrintJob::from_buffer(b"data".to_vec()),
    )
    .unwrap_err();
    assert_eq!(err.disposition(), Some(ExitDisposition::Exited(5)));
}

#[test]
fn test_signal_reported() {
    let dir = TempDir::new().unwrap();
    let target = script(&dir, "crash.sh", "kill -9 $$");

    let err =
        ProcessHarness::run(&script_config(&target), PrintJob::from_buffer(b"x".to_vec()))
            .unwrap_err();
    assert_eq!(err.disposition(), Some(ExitDisposition::Signaled(libc::SIGKILL)));
    assert_eq!(err.to_string(), "monitor killed by signal 9");

    let err = ProcessHarness::run(
        &echo_config("signal=15"),
        PrintJob::from_buffer(b"x".to_vec()),
    )
    .unwrap_err();
    assert_eq!(err.disposition(), Some(ExitDisposition::Signaled(libc::SIGTERM)));
}

#[test]
fn test_no_deadlock_when_monitor_writes_before_reading() {
    // Both directions exceed any pipe buffer, and the monitor fills stdout
    // before it reads a single byte of stdin.
    let preamble = 300_000;
    let input = payload(300_000);
    let config = echo_config(&format!("preamble={preamble}"));

    let start = Instant::now();
    let output = ProcessHarness::run(&config, PrintJob::from_buffer(input.clone())).unwrap();
    assert!(start.elapsed() < Duration::from_secs(15));

    let mut expected = vec![b'#'; preamble];
    expected.extend_from_slice(&input);
    assert_bytes_eq(&expected, &output.stdout);
}

#[test]
fn test_monitor_that_ignores_stdin() {
    let dir = TempDir::new().unwrap();
    let target = script(&dir, "ignore.sh", "echo ok");

    let output =
        ProcessHarness::run(&script_config(&target), PrintJob::from_buffer(payload(512 * 1024)))
            .unwrap();
    assert_eq!(output.stdout, b"ok\n");
}

#[test]
fn test_exec_failure_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("not-a-program");
    std::fs::write(&path, b"\x00\x01\x02\x03 definitely not an executable").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let err = ProcessHarness::spawn(&script_config(&path), PrintJob::from_buffer(b"x".to_vec()))
        .unwrap_err();
    match err {
        HarnessError::Spawn(SpawnError::Exec { errno, .. }) => assert_eq!(errno, libc::ENOEXEC),
        other => panic!("expected exec failure, got {other:?}"),
    }
}

#[test]
fn test_timeout_kills_hung_monitor() {
    let dir = TempDir::new().unwrap();
    let target = script(&dir, "hang.sh", "exec sleep 30");
    let config = HarnessConfig::builder()
        .target(&target)
        .limits(Limits::default().with_timeout(Duration::from_millis(300)))
        .build()
        .unwrap();

    let start = Instant::now();
    let mut harness = ProcessHarness::spawn(&config, PrintJob::from_buffer(Vec::new())).unwrap();
    let err = harness.wait().unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(matches!(err, WaitError::Timeout { .. }), "{err:?}");
    assert_eq!(harness.state(), HarnessState::Failed);
    assert_eq!(harness.disposition(), Some(ExitDisposition::Signaled(libc::SIGKILL)));
    assert!(harness.into_output().is_none());
}

#[test]
fn test_cancellation() {
    let dir = TempDir::new().unwrap();
    let target = script(&dir, "hang.sh", "exec sleep 30");
    let token = CancelToken::new();
    let remote = token.clone();

    let mut harness =
        ProcessHarness::spawn(&script_config(&target), PrintJob::from_buffer(Vec::new()))
            .unwrap()
            .with_cancel(token);
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        remote.cancel();
    });

    let start = Instant::now();
    let err = harness.wait().unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(err, WaitError::Cancelled), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(harness.state(), HarnessState::Failed);
    assert_eq!(harness.disposition(), Some(ExitDisposition::Signaled(libc::SIGTERM)));
}

#[test]
fn test_monitor_sees_no_stray_descriptors() {
    let output = ProcessHarness::run(
        &echo_config("check-fds"),
        PrintJob::from_buffer(b"data".to_vec()),
    )
    .unwrap();
    assert_eq!(output.stdout, b"data");
    let debug: Vec<_> = output.status_lines("DEBUG:").collect();
    assert!(debug.iter().any(|line| line == "side-channel open on fd 3"), "{debug:?}");
}

#[test]
fn test_argv_and_env_contract() {
    let dir = TempDir::new().unwrap();
    let target = script(
        &dir,
        "contract.sh",
        "printf '%s\\n' \"$@\"\necho \"uri=$DEVICE_URI printer=$PRINTER type=$FINAL_CONTENT_TYPE extra=$EXTRA\"",
    );
    let file = dir.path().join("job.ps");
    std::fs::write(&file, b"data").unwrap();

    let config = HarnessConfig::builder()
        .target(&target)
        .device_uri("socket://10.0.0.7:9100")
        .job_id("42")
        .options("duplex=long")
        .env_var("EXTRA", "yes")
        .build()
        .unwrap();

    let output = ProcessHarness::run(&config, PrintJob::from_file(&file).with_copies(2)).unwrap();

    let expected = format!(
        "42\nlpr\ntest-job\n2\nduplex=long\n{}\n\
         uri=socket://10.0.0.7:9100 printer=test-printer \
         type=application/vnd.cups-postscript extra=yes\n",
        file.display()
    );
    assert_eq!(output.stdout_string(), expected);
}

#[test]
fn test_wait_twice_fails() {
    let mut harness =
        ProcessHarness::spawn(&echo_config(""), PrintJob::from_buffer(b"once".to_vec())).unwrap();
    harness.wait().unwrap();
    assert!(matches!(harness.wait(), Err(WaitError::AlreadyWaited)));
    assert_eq!(harness.stdout(), Some(&b"once"[..]));
}

#[test]
fn test_stderr_captured() {
    let output = ProcessHarness::run(
        &echo_config(""),
        PrintJob::from_buffer(b"abc".to_vec()).with_copies(2),
    )
    .unwrap();
    let debug: Vec<_> = output.status_lines("DEBUG:").collect();
    assert!(debug.iter().any(|line| line == "echo monitor running, 2 copies"), "{debug:?}");
    assert!(debug.iter().any(|line| line == "sent 6 bytes"), "{debug:?}");
}

#[test]
fn test_drop_kills_running_monitor() {
    let dir = TempDir::new().unwrap();
    let target = script(&dir, "hang.sh", "exec sleep 30");

    let harness =
        ProcessHarness::spawn(&script_config(&target), PrintJob::from_buffer(Vec::new())).unwrap();
    let pid = harness.pid();
    drop(harness);

    // reaped, so the pid no longer exists
    let rc = unsafe { libc::kill(pid, 0) };
    assert_eq!(rc, -1);
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ESRCH)
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_buffer_round_trip(
        input in proptest::collection::vec(any::<u8>(), 0..100_000),
        copies in 1u32..4,
    ) {
        let output = ProcessHarness::run(
            &echo_config(""),
            PrintJob::from_buffer(input.clone()).with_copies(copies),
        )
        .unwrap();
        prop_assert_eq!(output.stdout, input.repeat(copies as usize));
    }
}

//! Running one monitor process to completion.
//!
//! `ProcessHarness::spawn` validates the job, starts the monitor with its
//! pipes wired in and returns a harness in the `Running` state.
//! `ProcessHarness::wait` then alternates multiplexer ticks with
//! non-blocking exit checks until the monitor exits, drains whatever is
//! still in flight, closes the remaining channels and classifies the exit.
//!
//! Ticking and exit polling have to be interleaved. Polling only for exit
//! deadlocks as soon as the monitor blocks on a full stdout pipe; ticking
//! only gives no deterministic point at which the run is over.

use crate::cancel::CancelToken;
use crate::channel::{Channel, ChannelRole, Direction};
use crate::config::HarnessConfig;
use crate::error::{ExitDisposition, HarnessError, SpawnError, WaitError};
use crate::job::{InputSource, PrintJob};
use crate::limits::Limits;
use crate::mux::Multiplexer;
use crate::output::Output;
use crate::spawn::{reap_blocking, FdAction, SpawnRequest};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::time::{Duration, Instant};

/// Where a harness is in its lifecycle.
///
/// Construction is the spawning phase: a harness that exists has already
/// spawned its monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    /// The monitor is (or may still be) running; `wait()` not yet called.
    Running,
    /// The monitor has exited; in-flight output is being collected.
    Draining,
    /// The run finished and the exit status was classified.
    Done,
    /// The run was cancelled, timed out or hit an I/O error.
    Failed,
}

/// Why the running loop stopped before the monitor exited on its own.
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

/// A monitor process together with its channels.
///
/// Not reentrant: one monitor per harness, and `wait()` may be called once.
/// Dropping a harness whose monitor has not been reaped kills and reaps it.
#[derive(Debug)]
pub struct ProcessHarness {
    pid: libc::pid_t,
    argv: Vec<OsString>,
    env: BTreeMap<String, String>,
    channels: Vec<Channel>,
    mux: Multiplexer,
    limits: Limits,
    cancel: Option<CancelToken>,
    state: HarnessState,
    exit: Option<ExitDisposition>,
    reaped: bool,
    stderr_logged: usize,
}

impl ProcessHarness {
    /// Validate `job` and start the monitor named by `config`.
    ///
    /// For buffer input the whole buffer is queued on the stdin channel.
    /// For file input the path is appended to the arguments and the
    /// monitor's descriptor 0 stays closed.
    ///
    /// # Errors
    ///
    /// - `HarnessError::Config` for an invalid job or spawn request
    /// - `HarnessError::Spawn` if pipes, fork or exec fail
    ///
    /// Nothing is left running and no descriptor stays open on error.
    pub fn spawn(config: &HarnessConfig, mut job: PrintJob) -> Result<Self, HarnessError> {
        let file = match job.input_source()? {
            InputSource::Buffer(_) => None,
            InputSource::File(path) => Some(path.to_path_buf()),
        };
        let mut payload = match file {
            Some(_) => None,
            None => job.buffer.take(),
        };

        let side_channel = config.side_channel_fd();
        let argv = config.argv(job.copies, file.as_deref());
        let env = config.env();
        let stdin_action = if payload.is_some() {
            FdAction::Input
        } else {
            FdAction::Closed
        };

        let prepared = SpawnRequest::new(config.target(), argv.clone(), env.clone(), side_channel)
            .fd(libc::STDIN_FILENO, stdin_action)
            .fd(libc::STDOUT_FILENO, FdAction::Output)
            .fd(libc::STDERR_FILENO, FdAction::Output)
            .fd(side_channel, FdAction::Input)
            .prepare()?;
        let child = prepared.spawn()?;
        let pid = child.pid;

        let mut channels = Vec::with_capacity(child.ends.len());
        for end in child.ends {
            let Some(role) = ChannelRole::for_child_fd(end.child_fd, side_channel) else {
                continue;
            };
            let channel = match end.direction {
                Direction::Write => {
                    let bytes = match role {
                        ChannelRole::Stdin => payload.take().unwrap_or_default(),
                        _ => Vec::new(),
                    };
                    Channel::writer(role, end.fd, bytes)
                }
                Direction::Read => Channel::reader(role, end.fd),
            };
            match channel {
                Ok(channel) => channels.push(channel),
                Err(source) => {
                    drop(channels);
                    kill_and_reap(pid);
                    return Err(SpawnError::Setup { source }.into());
                }
            }
        }

        tracing::debug!(
            pid,
            copies = job.copies,
            file_input = file.is_some(),
            "monitor harness running"
        );

        Ok(Self {
            pid,
            argv,
            env,
            channels,
            mux: Multiplexer::new(config.limits()),
            limits: *config.limits(),
            cancel: None,
            state: HarnessState::Running,
            exit: None,
            reaped: false,
            stderr_logged: 0,
        })
    }

    /// Spawn, wait and collect the output in one call.
    ///
    /// # Errors
    ///
    /// Any error from `spawn` or `wait`.
    pub fn run(config: &HarnessConfig, job: PrintJob) -> Result<Output, HarnessError> {
        let mut harness = Self::spawn(config, job)?;
        let status = harness.drive()?;
        Ok(Output {
            stdout: harness.take_received(ChannelRole::Stdout),
            stderr: harness.take_received(ChannelRole::Stderr),
            status,
        })
    }

    /// Attach a cancellation token checked on every loop iteration.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Drive the monitor to completion.
    ///
    /// # Errors
    ///
    /// - `ChildFailed` if the monitor exited non-zero or was killed by a signal
    /// - `Timeout` / `Cancelled` if the run was cut short
    /// - `AlreadyWaited` on a second call
    /// - `Io` if polling, reading or reaping failed
    pub fn wait(&mut self) -> Result<(), WaitError> {
        self.drive().map(|_| ())
    }

    /// Bytes the monitor wrote to stdout.
    ///
    /// `Some` only after `wait()` succeeded.
    pub fn stdout(&self) -> Option<&[u8]> {
        match (self.state, self.exit) {
            (HarnessState::Done, Some(status)) if status.success() => {
                self.channel(ChannelRole::Stdout).map(Channel::received)
            }
            _ => None,
        }
    }

    /// Bytes the monitor wrote to stderr.
    ///
    /// `Some` once the run is `Done`, whatever the exit status.
    pub fn stderr(&self) -> Option<&[u8]> {
        match self.state {
            HarnessState::Done => self.channel(ChannelRole::Stderr).map(Channel::received),
            _ => None,
        }
    }

    /// Consume the harness and return its output, if the run is `Done`.
    pub fn into_output(mut self) -> Option<Output> {
        let status = match self.state {
            HarnessState::Done => self.exit?,
            _ => return None,
        };
        Some(Output {
            stdout: self.take_received(ChannelRole::Stdout),
            stderr: self.take_received(ChannelRole::Stderr),
            status,
        })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    /// How the monitor terminated, once known.
    pub fn disposition(&self) -> Option<ExitDisposition> {
        self.exit
    }

    /// Arguments the monitor was started with.
    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    /// Environment the monitor was started with.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn drive(&mut self) -> Result<ExitDisposition, WaitError> {
        if self.state != HarnessState::Running {
            return Err(WaitError::AlreadyWaited);
        }

        match self.run_to_exit() {
            Ok((status, None)) => {
                self.state = HarnessState::Done;
                self.exit = Some(status);
                if status.success() {
                    tracing::debug!(pid = self.pid, "monitor exited cleanly");
                    return Ok(status);
                }
                tracing::debug!(pid = self.pid, %status, "monitor failed");
                let stderr = self
                    .channel(ChannelRole::Stderr)
                    .map(|c| String::from_utf8_lossy(c.received()).into_owned())
                    .unwrap_or_default();
                Err(WaitError::ChildFailed {
                    disposition: status,
                    stderr,
                })
            }
            Ok((status, Some(interrupt))) => {
                self.state = HarnessState::Failed;
                self.exit = Some(status);
                Err(match interrupt {
                    Interrupt::Cancelled => WaitError::Cancelled,
                    Interrupt::TimedOut(elapsed) => WaitError::Timeout {
                        limit: self.limits.timeout.unwrap_or(elapsed),
                        elapsed,
                    },
                })
            }
            Err(err) => {
                self.state = HarnessState::Failed;
                if !self.reaped {
                    kill_and_reap(self.pid);
                    self.reaped = true;
                }
                self.close_all();
                Err(err.into())
            }
        }
    }

    /// Running and Draining. Returns the exit status and, if the loop was
    /// cut short, why.
    fn run_to_exit(&mut self) -> io::Result<(ExitDisposition, Option<Interrupt>)> {
        let start = Instant::now();
        let mut interrupt = None;

        let raw_status = loop {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                tracing::debug!(pid = self.pid, "cancelling monitor");
                interrupt = Some(Interrupt::Cancelled);
                break self.terminate()?;
            }
            if let Some(limit) = self.limits.timeout {
                let elapsed = start.elapsed();
                if elapsed >= limit {
                    tracing::warn!(pid = self.pid, ?elapsed, "monitor timed out, killing");
                    interrupt = Some(Interrupt::TimedOut(elapsed));
                    break self.kill()?;
                }
            }

            self.tick()?;
            if let Some(status) = self.try_reap()? {
                break status;
            }
        };

        self.state = HarnessState::Draining;
        self.drain()?;

        let status = ExitDisposition::from_wait_status(raw_status).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected wait status {raw_status:#x}"),
            )
        })?;
        Ok((status, interrupt))
    }

    /// Collect bytes still in flight, then close every channel.
    fn drain(&mut self) -> io::Result<()> {
        let mut idle = 0;
        while self.has_open_readers() && idle < self.limits.drain_idle_ticks {
            if self.tick()?.is_idle() {
                idle += 1;
            } else {
                idle = 0;
            }
        }
        if self.has_open_readers() {
            tracing::debug!(
                pid = self.pid,
                "output still open after monitor exit, giving up on it"
            );
        }
        self.close_all();
        self.log_stderr(true);
        Ok(())
    }

    /// SIGTERM, keep pumping for a grace period, then SIGKILL.
    fn terminate(&mut self) -> io::Result<libc::c_int> {
        signal(self.pid, libc::SIGTERM);
        let deadline = Instant::now() + self.limits.poll_interval * 10;
        while Instant::now() < deadline {
            self.tick()?;
            if let Some(status) = self.try_reap()? {
                return Ok(status);
            }
        }
        self.kill()
    }

    fn kill(&mut self) -> io::Result<libc::c_int> {
        signal(self.pid, libc::SIGKILL);
        let status = reap_blocking(self.pid).ok_or_else(io::Error::last_os_error)?;
        self.reaped = true;
        Ok(status)
    }

    fn tick(&mut self) -> io::Result<crate::mux::Tick> {
        let tick = self.mux.tick(&mut self.channels)?;
        self.log_stderr(false);
        Ok(tick)
    }

    /// Non-blocking exit check.
    fn try_reap(&mut self) -> io::Result<Option<libc::c_int>> {
        let mut status = 0;
        loop {
            let ret = unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) };
            if ret == 0 {
                return Ok(None);
            }
            if ret == self.pid {
                self.reaped = true;
                return Ok(Some(status));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn has_open_readers(&self) -> bool {
        self.channels
            .iter()
            .any(|c| c.direction() == Direction::Read && !c.is_closed())
    }

    fn close_all(&mut self) {
        for channel in &mut self.channels {
            if channel.is_closed() {
                continue;
            }
            let unsent = channel.pending().len();
            if unsent > 0 {
                tracing::warn!(
                    role = ?channel.role(),
                    unsent,
                    "discarding input the monitor never read"
                );
            }
            channel.close();
        }
    }

    fn channel(&self, role: ChannelRole) -> Option<&Channel> {
        self.channels.iter().find(|c| c.role() == role)
    }

    fn take_received(&mut self, role: ChannelRole) -> Vec<u8> {
        self.channels
            .iter_mut()
            .find(|c| c.role() == role)
            .map(Channel::take_received)
            .unwrap_or_default()
    }

    /// Log complete stderr lines received since the last call.
    fn log_stderr(&mut self, flush: bool) {
        let pid = self.pid;
        let Some(channel) = self.channels.iter().find(|c| c.role() == ChannelRole::Stderr) else {
            return;
        };
        let fresh = &channel.received()[self.stderr_logged..];
        let complete = if flush {
            fresh.len()
        } else {
            fresh
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |pos| pos + 1)
        };
        for line in fresh[..complete].split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            tracing::debug!(pid, "monitor: {}", String::from_utf8_lossy(line));
        }
        self.stderr_logged += complete;
    }
}

impl Drop for ProcessHarness {
    fn drop(&mut self) {
        if !self.reaped {
            tracing::warn!(pid = self.pid, "harness dropped with monitor still running");
            kill_and_reap(self.pid);
            self.reaped = true;
        }
    }
}

fn signal(pid: libc::pid_t, sig: libc::c_int) {
    unsafe {
        libc::kill(pid, sig);
    }
}

fn kill_and_reap(pid: libc::pid_t) {
    signal(pid, libc::SIGKILL);
    reap_blocking(pid);
}

//! Child process creation with a fixed descriptor layout.
//!
//! A `SpawnRequest` names the program, its argv and environment, and what
//! every reserved descriptor number in the child should be: the read end of
//! a pipe fed by the parent, the write end of a pipe read by the parent, or
//! nothing at all. `SpawnRequest::prepare` validates the request and does
//! all allocation up front; `PreparedSpawn::spawn` forks, wires the pipes
//! onto their numbers, closes everything else in the child and executes
//! the program.
//!
//! Between `fork` and `execve` the child only makes async-signal-safe calls
//! (`dup2`, `close`, `sigprocmask`, `signal`, `write`, `setrlimit`, `abort`),
//! so spawning from a multi-threaded process is sound.

use crate::channel::Direction;
use crate::error::{ConfigError, SpawnError};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{CString, OsString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::ptr;

/// Upper bound on the descriptor sweep in the child.
const MAX_FD_SWEEP: RawFd = 65536;

/// What a descriptor number should be in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdAction {
    /// Read end of a pipe; the parent keeps the write end.
    Input,
    /// Write end of a pipe; the parent keeps the read end.
    Output,
    /// Left closed.
    Closed,
}

impl FdAction {
    fn parent_direction(self) -> Option<Direction> {
        match self {
            FdAction::Input => Some(Direction::Write),
            FdAction::Output => Some(Direction::Read),
            FdAction::Closed => None,
        }
    }
}

/// A request to start a child process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Path handed to execve.
    pub program: PathBuf,

    /// Full argument vector, including `argv[0]`.
    pub argv: Vec<OsString>,

    /// Complete environment of the child.
    pub env: BTreeMap<String, String>,

    /// Descriptor layout, one entry per child descriptor number.
    pub fds: Vec<(RawFd, FdAction)>,

    /// Side-channel descriptor number; must appear in `fds`.
    pub side_channel: RawFd,
}

impl SpawnRequest {
    /// Create a request with an empty descriptor layout.
    pub fn new(
        program: impl Into<PathBuf>,
        argv: Vec<OsString>,
        env: BTreeMap<String, String>,
        side_channel: RawFd,
    ) -> Self {
        Self {
            program: program.into(),
            argv,
            env,
            fds: Vec::new(),
            side_channel,
        }
    }

    /// Add a descriptor mapping.
    pub fn fd(mut self, fd: RawFd, action: FdAction) -> Self {
        self.fds.push((fd, action));
        self
    }

    /// Validate the request and build everything execve needs.
    ///
    /// # Errors
    ///
    /// - `EmptyArgv` if there is no `argv[0]`
    /// - `InvalidEnvKey` for empty keys or keys containing `=`
    /// - `NulByte` if any string contains an interior NUL
    /// - `InvalidFd`, `DuplicateFd`, `MissingFd` for a bad descriptor layout
    pub fn prepare(&self) -> Result<PreparedSpawn, ConfigError> {
        if self.argv.is_empty() {
            return Err(ConfigError::EmptyArgv);
        }

        let mut seen = BTreeSet::new();
        for &(fd, _) in &self.fds {
            if fd < 0 {
                return Err(ConfigError::InvalidFd { fd });
            }
            if !seen.insert(fd) {
                return Err(ConfigError::DuplicateFd { fd });
            }
        }
        if self.side_channel < 0 {
            return Err(ConfigError::InvalidFd {
                fd: self.side_channel,
            });
        }
        for required in [
            libc::STDIN_FILENO,
            libc::STDOUT_FILENO,
            libc::STDERR_FILENO,
            self.side_channel,
        ] {
            if !seen.contains(&required) {
                return Err(ConfigError::MissingFd { fd: required });
            }
        }

        let program = CString::new(self.program.as_os_str().as_bytes())
            .map_err(|_| ConfigError::NulByte { what: "program path" })?;

        let argv = self
            .argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConfigError::NulByte { what: "argument" })?;

        let mut envp = Vec::with_capacity(self.env.len());
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') {
                return Err(ConfigError::InvalidEnvKey { key: key.clone() });
            }
            let entry = CString::new(format!("{key}={value}"))
                .map_err(|_| ConfigError::NulByte { what: "environment" })?;
            envp.push(entry);
        }

        let mut fds = self.fds.clone();
        fds.sort_by_key(|&(fd, _)| fd);

        Ok(PreparedSpawn {
            program_display: self.program.display().to_string(),
            program,
            argv,
            envp,
            fds,
        })
    }
}

/// A validated spawn request, ready to fork.
#[derive(Debug)]
pub struct PreparedSpawn {
    program_display: String,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    fds: Vec<(RawFd, FdAction)>,
}

/// Parent side of one pipe connected to the child.
#[derive(Debug)]
pub struct ParentEnd {
    /// Descriptor number the other end has in the child.
    pub child_fd: RawFd,
    /// Which way bytes flow, seen from the parent.
    pub direction: Direction,
    /// The parent's end of the pipe.
    pub fd: OwnedFd,
}

/// A running child and the parent's ends of its pipes.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: libc::pid_t,
    pub ends: Vec<ParentEnd>,
}

impl PreparedSpawn {
    /// Fork and execute the program.
    ///
    /// Returns once the child has either replaced its image or reported an
    /// exec failure. In the latter case the child (which aborts) has already
    /// been reaped.
    ///
    /// # Errors
    ///
    /// - `SpawnError::Pipe` if a pipe could not be allocated or descriptors ran out
    /// - `SpawnError::Setup` if a descriptor could not be renumbered for another reason
    /// - `SpawnError::Fork` if fork failed
    /// - `SpawnError::Exec` if execve failed in the child
    pub fn spawn(self) -> Result<SpawnedChild, SpawnError> {
        let max_reserved = self.fds.last().map(|&(fd, _)| fd).unwrap_or(0);
        let floor = max_reserved + 1;

        // Child ends live above every reserved number so a dup2 in the
        // child never overwrites a source it still has to move.
        let mut ends = Vec::new();
        let mut child_ends: Vec<OwnedFd> = Vec::new();
        let mut plan: Vec<(RawFd, RawFd)> = Vec::with_capacity(self.fds.len());

        for &(child_fd, action) in &self.fds {
            let Some(direction) = action.parent_direction() else {
                plan.push((-1, child_fd));
                continue;
            };
            let (read_end, write_end) =
                cloexec_pipe().map_err(|source| SpawnError::Pipe { source })?;
            let (parent_fd, low_end) = match direction {
                Direction::Write => (write_end, read_end),
                Direction::Read => (read_end, write_end),
            };
            let child_end = dup_above(&low_end, floor).map_err(renumber_error)?;
            drop(low_end);
            plan.push((child_end.as_raw_fd(), child_fd));
            child_ends.push(child_end);
            ends.push(ParentEnd {
                child_fd,
                direction,
                fd: parent_fd,
            });
        }

        let (status_read, low_status) =
            cloexec_pipe().map_err(|source| SpawnError::Pipe { source })?;
        let status_write = dup_above(&low_status, floor).map_err(renumber_error)?;
        drop(low_status);

        let sweep_limit = fd_sweep_limit();
        let argv_ptrs: Vec<*const libc::c_char> = self
            .argv
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        let envp_ptrs: Vec<*const libc::c_char> = self
            .envp
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();

        // SAFETY: the child branch only calls async-signal-safe functions on
        // data prepared above and never returns.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(SpawnError::Fork {
                source: io::Error::last_os_error(),
            });
        }
        if pid == 0 {
            unsafe {
                exec_child(
                    &self.program,
                    &argv_ptrs,
                    &envp_ptrs,
                    &plan,
                    sweep_limit,
                    status_write.as_raw_fd(),
                )
            }
        }

        drop(child_ends);
        drop(status_write);

        match read_exec_status(&status_read) {
            Ok(None) => {
                tracing::debug!(pid, program = %self.program_display, "monitor started");
                Ok(SpawnedChild { pid, ends })
            }
            Ok(Some(errno)) => {
                reap_blocking(pid);
                Err(SpawnError::Exec {
                    program: self.program_display,
                    errno,
                })
            }
            Err(source) => {
                // Could not learn the outcome; do not leave a stray child.
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
                reap_blocking(pid);
                Err(SpawnError::Setup { source })
            }
        }
    }
}

/// Runs in the forked child. Never returns.
unsafe fn exec_child(
    program: &CString,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    plan: &[(RawFd, RawFd)],
    sweep_limit: RawFd,
    status_fd: RawFd,
) -> ! {
    // Undo what the parent may have changed: Rust ignores SIGPIPE.
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut());
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    for &(source, target) in plan {
        if source < 0 {
            libc::close(target);
        } else if libc::dup2(source, target) < 0 {
            report_and_abort(status_fd);
        }
    }

    for fd in 0..sweep_limit {
        if fd != status_fd && !plan.iter().any(|&(_, target)| target == fd) {
            libc::close(fd);
        }
    }

    libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    report_and_abort(status_fd)
}

/// Send errno to the parent and die distinctly from any exit code.
unsafe fn report_and_abort(status_fd: RawFd) -> ! {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let bytes = errno.to_ne_bytes();
    libc::write(status_fd, bytes.as_ptr().cast(), bytes.len());
    let no_core = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    libc::setrlimit(libc::RLIMIT_CORE, &no_core);
    libc::abort()
}

/// `None` when the status pipe hit EOF (exec succeeded), `Some(errno)` otherwise.
fn read_exec_status(fd: &OwnedFd) -> io::Result<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf[filled..].as_mut_ptr().cast(),
                buf.len() - filled,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            break;
        }
        filled += n as usize;
    }
    match filled {
        0 => Ok(None),
        4 => Ok(Some(i32::from_ne_bytes(buf))),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated exec status from child",
        )),
    }
}

/// Block until `pid` is reaped, ignoring interruptions.
pub(crate) fn reap_blocking(pid: libc::pid_t) -> Option<libc::c_int> {
    let mut status = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == pid {
            return Some(status);
        }
        if ret < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return None;
    }
}

/// Create a pipe with both ends close-on-exec. Returns `(read, write)`.
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as RawFd; 2];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
    }

    // SAFETY: both descriptors were just returned by pipe and are owned here.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Duplicate `fd` onto the lowest free number `>= floor`, close-on-exec.
/// The source descriptor stays open until the caller drops it.
fn dup_above(fd: &OwnedFd, floor: RawFd) -> io::Result<OwnedFd> {
    let new_fd = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if new_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// Running out of descriptors while renumbering is the same failure as
/// running out while allocating the pipe.
fn renumber_error(source: io::Error) -> SpawnError {
    match source.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) => SpawnError::Pipe { source },
        _ => SpawnError::Setup { source },
    }
}

/// One past the highest descriptor the child might have inherited.
///
/// Uses the hard limit as well as the soft one: descriptors opened before
/// the soft limit was lowered stay open above it.
fn fd_sweep_limit() -> RawFd {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return 1024;
    }
    limit
        .rlim_cur
        .max(limit.rlim_max)
        .min(MAX_FD_SWEEP as libc::rlim_t) as RawFd
}

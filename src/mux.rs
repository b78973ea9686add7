//! Readiness-driven pumping of channels.
//!
//! One `tick` polls every open channel once with a bounded timeout and
//! performs at most one non-blocking read or write on each channel that is
//! ready. Every ready channel makes progress within a tick, so a reader the
//! child is not writing to never holds up a writer the child is draining.

use crate::channel::{Channel, Direction};
use crate::limits::Limits;
use std::io;

/// What a tick accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Channels that were ready (or closed without polling) this tick.
    pub ready: usize,
    /// Channels still open after the tick.
    pub open: usize,
}

impl Tick {
    /// True when nothing happened before the poll timed out.
    pub fn is_idle(&self) -> bool {
        self.ready == 0
    }
}

/// Drives a set of channels with `poll(2)`.
#[derive(Debug)]
pub struct Multiplexer {
    timeout_ms: libc::c_int,
    scratch: Vec<u8>,
    pollfds: Vec<libc::pollfd>,
    slots: Vec<usize>,
}

impl Multiplexer {
    pub fn new(limits: &Limits) -> Self {
        Self {
            timeout_ms: limits.poll_timeout_ms(),
            scratch: vec![0u8; limits.chunk_size.max(1)],
            pollfds: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Advance every open channel by at most one I/O operation.
    ///
    /// Blocks for at most the poll interval. With no open channels this
    /// just sleeps for the interval.
    ///
    /// # Errors
    ///
    /// Returns the OS error if `poll` fails for a reason other than `EINTR`,
    /// or if a read fails with something other than `EAGAIN`/`EINTR`.
    pub fn tick(&mut self, channels: &mut [Channel]) -> io::Result<Tick> {
        let mut ready = 0;

        // A writer with nothing to send never needs the child's attention.
        for channel in channels.iter_mut() {
            if channel.direction() == Direction::Write
                && !channel.is_closed()
                && channel.pending().is_empty()
            {
                channel.close();
                ready += 1;
            }
        }

        self.pollfds.clear();
        self.slots.clear();
        for (index, channel) in channels.iter().enumerate() {
            let Some(fd) = channel.raw_fd() else {
                continue;
            };
            let events = match channel.direction() {
                Direction::Write => libc::POLLOUT,
                Direction::Read => libc::POLLIN,
            };
            self.pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
            self.slots.push(index);
        }

        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                self.timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Tick {
                    ready,
                    open: count_open(channels),
                });
            }
            return Err(err);
        }

        for (pfd, &index) in self.pollfds.iter().zip(&self.slots) {
            if pfd.revents == 0 {
                continue;
            }
            ready += 1;
            let channel = &mut channels[index];

            if pfd.revents & libc::POLLNVAL != 0 {
                channel.close();
                continue;
            }

            match channel.direction() {
                Direction::Write => pump_write(channel, pfd.revents),
                Direction::Read => pump_read(channel, &mut self.scratch)?,
            }
        }

        Ok(Tick {
            ready,
            open: count_open(channels),
        })
    }
}

fn count_open(channels: &[Channel]) -> usize {
    channels.iter().filter(|c| !c.is_closed()).count()
}

fn pump_write(channel: &mut Channel, revents: libc::c_short) {
    if revents & (libc::POLLERR | libc::POLLHUP) != 0 {
        discard(channel);
        return;
    }
    let Some(fd) = channel.raw_fd() else {
        return;
    };
    let pending = channel.pending();
    let n = unsafe { libc::write(fd, pending.as_ptr().cast(), pending.len()) };
    if n >= 0 {
        channel.advance(n as usize);
        return;
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
        _ => discard(channel),
    }
}

/// The child stopped reading. Not an error: the rest is dropped.
fn discard(channel: &mut Channel) {
    let unsent = channel.pending().len();
    if unsent > 0 {
        tracing::warn!(
            role = ?channel.role(),
            unsent,
            "monitor closed its input early, discarding remaining bytes"
        );
    }
    channel.close();
}

fn pump_read(channel: &mut Channel, scratch: &mut [u8]) -> io::Result<()> {
    let Some(fd) = channel.raw_fd() else {
        return Ok(());
    };
    let n = unsafe { libc::read(fd, scratch.as_mut_ptr().cast(), scratch.len()) };
    if n > 0 {
        channel.extend(&scratch[..n as usize]);
        return Ok(());
    }
    if n == 0 {
        channel.close();
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(()),
        _ => {
            channel.close();
            Err(err)
        }
    }
}

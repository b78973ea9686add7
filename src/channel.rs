//! One parent-side pipe end and its buffer.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Which way bytes flow, seen from the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Harness writes, child reads.
    Write,
    /// Child writes, harness reads.
    Read,
}

/// What a channel carries for the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Print data piped to the monitor.
    Stdin,
    /// Data the monitor sent to the device.
    Stdout,
    /// Status and log messages.
    Stderr,
    /// Back-channel descriptor.
    SideChannel,
}

impl ChannelRole {
    /// Role of a child descriptor number, given the side-channel number.
    pub(crate) fn for_child_fd(fd: RawFd, side_channel: RawFd) -> Option<Self> {
        match fd {
            libc::STDIN_FILENO => Some(ChannelRole::Stdin),
            libc::STDOUT_FILENO => Some(ChannelRole::Stdout),
            libc::STDERR_FILENO => Some(ChannelRole::Stderr),
            fd if fd == side_channel => Some(ChannelRole::SideChannel),
            _ => None,
        }
    }
}

/// A pipe end owned by the harness.
///
/// For a writer, `buffer[cursor..]` is what is still to be sent. For a
/// reader, `buffer` holds everything received so far. The channel is closed
/// once `fd` is `None`; the descriptor is released exactly once, when it is
/// taken out of the option.
#[derive(Debug)]
pub struct Channel {
    role: ChannelRole,
    direction: Direction,
    fd: Option<OwnedFd>,
    buffer: Vec<u8>,
    cursor: usize,
}

impl Channel {
    /// Writer channel that will send `payload`.
    ///
    /// The descriptor is switched to non-blocking mode.
    pub fn writer(role: ChannelRole, fd: OwnedFd, payload: Vec<u8>) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            role,
            direction: Direction::Write,
            fd: Some(fd),
            buffer: payload,
            cursor: 0,
        })
    }

    /// Reader channel with an empty buffer.
    ///
    /// The descriptor is switched to non-blocking mode.
    pub fn reader(role: ChannelRole, fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            role,
            direction: Direction::Read,
            fd: Some(fd),
            buffer: Vec::new(),
            cursor: 0,
        })
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Bytes a writer has not sent yet (empty for readers).
    pub fn pending(&self) -> &[u8] {
        match self.direction {
            Direction::Write => &self.buffer[self.cursor..],
            Direction::Read => &[],
        }
    }

    /// Bytes a reader has received (empty for writers).
    pub fn received(&self) -> &[u8] {
        match self.direction {
            Direction::Read => &self.buffer,
            Direction::Write => &[],
        }
    }

    /// Take the received bytes, leaving the buffer empty.
    pub(crate) fn take_received(&mut self) -> Vec<u8> {
        match self.direction {
            Direction::Read => std::mem::take(&mut self.buffer),
            Direction::Write => Vec::new(),
        }
    }

    /// Record that `n` bytes of the pending data were written.
    ///
    /// Closes the channel when nothing is left.
    pub(crate) fn advance(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.buffer.len());
        if self.cursor == self.buffer.len() {
            self.close();
        }
    }

    /// Append bytes read from the child.
    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Release the descriptor. Idempotent.
    ///
    /// A writer drops whatever it had not sent yet.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            drop(fd);
            if self.direction == Direction::Write {
                self.buffer = Vec::new();
                self.cursor = 0;
            }
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

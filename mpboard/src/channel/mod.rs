//! Byte channels to a board: direct serial, or serial relayed over telnet.
//!
//! Both transports present the same blocking contract through [`Channel`],
//! so the raw REPL session never needs to know which one it drives.

#[cfg(test)]
pub(crate) mod mock;
#[cfg(unix)]
mod relay;
#[cfg(unix)]
mod serial;
#[cfg(unix)]
mod telnet;

use std::fmt;
use std::io;
use std::time::Duration;

#[cfg(unix)]
pub use relay::{LoginRelay, TELNET_PORT};
#[cfg(unix)]
pub use serial::SerialChannel;

/// A bidirectional byte stream to a board.
///
/// Implementations own their transport handle. Every read is bounded by a
/// timeout, so no call blocks forever.
pub trait Channel: fmt::Debug + Send {
    /// Reads up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns early once `buf` is full. Returns `Ok(0)` if nothing arrived
    /// before the timeout; short reads are normal.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Writes `data`, returning the number of bytes accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Number of bytes that can be read without waiting.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Discards any input received but not yet read.
    fn flush_input(&mut self) -> io::Result<()>;

    /// Releases the underlying handle. Later calls fail with `NotConnected`.
    fn close(&mut self) -> io::Result<()>;
}

/// Error returned by operations on a closed channel.
pub(crate) fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel is closed")
}

/// Waits until `fd` is ready for `events` or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout or when interrupted by a signal, so
/// callers re-check their own deadline.
#[cfg(unix)]
pub(crate) fn wait_ready(
    fd: std::os::fd::BorrowedFd<'_>,
    events: nix::poll::PollFlags,
    timeout: Duration,
) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::poll::{PollFd, PollTimeout, poll};

    // poll(2) takes milliseconds; longer waits are split by the caller's loop.
    let ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(fd, events)];
    match poll(&mut fds, PollTimeout::from(ms)) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

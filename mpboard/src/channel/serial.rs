//! Direct serial connection to a board's USB-CDC or UART port.
//!
//! The line is opened non-blocking and in raw mode, with RTS and DTR
//! held low so that boards wired for auto-reset do not reboot on open.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::PollFlags;
use nix::sys::termios::{self, BaudRate, ControlFlags, FlushArg, InputFlags, SetArg};
use tracing::{debug, info};

use super::{Channel, closed, wait_ready};
use crate::error::{Error, Result};

/// Upper bound on a single write to the line.
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between open attempts while waiting for a device to appear.
const OPEN_RETRY: Duration = Duration::from_secs(1);

/// A raw-mode serial line.
#[derive(Debug)]
pub struct SerialChannel {
    /// Open tty handle; `None` once closed.
    file: Option<File>,
}

impl SerialChannel {
    /// Opens and configures the serial device at `path`.
    pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<Self> {
        let path = path.as_ref();
        let target = path.display().to_string();
        let rate = baud_rate(baud).ok_or_else(|| {
            Error::transport(
                &target,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("serial parameters out of range: {baud} baud"),
                ),
            )
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| Error::transport(&target, e))?;
        configure(&file, rate).map_err(|e| Error::transport(&target, e))?;
        debug!(device = %target, baud, "serial line open");
        Ok(Self { file: Some(file) })
    }

    /// Like [`SerialChannel::open`], retrying for up to `wait` while the
    /// device is absent (e.g. a board still enumerating on USB).
    pub fn open_with_wait(path: impl AsRef<Path>, baud: u32, wait: Duration) -> Result<Self> {
        let path = path.as_ref();
        let deadline = Instant::now() + wait;
        let mut announced = false;
        loop {
            match Self::open(path, baud) {
                Ok(ch) => return Ok(ch),
                Err(Error::Transport { source, .. })
                    if is_absent(&source) && Instant::now() < deadline =>
                {
                    if !announced {
                        info!(device = %path.display(), ?wait, "waiting for device");
                        announced = true;
                    }
                    thread::sleep(OPEN_RETRY.min(deadline.saturating_duration_since(Instant::now())));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wraps an already-open tty descriptor, applying the same line setup
    /// as [`SerialChannel::open`].
    pub fn from_fd(fd: OwnedFd, baud: u32) -> Result<Self> {
        let rate = baud_rate(baud).ok_or_else(|| {
            Error::InvalidConfig(format!("serial parameters out of range: {baud} baud"))
        })?;
        set_nonblocking(&fd)?;
        let file = File::from(fd);
        configure(&file, rate)?;
        Ok(Self { file: Some(file) })
    }

    /// The open handle, or `NotConnected`.
    fn file(&mut self) -> io::Result<&mut File> {
        self.file.as_mut().ok_or_else(closed)
    }
}

impl Channel for SerialChannel {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        let file = self.file()?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            wait_ready(file.as_fd(), PollFlags::POLLIN, remaining)?;
        }
        Ok(filled)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let deadline = Instant::now() + WRITE_TIMEOUT;
        let file = self.file()?;
        let mut written = 0;
        while written < data.len() {
            match file.write(&data[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "serial write timed out",
                        ));
                    }
                    wait_ready(file.as_fd(), PollFlags::POLLOUT, remaining)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let file = self.file()?;
        let mut n: libc::c_int = 0;
        // SAFETY: FIONREAD writes a single c_int through the provided pointer.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), libc::FIONREAD, &raw mut n) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(usize::try_from(n).unwrap_or(0))
    }

    fn flush_input(&mut self) -> io::Result<()> {
        let file = self.file()?;
        termios::tcflush(&*file, FlushArg::TCIFLUSH).map_err(io::Error::from)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => {
                drop(file);
                Ok(())
            }
            None => Err(closed()),
        }
    }
}

/// Puts the line into raw 8N1 mode at `rate` with flow control off,
/// then lowers RTS and DTR.
fn configure(file: &File, rate: BaudRate) -> io::Result<()> {
    let mut tio = termios::tcgetattr(file)?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, rate)?;
    tio.control_flags
        .insert(ControlFlags::CLOCAL | ControlFlags::CREAD);
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
    tio.control_flags.remove(ControlFlags::CRTSCTS);
    tio.input_flags
        .remove(InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);
    termios::tcsetattr(file, SetArg::TCSANOW, &tio)?;

    let lines: libc::c_int = libc::TIOCM_DTR | libc::TIOCM_RTS;
    // SAFETY: TIOCMBIC reads a single c_int through the provided pointer.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), libc::TIOCMBIC, &raw const lines) };
    if ret == -1 {
        // Pseudo-terminals and some adapters have no modem lines.
        debug!(
            error = %io::Error::last_os_error(),
            "cannot lower RTS/DTR; continuing"
        );
    }
    Ok(())
}

/// Sets `O_NONBLOCK` on a descriptor.
fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fcntl(F_GETFL/F_SETFL) on a valid descriptor.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Whether an open failure means the device node does not exist (yet).
fn is_absent(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    ) || e.raw_os_error() == Some(libc::ENXIO)
        || e.raw_os_error() == Some(libc::EBUSY)
}

/// Maps a numeric rate to a termios constant.
const fn baud_rate(baud: u32) -> Option<BaudRate> {
    Some(match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        460_800 => BaudRate::B460800,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        921_600 => BaudRate::B921600,
        _ => return None,
    })
}

//! Serial-over-telnet channel for boards with a network REPL.
//!
//! The board's telnet server asks for a username and a password, prints
//! its banner, and from then on relays raw bytes to and from the REPL.
//! Received bytes are decoded into an internal FIFO; reads are served
//! from the FIFO and wait on the socket against a wall-clock deadline.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::thread;
use std::time::{Duration, Instant};

use mpboard_proto::find;
use nix::poll::PollFlags;
use tracing::debug;

use super::telnet::{self, Decoder};
use super::{Channel, closed, wait_ready};
use crate::error::{Error, Result};

/// Default telnet port.
pub const TELNET_PORT: u16 = 23;

/// Upper bound on establishing the TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause before sending the password; the server's input loop drops
/// lines that arrive too soon after the prompt.
const PASSWORD_DELAY: Duration = Duration::from_millis(200);

/// Poll interval when no read timeout is configured.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Prompt asking for the username.
const LOGIN_PROMPT: &[u8] = b"Login as:";
/// Prompt asking for the password.
const PASSWORD_PROMPT: &[u8] = b"Password:";
/// Tail of the banner printed once the REPL is ready.
const READY_BANNER: &[u8] = b"for more information.";

/// A [`Channel`] tunnelled through an authenticated telnet session.
///
/// Generic over the stream so tests can substitute a socket pair.
#[derive(Debug)]
pub struct LoginRelay<S = TcpStream> {
    /// Underlying connection; `None` once closed.
    stream: Option<S>,
    /// Decoded bytes not yet handed to a reader.
    fifo: VecDeque<u8>,
    /// Telnet command decoder.
    decoder: Decoder,
    /// Bound on each read and on each handshake step. `None` waits forever.
    read_timeout: Option<Duration>,
    /// Whether the board has closed its end of the connection.
    eof: bool,
}

impl LoginRelay<TcpStream> {
    /// Connects to `address` (`host` or `host:port`, default port 23) and
    /// logs in.
    pub fn connect(
        address: &str,
        user: &str,
        password: &str,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        let addr = resolve(address).map_err(|e| Error::transport(address, e))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| Error::transport(address, e))?;
        stream.set_nodelay(true)?;
        debug!(%addr, "telnet connected");
        Self::login(stream, user, password, read_timeout)
    }
}

impl<S: Read + Write + AsFd> LoginRelay<S> {
    /// Runs the login handshake over an already-connected stream.
    ///
    /// Fails with [`Error::Handshake`] if any prompt does not appear
    /// within `read_timeout`. There is no retry.
    pub fn login(
        stream: S,
        user: &str,
        password: &str,
        read_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut relay = Self {
            stream: Some(stream),
            fifo: VecDeque::new(),
            decoder: Decoder::default(),
            read_timeout,
            eof: false,
        };

        relay.expect(LOGIN_PROMPT, "login prompt")?;
        relay.send_line(user)?;
        relay.expect(PASSWORD_PROMPT, "password prompt")?;
        thread::sleep(PASSWORD_DELAY);
        relay.send_line(password)?;
        relay.expect(READY_BANNER, "REPL banner")?;
        debug!(user, "telnet login complete");
        Ok(relay)
    }

    /// Reads until `pattern` has been received, discarding everything up
    /// to and including it.
    fn expect(&mut self, pattern: &[u8], what: &str) -> Result<()> {
        let deadline = self.read_timeout.map(|t| Instant::now() + t);
        loop {
            self.pull()?;
            if let Some(pos) = find(self.fifo.make_contiguous(), pattern) {
                self.fifo.drain(..pos + pattern.len());
                return Ok(());
            }
            if self.eof {
                return Err(hung_up().into());
            }
            let wait = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::Handshake(format!(
                            "no {what} within {:?}",
                            self.read_timeout.unwrap_or_default()
                        )));
                    }
                    remaining
                }
                None => IDLE_POLL,
            };
            self.wait_readable(wait)?;
        }
    }

    /// Sends `line` terminated by CRLF.
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.send(&data)
    }

    /// Writes `data` with telnet escaping applied.
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if self.eof {
            return Err(hung_up());
        }
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        stream.write_all(&telnet::escape(data))?;
        stream.flush()
    }

    /// Moves every byte the socket has ready into the FIFO without blocking.
    ///
    /// Stops reading once the board hangs up; bytes already decoded stay
    /// in the FIFO.
    fn pull(&mut self) -> io::Result<()> {
        if self.eof {
            return Ok(());
        }
        let Self {
            stream,
            fifo,
            decoder,
            eof,
            ..
        } = self;
        let stream = stream.as_mut().ok_or_else(closed)?;
        let mut buf = [0u8; 1024];
        let mut replies = Vec::new();
        while wait_ready(stream.as_fd(), PollFlags::POLLIN, Duration::ZERO)? {
            let n = match stream.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };
            if n == 0 {
                debug!(queued = fifo.len(), "telnet connection closed by board");
                *eof = true;
                break;
            }
            decoder.decode(&buf[..n], fifo, &mut replies);
        }
        if !replies.is_empty() && !*eof {
            stream.write_all(&replies)?;
            stream.flush()?;
        }
        Ok(())
    }

    /// Blocks until the socket is readable or `timeout` elapses.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let stream = self.stream.as_ref().ok_or_else(closed)?;
        wait_ready(stream.as_fd(), PollFlags::POLLIN, timeout)
    }
}

impl<S: Read + Write + AsFd + Send + std::fmt::Debug> Channel for LoginRelay<S> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let timeout = self.read_timeout.map_or(timeout, |t| t.min(timeout));
        let deadline = Instant::now() + timeout;
        loop {
            self.pull()?;
            if self.fifo.len() >= buf.len() || self.eof {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.wait_readable(remaining)?;
        }
        if self.eof && self.fifo.is_empty() && !buf.is_empty() {
            return Err(hung_up());
        }
        let n = buf.len().min(self.fifo.len());
        for (dst, src) in buf.iter_mut().zip(self.fifo.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.send(data)?;
        Ok(data.len())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        if self.fifo.is_empty() {
            self.pull()?;
        }
        Ok(self.fifo.len())
    }

    fn flush_input(&mut self) -> io::Result<()> {
        self.pull()?;
        self.fifo.clear();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.stream.take().map(drop).ok_or_else(closed)
    }
}

/// Error reported once the board has hung up and the FIFO is drained.
fn hung_up() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "telnet connection closed by board",
    )
}

/// Resolves `host[:port]`, defaulting to the telnet port.
fn resolve(address: &str) -> io::Result<SocketAddr> {
    let mut addrs = if address.contains(':') {
        address.to_socket_addrs()?
    } else {
        (address, TELNET_PORT).to_socket_addrs()?
    };
    addrs.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{address} did not resolve"),
        )
    })
}

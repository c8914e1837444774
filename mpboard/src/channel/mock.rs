//! In-memory raw REPL device double for session tests.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use mpboard_proto::{EOT, RAW_BANNER};

use super::{Channel, closed};

/// Produces the bytes a device sends after `OK` for a given program.
type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Shared state of a [`MockDevice`], inspected by tests after the
/// channel has been moved into a session.
pub(crate) struct Inner {
    /// Bytes waiting to be read by the host.
    inbox: VecDeque<u8>,
    /// Every write call made by the host, in order.
    pub(crate) writes: Vec<Vec<u8>>,
    /// Whether the device is in raw mode.
    pub(crate) raw: bool,
    /// Program bytes received since the last submission.
    command: Vec<u8>,
    /// Programs submitted so far.
    pub(crate) programs: Vec<Vec<u8>>,
    /// Number of `close` calls.
    pub(crate) closes: usize,
    /// Number of `flush_input` calls.
    pub(crate) flushes: usize,
    /// Acknowledgment sent on submission.
    ack: Vec<u8>,
    /// Whether Ctrl-A produces the raw-mode banner.
    banner: bool,
    /// Largest number of bytes returned per read.
    chunk_limit: usize,
    /// Response generator.
    responder: Responder,
}

/// A scripted device speaking the raw REPL protocol.
#[derive(Clone)]
pub(crate) struct MockDevice(Arc<Mutex<Inner>>);

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice").finish_non_exhaustive()
    }
}

impl MockDevice {
    /// A device whose program output is produced by `responder`.
    pub(crate) fn new(responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Inner {
            inbox: VecDeque::new(),
            writes: Vec::new(),
            raw: false,
            command: Vec::new(),
            programs: Vec::new(),
            closes: 0,
            flushes: 0,
            ack: b"OK".to_vec(),
            banner: true,
            chunk_limit: usize::MAX,
            responder: Box::new(responder),
        })))
    }

    /// A device that answers every program with `stdout` and `stderr`.
    pub(crate) fn replying(stdout: &[u8], stderr: &[u8]) -> Self {
        let mut frame = stdout.to_vec();
        frame.push(EOT);
        frame.extend_from_slice(stderr);
        frame.push(EOT);
        Self::new(move |_| frame.clone())
    }

    /// Replaces the `OK` acknowledgment.
    pub(crate) fn with_ack(self, ack: &[u8]) -> Self {
        self.state().ack = ack.to_vec();
        self
    }

    /// Stops the device from printing the raw-mode banner.
    pub(crate) fn without_banner(self) -> Self {
        self.state().banner = false;
        self
    }

    /// Limits every read to `n` bytes.
    pub(crate) fn trickle(self, n: usize) -> Self {
        self.state().chunk_limit = n;
        self
    }

    /// Queues unsolicited output, as if printed by a running program.
    pub(crate) fn emit(&self, data: &[u8]) {
        self.state().inbox.extend(data);
    }

    /// Locks the shared state.
    pub(crate) fn state(&self) -> MutexGuard<'_, Inner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Reacts to one byte from the host.
    fn receive(&mut self, b: u8) {
        match (self.raw, b) {
            (_, 0x01) => {
                self.raw = true;
                self.command.clear();
                if self.banner {
                    self.inbox.extend(b"\r\n");
                    self.inbox.extend(RAW_BANNER);
                    self.inbox.push_back(b'>');
                }
            }
            (true, 0x02) => {
                self.raw = false;
                self.command.clear();
                self.inbox.extend(b"\r\nMicroPython\r\n>>> ");
            }
            (false, 0x03) => self.inbox.extend(b"\r\nKeyboardInterrupt\r\n>>> "),
            (true, 0x04) => {
                let program = std::mem::take(&mut self.command);
                self.inbox.extend(self.ack.clone());
                let response = (self.responder)(&program);
                self.inbox.extend(response);
                self.inbox.push_back(b'>');
                self.programs.push(program);
            }
            (true, 0x03) => self.command.clear(),
            (true, _) => self.command.push(b),
            (false, _) => {}
        }
    }
}

impl Channel for MockDevice {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut st = self.state();
        if st.closes > 0 {
            return Err(closed());
        }
        if st.inbox.is_empty() {
            drop(st);
            thread::sleep(timeout.min(Duration::from_millis(2)));
            return Ok(0);
        }
        let n = buf.len().min(st.inbox.len()).min(st.chunk_limit);
        for (dst, src) in buf.iter_mut().zip(st.inbox.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut st = self.state();
        if st.closes > 0 {
            return Err(closed());
        }
        st.writes.push(data.to_vec());
        for &b in data {
            st.receive(b);
        }
        Ok(data.len())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        let st = self.state();
        Ok(st.inbox.len().min(st.chunk_limit))
    }

    fn flush_input(&mut self) -> io::Result<()> {
        let mut st = self.state();
        st.flushes += 1;
        st.inbox.clear();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut st = self.state();
        st.closes += 1;
        if st.closes > 1 { Err(closed()) } else { Ok(()) }
    }
}

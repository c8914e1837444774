//! Raw REPL session with a board.
//!
//! A [`Session`] owns one [`Channel`] and tracks whether the board is in
//! the friendly or the raw REPL. In raw mode a program is written in
//! chunks, submitted with Ctrl-D, acknowledged with `OK`, and answered
//! with two sentinel-terminated output streams:
//!
//! ```text
//! host → device   <program> 0x04
//! device → host   OK <stdout> 0x04 <stderr> 0x04
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use std::{fs, io, mem};

use mpboard_proto::{
    ACK, CHUNK_PAUSE, CHUNK_SIZE, ENTER_RAW, EOT, EXIT_RAW, INTERRUPT, OutputFramer, RAW_BANNER,
    RAW_PROMPT, Stage, chunks, find,
};
use tracing::debug;

use crate::channel::Channel;
#[cfg(unix)]
use crate::channel::{LoginRelay, SerialChannel};
use crate::config::{SessionBuilder, SessionConfig};
use crate::error::{Error, Mode, ProtocolError, Result};
use crate::target::Target;

/// Timeout used by [`Session::exec`] and friends.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the raw-mode banner.
const BANNER_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the `OK` acknowledgment.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest single wait on the channel, so the interrupt flag stays responsive.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Normal output and error output of one program run.
pub type Output = (Vec<u8>, Vec<u8>);

/// A connection to a board driving its raw REPL.
///
/// The channel is closed exactly once: by [`Session::close`], or on drop.
#[derive(Debug)]
pub struct Session {
    /// Exclusively owned transport.
    channel: Box<dyn Channel>,
    /// REPL mode the board was last put into.
    mode: Mode,
    /// Pause before each raw-mode entry.
    raw_delay: Duration,
    /// Wait for the raw-mode banner.
    banner_timeout: Duration,
    /// Bytes read past the end of the last delimiter.
    pending: Vec<u8>,
    /// Cancellation flag checked between reads.
    interrupt: Option<Arc<AtomicBool>>,
    /// Whether the channel has been closed.
    closed: bool,
}

impl Session {
    /// Returns a builder for opening a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Opens the channel described by `config`.
    ///
    /// IPv4-looking devices are reached over telnet; everything else is
    /// opened as a serial port.
    #[cfg(unix)]
    pub fn open(config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let channel: Box<dyn Channel> = match Target::parse(&config.device) {
            Target::Network(host) => Box::new(LoginRelay::connect(
                &host,
                &config.user,
                &config.password,
                config.read_timeout()?,
            )?),
            Target::Serial(path) => Box::new(SerialChannel::open_with_wait(
                path,
                config.baud,
                config.wait()?,
            )?),
        };
        debug!(device = %config.device, "session open");
        Ok(Self::new(channel, config.raw_delay()?))
    }

    /// Opens the channel described by `config`.
    #[cfg(not(unix))]
    pub fn open(config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        Err(Error::transport(
            Target::parse(&config.device).to_string(),
            io::Error::new(io::ErrorKind::Unsupported, "requires a Unix host"),
        ))
    }

    /// Wraps an already-open channel. The board is assumed to be in the
    /// friendly REPL.
    pub fn new(channel: Box<dyn Channel>, raw_delay: Duration) -> Self {
        Self {
            channel,
            mode: Mode::Friendly,
            raw_delay,
            banner_timeout: BANNER_TIMEOUT,
            pending: Vec::new(),
            interrupt: None,
            closed: false,
        }
    }

    /// Installs a flag that cancels in-flight reads when set.
    pub fn set_interrupt(&mut self, flag: Arc<AtomicBool>) {
        self.interrupt = Some(flag);
    }

    /// REPL mode the board was last put into.
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Stops any running program and switches the board to raw mode.
    ///
    /// Fails with [`ProtocolError::EnterRawRepl`] if the banner does not
    /// arrive within 10 s, and with [`Error::Mode`] if already in raw mode.
    pub fn enter_raw_repl(&mut self) -> Result<()> {
        self.require_mode("enter_raw_repl", Mode::Friendly)?;
        if !self.raw_delay.is_zero() {
            thread::sleep(self.raw_delay);
        }

        self.write_all(INTERRUPT)?;
        self.flush_input()?;
        self.write_all(ENTER_RAW)?;

        let data = self.read_until(RAW_BANNER, Some(self.banner_timeout))?;
        if !data.ends_with(RAW_BANNER) {
            debug!(received = data.len(), "raw REPL banner missing");
            return Err(ProtocolError::EnterRawRepl.into());
        }
        self.check_prompt();
        self.flush_input()?;
        self.mode = Mode::Raw;
        Ok(())
    }

    /// Returns the board to the friendly REPL. Nothing is read back.
    pub fn exit_raw_repl(&mut self) -> Result<()> {
        self.require_mode("exit_raw_repl", Mode::Raw)?;
        self.write_all(EXIT_RAW)?;
        self.mode = Mode::Friendly;
        Ok(())
    }

    /// Submits `command` without waiting for its output.
    ///
    /// The program is written in 256-byte chunks with a short pause
    /// between them, then submitted with Ctrl-D. The board must answer
    /// `OK`.
    pub fn exec_raw_no_follow(&mut self, command: impl AsRef<[u8]>) -> Result<()> {
        self.require_mode("exec", Mode::Raw)?;
        let command = command.as_ref();
        debug!(
            bytes = command.len(),
            chunks = command.len().div_ceil(CHUNK_SIZE),
            "submitting program"
        );
        for chunk in chunks(command) {
            self.write_all(chunk)?;
            thread::sleep(CHUNK_PAUSE);
        }
        self.write_all(&[EOT])?;

        let ack = self.read_exact(ACK.len(), ACK_TIMEOUT)?;
        if ack != ACK {
            debug!(?ack, "program not acknowledged");
            return Err(ProtocolError::ExecNotAcknowledged.into());
        }
        Ok(())
    }

    /// Collects the output of a submitted program.
    ///
    /// Normal output is passed to `sink` as it arrives. Each of the two
    /// streams must end with its sentinel within `timeout` (`None` waits
    /// forever); otherwise the call fails and no partial output is
    /// returned. Remaining input is discarded afterwards.
    pub fn follow(
        &mut self,
        timeout: Option<Duration>,
        mut sink: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<Output> {
        let mut framer = OutputFramer::new();
        let mut stage = framer.stage();
        let mut deadline = timeout.map(|t| Instant::now() + t);
        let mut chunk = mem::take(&mut self.pending);

        loop {
            let feed = framer.feed(&chunk);
            if !feed.stdout.is_empty() {
                if let Some(sink) = sink.as_deref_mut() {
                    sink(feed.stdout);
                }
            }
            if framer.is_complete() {
                self.pending = feed.rest.to_vec();
                break;
            }
            if framer.stage() != stage {
                stage = framer.stage();
                deadline = timeout.map(|t| Instant::now() + t);
            }
            if !self.fill(deadline)? {
                return Err(match stage {
                    Stage::Normal => ProtocolError::FirstEof,
                    _ => ProtocolError::SecondEof,
                }
                .into());
            }
            chunk = mem::take(&mut self.pending);
        }

        self.flush_input()?;
        Ok(framer.finish())
    }

    /// Submits `command` and collects its output.
    pub fn exec_raw(
        &mut self,
        command: impl AsRef<[u8]>,
        timeout: Option<Duration>,
        sink: Option<&mut dyn FnMut(&[u8])>,
    ) -> Result<Output> {
        self.exec_raw_no_follow(command)?;
        self.follow(timeout, sink)
    }

    /// Runs `command` and returns its normal output.
    ///
    /// Fails with [`Error::RemoteExecution`] if the board reported error
    /// output.
    pub fn exec(&mut self, command: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let (stdout, stderr) = self.exec_raw(command, Some(DEFAULT_TIMEOUT), None)?;
        if stderr.is_empty() {
            Ok(stdout)
        } else {
            Err(Error::RemoteExecution { stdout, stderr })
        }
    }

    /// Evaluates a Python expression and returns its printed value,
    /// trimmed of surrounding whitespace.
    pub fn eval(&mut self, expression: &str) -> Result<Vec<u8>> {
        let out = self.exec(format!("print({expression})"))?;
        Ok(out.trim_ascii().to_vec())
    }

    /// Runs the contents of a local file.
    pub fn execfile(&mut self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let program = fs::read(path)?;
        self.exec(program)
    }

    /// Reads the board's real-time clock as seconds since midnight.
    ///
    /// Uses `pyb.RTC().datetime()`, whose tuple is
    /// `(year, month, day, weekday, hours, minutes, seconds, subseconds)`.
    pub fn rtc_seconds(&mut self) -> Result<u32> {
        let out = self.eval("pyb.RTC().datetime()")?;
        parse_rtc_seconds(&String::from_utf8_lossy(&out)).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unexpected RTC reply: {}",
                    String::from_utf8_lossy(&out).trim()
                ),
            )
            .into()
        })
    }

    /// Closes the channel. Close failures are logged and ignored.
    pub fn close(mut self) {
        self.shutdown();
    }

    /// Closes the channel if still open.
    fn shutdown(&mut self) {
        if mem::replace(&mut self.closed, true) {
            return;
        }
        if let Err(e) = self.channel.close() {
            debug!(error = %e, "ignoring channel close failure");
        }
    }

    /// Rejects calls made in the wrong mode.
    fn require_mode(&self, op: &'static str, expected: Mode) -> Result<()> {
        if self.mode == expected {
            Ok(())
        } else {
            Err(Error::Mode {
                op,
                expected,
                actual: self.mode,
            })
        }
    }

    /// Logs whether the raw prompt followed the banner. Advisory only: the
    /// prompt may still be in flight.
    fn check_prompt(&mut self) {
        let seen = self.pending.first() == Some(&RAW_PROMPT);
        let queued = self.channel.bytes_available().unwrap_or(0);
        debug!(seen, queued, "raw prompt check");
    }

    /// Writes all of `data` to the channel.
    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let n = self.channel.write(data)?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Discards everything received so far.
    fn flush_input(&mut self) -> Result<()> {
        self.pending.clear();
        self.channel.flush_input()?;
        Ok(())
    }

    /// Reads one batch from the channel into `pending`.
    ///
    /// Returns `Ok(false)` once `deadline` has passed.
    fn fill(&mut self, deadline: Option<Instant>) -> Result<bool> {
        if self
            .interrupt
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Relaxed))
        {
            return Err(Error::Interrupted);
        }
        let slice = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                remaining.min(POLL_SLICE)
            }
            None => POLL_SLICE,
        };
        let want = self.channel.bytes_available()?.clamp(1, CHUNK_SIZE);
        let mut buf = vec![0u8; want];
        let n = self.channel.read(&mut buf, slice)?;
        self.pending.extend_from_slice(&buf[..n]);
        Ok(true)
    }

    /// Reads until `ending` has been received or `timeout` elapses.
    ///
    /// Returns everything consumed; the caller checks whether it ends with
    /// `ending`.
    fn read_until(&mut self, ending: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut scanned: usize = 0;
        loop {
            let from = scanned.saturating_sub(ending.len());
            if let Some(pos) = find(&self.pending[from..], ending) {
                let rest = self.pending.split_off(from + pos + ending.len());
                return Ok(mem::replace(&mut self.pending, rest));
            }
            scanned = self.pending.len();
            if !self.fill(deadline)? {
                return Ok(mem::take(&mut self.pending));
            }
        }
    }

    /// Reads exactly `n` bytes, or fewer if `timeout` elapses.
    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Some(Instant::now() + timeout);
        while self.pending.len() < n {
            if !self.fill(deadline)? {
                break;
            }
        }
        let rest = self.pending.split_off(n.min(self.pending.len()));
        Ok(mem::replace(&mut self.pending, rest))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Extracts `hours*3600 + minutes*60 + seconds` from an RTC tuple.
fn parse_rtc_seconds(reply: &str) -> Option<u32> {
    let inner = reply.trim().strip_prefix('(')?.strip_suffix(')')?;
    let fields: Vec<u32> = inner
        .split(',')
        .map(|f| f.trim().parse().ok())
        .collect::<Option<_>>()?;
    let (h, m, s) = (*fields.get(4)?, *fields.get(5)?, *fields.get(6)?);
    h.checked_mul(3600)?
        .checked_add(m.checked_mul(60)?)?
        .checked_add(s)
}

/// Opens a board, runs `program` in raw mode and closes the board again.
///
/// The session is closed on every path, including failures.
pub fn run_buffer(config: &SessionConfig, program: impl AsRef<[u8]>) -> Result<Vec<u8>> {
    let mut session = Session::open(config)?;
    session.enter_raw_repl()?;
    let result = session.exec(program);
    let exited = session.exit_raw_repl();
    session.close();
    let out = result?;
    exited?;
    Ok(out)
}

/// Like [`run_buffer`], reading the program from a local file.
pub fn run_file(config: &SessionConfig, path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let program = fs::read(path)?;
    run_buffer(config, program)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::channel::mock::MockDevice;

    fn session(device: &MockDevice) -> Session {
        Session::new(Box::new(device.clone()), Duration::ZERO)
    }

    fn raw_session(device: &MockDevice) -> Session {
        let mut s = session(device);
        s.enter_raw_repl().unwrap();
        s
    }

    #[test]
    fn enters_and_exits_raw_mode() {
        let dev = MockDevice::replying(b"", b"");
        let mut s = session(&dev);
        s.enter_raw_repl().unwrap();
        assert_eq!(s.mode(), Mode::Raw);
        assert!(dev.state().raw);
        {
            let st = dev.state();
            assert_eq!(st.writes[0], INTERRUPT);
            assert_eq!(st.writes[1], ENTER_RAW);
        }

        s.exit_raw_repl().unwrap();
        assert_eq!(s.mode(), Mode::Friendly);
        assert!(!dev.state().raw);
        assert_eq!(dev.state().writes.last().unwrap(), EXIT_RAW);

        // A second round-trip behaves the same.
        s.enter_raw_repl().unwrap();
        assert_eq!(s.mode(), Mode::Raw);
    }

    #[test]
    fn double_entry_is_rejected() {
        let dev = MockDevice::replying(b"", b"");
        let mut s = raw_session(&dev);
        let writes = dev.state().writes.len();
        let err = s.enter_raw_repl().unwrap_err();
        assert!(matches!(
            err,
            Error::Mode {
                expected: Mode::Friendly,
                actual: Mode::Raw,
                ..
            }
        ));
        // Nothing was sent to the board.
        assert_eq!(dev.state().writes.len(), writes);
    }

    #[test]
    fn exec_requires_raw_mode() {
        let dev = MockDevice::replying(b"", b"");
        let mut s = session(&dev);
        assert!(matches!(s.exec("1"), Err(Error::Mode { .. })));
        assert!(matches!(s.exit_raw_repl(), Err(Error::Mode { .. })));
    }

    #[test]
    fn missing_banner_fails() {
        let dev = MockDevice::replying(b"", b"").without_banner();
        let mut s = session(&dev);
        s.banner_timeout = Duration::from_millis(100);
        let err = s.enter_raw_repl().unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::EnterRawRepl)));
        assert_eq!(err.to_string(), "could not enter raw repl");
        assert_eq!(s.mode(), Mode::Friendly);
    }

    #[test]
    fn raw_delay_is_honoured() {
        let dev = MockDevice::replying(b"", b"");
        let mut s = Session::new(Box::new(dev), Duration::from_millis(150));
        let start = Instant::now();
        s.enter_raw_repl().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn program_is_chunked_and_submitted() {
        let dev = MockDevice::replying(b"", b"");
        let mut s = raw_session(&dev);
        let before = dev.state().writes.len();

        let program: Vec<u8> = (0..700u32).map(|i| b'a' + (i % 26) as u8).collect();
        s.exec(&program).unwrap();

        let st = dev.state();
        let sent = &st.writes[before..];
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].len(), 256);
        assert_eq!(sent[1].len(), 256);
        assert_eq!(sent[2].len(), 188);
        assert_eq!(sent[3], [EOT]);
        assert_eq!(sent[..3].concat(), program);
        assert_eq!(st.programs.last().unwrap(), &program);
    }

    #[test]
    fn exec_returns_normal_output() {
        let dev = MockDevice::replying(b"hello", b"");
        let mut s = raw_session(&dev);
        assert_eq!(s.exec("print('hello', end='')").unwrap(), b"hello");
    }

    #[test]
    fn exec_raises_remote_execution_error() {
        let trace = b"Traceback (most recent call last):\r\nZeroDivisionError\r\n";
        let dev = MockDevice::replying(b"partial", trace);
        let mut s = raw_session(&dev);
        match s.exec("1/0").unwrap_err() {
            Error::RemoteExecution { stdout, stderr } => {
                assert_eq!(stdout, b"partial");
                assert_eq!(stderr, trace);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn wrong_ack_fails() {
        let dev = MockDevice::replying(b"", b"").with_ack(b"NO");
        let mut s = raw_session(&dev);
        let err = s.exec_raw_no_follow("x=1").unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ExecNotAcknowledged)
        ));
    }

    #[test]
    fn follow_splits_streams_and_streams_stdout() {
        let dev = MockDevice::replying(b"", b"").trickle(3);
        let mut s = raw_session(&dev);
        dev.emit(b"hello\x04\x04");

        let mut live = Vec::new();
        let mut calls = 0;
        let mut sink = |b: &[u8]| {
            live.extend_from_slice(b);
            calls += 1;
        };
        let (out, err) = s
            .follow(Some(Duration::from_secs(1)), Some(&mut sink))
            .unwrap();
        assert_eq!(out, b"hello");
        assert!(err.is_empty());
        assert_eq!(live, b"hello");
        assert!(calls >= 2, "expected incremental delivery, got {calls}");
    }

    #[test]
    fn follow_without_first_sentinel_times_out() {
        let dev = MockDevice::replying(b"", b"");
        let mut s = raw_session(&dev);
        dev.emit(b"no terminator");

        let err = s.follow(Some(Duration::from_millis(100)), None).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::FirstEof)));
    }

    #[test]
    fn follow_without_second_sentinel_times_out() {
        let dev = MockDevice::replying(b"", b"");
        let mut s = raw_session(&dev);
        dev.emit(b"out\x04err");

        let err = s.follow(Some(Duration::from_millis(100)), None).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::SecondEof)));
    }

    #[test]
    fn consecutive_commands_do_not_leak() {
        let mut n = 0;
        let dev = MockDevice::new(move |_| {
            n += 1;
            format!("run {n}\x04\x04").into_bytes()
        });
        let mut s = raw_session(&dev);
        let flushes = dev.state().flushes;
        assert_eq!(s.exec("a").unwrap(), b"run 1");
        assert_eq!(dev.state().flushes, flushes + 1);
        // The trailing '>' prompt of the first run must not precede "OK".
        assert_eq!(s.exec("b").unwrap(), b"run 2");
        assert_eq!(dev.state().flushes, flushes + 2);
        assert_eq!(dev.state().programs, [b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn eval_trims_output() {
        let dev = MockDevice::new(|prog| {
            assert_eq!(prog, b"print(1+1)");
            b"2\r\n\x04\x04".to_vec()
        });
        let mut s = raw_session(&dev);
        assert_eq!(s.eval("1+1").unwrap(), b"2");
    }

    #[test]
    fn execfile_sends_file_contents() {
        let dev = MockDevice::replying(b"ok", b"");
        let mut s = raw_session(&dev);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"import machine\nprint('ok')\n").unwrap();

        assert_eq!(s.execfile(file.path()).unwrap(), b"ok");
        assert_eq!(
            dev.state().programs.last().unwrap(),
            b"import machine\nprint('ok')\n"
        );
    }

    #[test]
    fn execfile_missing_file_is_io_error() {
        let dev = MockDevice::replying(b"", b"");
        let mut s = raw_session(&dev);
        assert!(matches!(
            s.execfile("/nonexistent/mpboard.py"),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn reads_rtc_seconds() {
        let dev = MockDevice::replying(b"(2024, 5, 17, 5, 13, 45, 30, 0)\r\n", b"");
        let mut s = raw_session(&dev);
        assert_eq!(s.rtc_seconds().unwrap(), 13 * 3600 + 45 * 60 + 30);
    }

    #[test]
    fn rtc_parse_rejects_garbage() {
        assert_eq!(parse_rtc_seconds("(2024, 5)"), None);
        assert_eq!(parse_rtc_seconds("None"), None);
        assert_eq!(parse_rtc_seconds("(1, 2, 3, 4, 0, 1, 2, 0)"), Some(62));
        assert_eq!(parse_rtc_seconds("(1, 2, 3, 4, 4000000, 0, 0, 0)"), None);
        assert_eq!(parse_rtc_seconds("(1, 2, 3, 4, 0, 1, 4294967295, 0)"), None);
    }

    #[test]
    fn interrupt_flag_cancels_follow() {
        let dev = MockDevice::replying(b"", b"");
        let mut s = raw_session(&dev);
        let flag = Arc::new(AtomicBool::new(false));
        s.set_interrupt(Arc::clone(&flag));

        let setter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                flag.store(true, Ordering::Relaxed);
            })
        };
        let err = s.follow(None, None).unwrap_err();
        setter.join().unwrap();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn closes_exactly_once() {
        let dev = MockDevice::replying(b"", b"");
        let s = session(&dev);
        s.close();
        assert_eq!(dev.state().closes, 1);

        {
            let _s = session(&MockDevice::replying(b"", b""));
        }
        let dev = MockDevice::replying(b"", b"").without_banner();
        {
            let mut s = session(&dev);
            s.banner_timeout = Duration::from_millis(20);
            assert!(s.enter_raw_repl().is_err());
        }
        assert_eq!(dev.state().closes, 1);
    }

    #[test]
    fn read_until_keeps_bytes_after_ending() {
        let dev = MockDevice::replying(b"", b"").trickle(4);
        let mut s = session(&dev);
        dev.emit(b"junk raw REPL; CTRL-B to exit\r\n>tail");
        let data = s
            .read_until(RAW_BANNER, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(data, b"junk raw REPL; CTRL-B to exit\r\n");
        assert!(s.pending.starts_with(b">"));
    }

    /// Serves a raw REPL on a fresh pseudo-terminal and returns the slave
    /// path. The thread yields every byte the host wrote and finishes once
    /// the host closes the line.
    #[cfg(target_os = "linux")]
    fn pty_board(
        banner: bool,
        ack: &'static [u8],
        reply: &'static [u8],
    ) -> (String, thread::JoinHandle<Vec<u8>>) {
        use std::io::Read as _;

        use nix::fcntl::OFlag;
        use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};

        let mut master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).unwrap();
        grantpt(&master).unwrap();
        unlockpt(&master).unwrap();
        let path = ptsname_r(&master).unwrap();

        let board = thread::spawn(move || {
            let mut wire = Vec::new();
            let mut buf = [0u8; 256];
            // EIO once the last slave descriptor is closed.
            while let Ok(n) = master.read(&mut buf) {
                if n == 0 {
                    break;
                }
                for &b in &buf[..n] {
                    match b {
                        0x01 if banner => {
                            master.write_all(b"raw REPL; CTRL-B to exit\r\n>").unwrap();
                        }
                        EOT => {
                            master.write_all(ack).unwrap();
                            master.write_all(reply).unwrap();
                        }
                        _ => {}
                    }
                }
                wire.extend_from_slice(&buf[..n]);
            }
            wire
        });
        (path, board)
    }

    #[cfg(target_os = "linux")]
    fn pty_config(path: String) -> SessionConfig {
        SessionConfig {
            device: path,
            ..SessionConfig::default()
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn run_buffer_drives_a_serial_board() {
        let (path, board) = pty_board(true, b"OK", b"hi\r\n\x04\x04>");
        let out = run_buffer(&pty_config(path), "print('hi')").unwrap();
        assert_eq!(out, b"hi\r\n");

        // join returns only after the session closed the line.
        let wire = board.join().unwrap();
        let expected: Vec<u8> =
            [INTERRUPT, ENTER_RAW, &b"print('hi')"[..], &[EOT][..], EXIT_RAW].concat();
        assert_eq!(wire, expected);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn run_buffer_leaves_raw_mode_and_closes_after_failed_exec() {
        let (path, board) = pty_board(true, b"NO", b"");
        let err = run_buffer(&pty_config(path), "x = 1").unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ExecNotAcknowledged)
        ));
        let wire = board.join().unwrap();
        assert!(wire.ends_with(EXIT_RAW));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn run_buffer_closes_when_banner_never_arrives() {
        let (path, board) = pty_board(false, b"OK", b"");
        let err = run_buffer(&pty_config(path), "x = 1").unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::EnterRawRepl)));
        let wire = board.join().unwrap();
        assert_eq!(wire, [INTERRUPT, ENTER_RAW].concat());
    }

    #[test]
    fn run_buffer_rejects_invalid_config() {
        let mut config = SessionConfig::default();
        config.baud = 0;
        assert!(matches!(
            run_buffer(&config, "pass"),
            Err(Error::InvalidConfig(_))
        ));
    }
}

//! Session configuration and its builder.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::Session;

/// Serializable description of how to reach and drive a board.
///
/// Durations are stored as fractional seconds so the JSON form stays
/// hand-editable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Serial device path, or an IPv4 address for a telnet board.
    pub device: String,
    /// Serial baud rate. Ignored for telnet.
    pub baud: u32,
    /// Telnet login name.
    pub user: String,
    /// Telnet password.
    pub password: String,
    /// How long to keep retrying while a serial device is absent.
    pub wait_secs: f64,
    /// Pause before every raw-mode entry, for boards that need to settle
    /// after a reset.
    pub raw_delay_secs: f64,
    /// Telnet read and handshake timeout. `None` waits forever.
    pub read_timeout_secs: Option<f64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyACM0".to_owned(),
            baud: 115_200,
            user: "micro".to_owned(),
            password: "python".to_owned(),
            wait_secs: 0.0,
            raw_delay_secs: 0.0,
            read_timeout_secs: Some(10.0),
        }
    }
}

impl SessionConfig {
    /// Loads a configuration from a JSON file. Missing fields take their
    /// default values.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Checks every field that can be checked without touching the device.
    pub fn validate(&self) -> Result<()> {
        if self.device.is_empty() {
            return Err(Error::InvalidConfig("device must not be empty".into()));
        }
        if self.baud == 0 {
            return Err(Error::InvalidConfig("baud rate must be positive".into()));
        }
        self.wait()?;
        self.raw_delay()?;
        self.read_timeout()?;
        Ok(())
    }

    /// Device-absent retry window.
    pub fn wait(&self) -> Result<Duration> {
        secs("wait", self.wait_secs)
    }

    /// Pause before raw-mode entry.
    pub fn raw_delay(&self) -> Result<Duration> {
        secs("raw delay", self.raw_delay_secs)
    }

    /// Telnet read timeout.
    pub fn read_timeout(&self) -> Result<Option<Duration>> {
        self.read_timeout_secs
            .map(|s| secs("read timeout", s))
            .transpose()
    }
}

/// Converts fractional seconds, rejecting negative and non-finite values.
fn secs(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        Error::InvalidConfig(format!(
            "{name} must be a non-negative number of seconds, got {value}"
        ))
    })
}

/// Builder for opening a [`Session`].
///
/// Defaults: `/dev/ttyACM0` at 115200 baud, telnet login `micro`/`python`,
/// no wait, no raw delay, 10 s telnet read timeout.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// let mut board = mpboard::Session::builder()
///     .device("/dev/ttyUSB0")
///     .raw_delay(Duration::from_millis(500))
///     .open()
///     .expect("board not reachable");
/// board.enter_raw_repl().expect("no raw REPL");
/// ```
#[derive(Debug, Default)]
#[must_use = "a SessionBuilder does nothing until .open() is called"]
pub struct SessionBuilder {
    /// Accumulated settings.
    config: SessionConfig,
    /// Cancellation flag handed to the session.
    interrupt: Option<Arc<AtomicBool>>,
}

impl SessionBuilder {
    /// Starts from an existing configuration.
    pub const fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            interrupt: None,
        }
    }

    /// Sets the device path or board IP address.
    pub fn device(mut self, address: impl Into<String>) -> Self {
        self.config.device = address.into();
        self
    }

    /// Sets the serial baud rate (default: 115200).
    pub const fn baud(mut self, baud: u32) -> Self {
        self.config.baud = baud;
        self
    }

    /// Sets the telnet login name (default: `micro`).
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = user.into();
        self
    }

    /// Sets the telnet password (default: `python`).
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    /// Keeps retrying an absent serial device for up to `wait`.
    pub fn wait(mut self, wait: Duration) -> Self {
        self.config.wait_secs = wait.as_secs_f64();
        self
    }

    /// Sleeps for `delay` before each raw-mode entry.
    pub fn raw_delay(mut self, delay: Duration) -> Self {
        self.config.raw_delay_secs = delay.as_secs_f64();
        self
    }

    /// Bounds telnet reads and handshake steps. `None` waits forever.
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.read_timeout_secs = timeout.map(|t| t.as_secs_f64());
        self
    }

    /// Makes in-flight reads fail with [`Error::Interrupted`] once `flag`
    /// is set, e.g. from a Ctrl-C handler.
    pub fn interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// The configuration built so far.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Opens the channel and returns a session in friendly mode.
    pub fn open(self) -> Result<Session> {
        let mut session = Session::open(&self.config)?;
        if let Some(flag) = self.interrupt {
            session.set_interrupt(flag);
        }
        Ok(session)
    }
}

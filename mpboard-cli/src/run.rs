//! Running inline commands and script files on a board.
//!
//! Every buffer gets its own session: open, settle, raw mode, execute,
//! leave raw mode, close.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use std::{fs, thread};

use anyhow::{Context, Result, bail};
use mpboard::{SessionBuilder, SessionConfig};

/// Pause between opening the channel and entering raw mode.
const SETTLE: Duration = Duration::from_secs(1);

/// Connection settings and the programs to run.
#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Serial device path, or the IPv4 address of a telnet board.
    #[arg(long, env = "MPBOARD_DEVICE")]
    device: Option<String>,

    /// Serial baud rate.
    #[arg(short = 'b', long = "baudrate", env = "MPBOARD_BAUDRATE")]
    baudrate: Option<u32>,

    /// Telnet login name.
    #[arg(short = 'u', long, env = "MPBOARD_USER")]
    user: Option<String>,

    /// Telnet password.
    #[arg(short = 'p', long, env = "MPBOARD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Program text to run before any files.
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Seconds to wait for an absent serial device to appear.
    #[arg(short = 'w', long, env = "MPBOARD_WAIT")]
    wait: Option<f64>,

    /// Seconds to pause before entering raw mode.
    #[arg(long, env = "MPBOARD_RAW_DELAY")]
    raw_delay: Option<f64>,

    /// Echo normal output while the program runs.
    #[arg(long)]
    follow: bool,

    /// JSON configuration file [default: <config dir>/mpboard/config.json].
    #[arg(long, value_name = "FILE", env = "MPBOARD_CONFIG")]
    config: Option<PathBuf>,

    /// Python files to run, in order.
    files: Vec<PathBuf>,
}

impl RunArgs {
    /// Runs the inline command, then every file.
    pub fn run(self, interrupt: &Arc<AtomicBool>) -> Result<()> {
        let config = self.session_config()?;
        let mut out = io::stdout();
        let mut err = io::stderr();

        if let Some(command) = &self.command {
            let program = command.as_bytes();
            exec_buffer(&config, program, self.follow, interrupt, &mut out, &mut err)
                .context("inline command")?;
        }
        for path in &self.files {
            let program =
                fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
            exec_buffer(&config, &program, self.follow, interrupt, &mut out, &mut err)
                .with_context(|| path.display().to_string())?;
        }
        Ok(())
    }

    /// Layers flags and environment over the config file over defaults.
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => load(path)?,
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(path) => load(&path)?,
                None => SessionConfig::default(),
            },
        };

        if let Some(device) = &self.device {
            config.device.clone_from(device);
        }
        if let Some(baud) = self.baudrate {
            config.baud = baud;
        }
        if let Some(user) = &self.user {
            config.user.clone_from(user);
        }
        if let Some(password) = &self.password {
            config.password.clone_from(password);
        }
        if let Some(wait) = self.wait {
            config.wait_secs = wait;
        }
        if let Some(delay) = self.raw_delay {
            config.raw_delay_secs = delay;
        }

        config.validate()?;
        Ok(config)
    }
}

/// `<config dir>/mpboard/config.json`, if the platform has a config dir.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mpboard").join("config.json"))
}

fn load(path: &Path) -> Result<SessionConfig> {
    SessionConfig::load(path).with_context(|| format!("cannot load config {}", path.display()))
}

/// Runs one program in a fresh session.
///
/// Normal output goes to `out`, live when `follow` is set. Error output
/// goes to `err` and fails the run.
fn exec_buffer(
    config: &SessionConfig,
    program: &[u8],
    follow: bool,
    interrupt: &Arc<AtomicBool>,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<()> {
    let mut session = SessionBuilder::from_config(config.clone())
        .interrupt(Arc::clone(interrupt))
        .open()
        .with_context(|| format!("cannot open {}", config.device))?;
    thread::sleep(SETTLE);
    session.enter_raw_repl()?;

    let mut echo = |data: &[u8]| {
        if let Err(e) = out.write_all(data).and_then(|()| out.flush()) {
            tracing::debug!("echo failed: {e}");
        }
    };
    let sink: Option<&mut dyn FnMut(&[u8])> = if follow { Some(&mut echo) } else { None };
    let (normal, error) = session.exec_raw(program, None, sink)?;

    session.exit_raw_repl()?;
    session.close();

    if !follow {
        out.write_all(&normal)?;
        out.flush()?;
    }
    if !error.is_empty() {
        err.write_all(&error)?;
        err.flush()?;
        bail!("program raised an exception");
    }
    Ok(())
}

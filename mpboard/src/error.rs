//! Error types for mpboard operations.

use std::fmt;
use std::io;

/// Alias for `Result<T, mpboard::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by board sessions and channels.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The transport could not be opened or configured.
    #[error("cannot open {target}: {source}")]
    Transport {
        /// Device path or network address that failed.
        target: String,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// The telnet login prompts were not observed in time.
    #[error("telnet handshake failed: {0}")]
    Handshake(String),

    /// The device violated the raw REPL protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The program ran but the device reported an exception.
    #[error("exception on device: {}", String::from_utf8_lossy(.stderr).trim_end())]
    RemoteExecution {
        /// Normal output produced before the failure.
        stdout: Vec<u8>,
        /// Error output (usually a traceback).
        stderr: Vec<u8>,
    },

    /// A call was made in the wrong REPL mode.
    #[error("{op} requires {expected} mode, session is in {actual} mode")]
    Mode {
        /// Operation that was rejected.
        op: &'static str,
        /// Mode the operation requires.
        expected: Mode,
        /// Mode the session was in.
        actual: Mode,
    },

    /// The operation was cancelled through the interrupt flag.
    #[error("interrupted")]
    Interrupted,

    /// A configuration value is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An I/O error on an open channel or local file.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Raw REPL protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The raw-mode banner did not arrive.
    #[error("could not enter raw repl")]
    EnterRawRepl,
    /// The device did not acknowledge the submitted program with `OK`.
    #[error("could not exec command")]
    ExecNotAcknowledged,
    /// The sentinel ending normal output did not arrive.
    #[error("timeout waiting for first EOF reception")]
    FirstEof,
    /// The sentinel ending error output did not arrive.
    #[error("timeout waiting for second EOF reception")]
    SecondEof,
}

/// REPL mode the device is in, as tracked by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Mode {
    /// Interactive REPL with echo and a `>>>` prompt.
    #[default]
    Friendly,
    /// Non-interactive raw REPL.
    Raw,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Friendly => "friendly",
            Self::Raw => "raw",
        })
    }
}

impl Error {
    /// Builds a [`Error::Transport`] for `target`.
    pub(crate) fn transport(target: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            target: target.into(),
            source,
        }
    }
}

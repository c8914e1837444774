//! Classification of a device address as a serial path or a network board.

use std::fmt;
use std::path::PathBuf;

/// Where a board is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Target {
    /// A telnet-reachable board, as `host` or `host:port`.
    Network(String),
    /// A local serial device such as `/dev/ttyACM0` or `COM3`.
    Serial(PathBuf),
}

impl Target {
    /// Classifies `address`.
    ///
    /// An address is a network target only if it starts and ends with an
    /// ASCII digit and contains exactly three dots, a coarse IPv4-literal
    /// test. Everything else is a serial device path.
    pub fn parse(address: &str) -> Self {
        if is_network_address(address) {
            Self::Network(address.to_owned())
        } else {
            Self::Serial(PathBuf::from(address))
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(host) => write!(f, "telnet://{host}"),
            Self::Serial(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Whether `address` looks like an IPv4 literal.
pub fn is_network_address(address: &str) -> bool {
    let bytes = address.as_bytes();
    matches!(
        (bytes.first(), bytes.last()),
        (Some(first), Some(last)) if first.is_ascii_digit() && last.is_ascii_digit()
    ) && address.matches('.').count() == 3
}

//! Host-side controller for MicroPython boards.
//!
//! `mpboard` reaches a board over a serial line or, for boards with a
//! network REPL, over telnet, switches it into the raw REPL, runs
//! programs on it, and collects their normal and error output.
//!
//! # Quick start
//!
//! ```no_run
//! use mpboard::Session;
//!
//! let mut board = Session::builder()
//!     .device("/dev/ttyACM0")
//!     .open()
//!     .expect("board not reachable");
//!
//! board.enter_raw_repl().expect("no raw REPL");
//! let out = board.exec("import sys; print(sys.platform)").expect("exec failed");
//! println!("{}", String::from_utf8_lossy(&out));
//! board.exit_raw_repl().expect("exit failed");
//! board.close();
//! ```
//!
//! The address `192.168.1.1` (or any other IPv4 literal) selects telnet;
//! anything else is opened as a serial device.

pub mod channel;
mod config;
mod error;
mod session;
mod target;

pub use channel::Channel;
#[cfg(unix)]
pub use channel::{LoginRelay, SerialChannel};
pub use config::{SessionBuilder, SessionConfig};
pub use error::{Error, Mode, ProtocolError, Result};
pub use session::{DEFAULT_TIMEOUT, Output, Session, run_buffer, run_file};
pub use target::{Target, is_network_address};

//! Raw REPL wire protocol for mpboard host↔device communication.
//!
//! The device answers every submitted program with
//! `OK <stdout> 0x04 <stderr> 0x04`. This crate holds the control
//! sequences of that exchange and the [`OutputFramer`] that splits the
//! response stream, independent of any transport.

mod framer;
mod message;

pub use framer::{Feed, OutputFramer, Stage, find};
pub use message::{
    ACK, CHUNK_PAUSE, CHUNK_SIZE, ENTER_RAW, EOT, EXIT_RAW, INTERRUPT, RAW_BANNER, RAW_PROMPT,
    chunks,
};

//! Control sequences exchanged with a device in raw REPL mode.

use std::time::Duration;

/// CR followed by two Ctrl-C: interrupts any running program.
pub const INTERRUPT: &[u8] = b"\r\x03\x03";

/// CR followed by Ctrl-A: switches the device into raw REPL mode.
pub const ENTER_RAW: &[u8] = b"\r\x01";

/// CR followed by Ctrl-B: returns the device to the friendly REPL.
pub const EXIT_RAW: &[u8] = b"\r\x02";

/// Ctrl-D. Submits a buffered program, and delimits each output stream.
pub const EOT: u8 = 0x04;

/// Acknowledgment sent by the device once a program has been accepted.
pub const ACK: &[u8] = b"OK";

/// Suffix of the banner printed when raw mode has been entered.
pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n";

/// Prompt byte that follows the raw-mode banner.
pub const RAW_PROMPT: u8 = b'>';

/// Largest segment of a program written in one go.
pub const CHUNK_SIZE: usize = 256;

/// Pause between segments so slow receivers do not overrun.
pub const CHUNK_PAUSE: Duration = Duration::from_millis(10);

/// Splits a program into the segments written to the device.
///
/// Concatenating the segments yields `payload` unchanged.
pub fn chunks(payload: &[u8]) -> std::slice::Chunks<'_, u8> {
    payload.chunks(CHUNK_SIZE)
}

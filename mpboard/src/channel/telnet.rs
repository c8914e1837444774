//! Minimal telnet (RFC 854) data-stream handling.
//!
//! The board's telnet server negotiates a few options on connect. Every
//! option is refused, sub-negotiations are discarded, and escaped `0xFF`
//! bytes are restored, leaving a clean byte stream for the relay.

use std::borrow::Cow;
use std::collections::VecDeque;

/// Interpret As Command.
const IAC: u8 = 255;
/// Refuse an option the peer wants us to perform.
const DONT: u8 = 254;
/// Request that we perform an option.
const DO: u8 = 253;
/// Refuse to perform an option.
const WONT: u8 = 252;
/// Offer to perform an option.
const WILL: u8 = 251;
/// Begin sub-negotiation.
const SB: u8 = 250;
/// End sub-negotiation.
const SE: u8 = 240;

/// Decoder position within a command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    /// Plain data.
    #[default]
    Data,
    /// Saw `IAC`.
    Iac,
    /// Saw `IAC <verb>`; the next byte names the option.
    Option(u8),
    /// Inside `IAC SB ...`.
    Sub,
    /// Saw `IAC` inside a sub-negotiation.
    SubIac,
    /// Saw CR in data; a following NUL is padding.
    Cr,
}

/// Streaming telnet decoder; command sequences may span reads.
#[derive(Debug, Default)]
pub(crate) struct Decoder {
    /// Current position.
    state: State,
}

impl Decoder {
    /// Appends the data bytes of `input` to `out` and the required
    /// option refusals to `replies`.
    pub(crate) fn decode(&mut self, input: &[u8], out: &mut VecDeque<u8>, replies: &mut Vec<u8>) {
        for &b in input {
            self.state = match (self.state, b) {
                (State::Data | State::Cr, IAC) => State::Iac,
                (State::Cr, 0) => State::Data,
                (State::Data | State::Cr, b'\r') => {
                    out.push_back(b'\r');
                    State::Cr
                }
                (State::Data | State::Cr, _) => {
                    out.push_back(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    out.push_back(IAC);
                    State::Data
                }
                (State::Iac, DO | DONT | WILL | WONT) => State::Option(b),
                (State::Iac, SB) => State::Sub,
                (State::Iac, _) => State::Data,
                (State::Option(verb), opt) => {
                    let answer = if matches!(verb, DO | DONT) { WONT } else { DONT };
                    replies.extend_from_slice(&[IAC, answer, opt]);
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
            };
        }
    }
}

/// Doubles every `0xFF` so data bytes are not read as commands.
pub(crate) fn escape(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.contains(&IAC) {
        return Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len() + 8);
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    Cow::Owned(out)
}

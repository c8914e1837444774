//! Incremental splitter for the dual-stream raw REPL response.
//!
//! After the `OK` acknowledgment the device emits
//! `[stdout bytes] 0x04 [stderr bytes] 0x04`. Bytes may arrive in any
//! partition, so the framer is fed chunk by chunk and reports which part
//! of each chunk belonged to which stream.

use crate::message::EOT;

/// Position of an [`OutputFramer`] within the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Stage {
    /// Collecting normal output; the first sentinel has not been seen.
    Normal,
    /// Collecting error output; the second sentinel has not been seen.
    Error,
    /// Both sentinels have been consumed.
    Complete,
}

/// Result of feeding one chunk into an [`OutputFramer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Feed<'a> {
    /// Normal-output bytes that arrived in this chunk, sentinel excluded.
    pub stdout: &'a [u8],
    /// Bytes after the second sentinel. Empty unless the response completed.
    pub rest: &'a [u8],
}

/// Splits a byte stream into normal output and error output.
#[derive(Debug, Default)]
pub struct OutputFramer {
    /// Bytes seen before the first sentinel.
    stdout: Vec<u8>,
    /// Bytes seen between the two sentinels.
    stderr: Vec<u8>,
    /// Number of sentinels consumed so far (0..=2).
    sentinels: u8,
}

impl OutputFramer {
    /// Creates a framer positioned at the start of a response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position within the response.
    pub const fn stage(&self) -> Stage {
        match self.sentinels {
            0 => Stage::Normal,
            1 => Stage::Error,
            _ => Stage::Complete,
        }
    }

    /// Whether both sentinels have been consumed.
    pub const fn is_complete(&self) -> bool {
        self.sentinels >= 2
    }

    /// Consumes `chunk` up to and including the second sentinel.
    pub fn feed<'a>(&mut self, chunk: &'a [u8]) -> Feed<'a> {
        let mut rest = chunk;
        let mut fresh: &'a [u8] = &[];

        if self.sentinels == 0 {
            let (head, tail) = split_at_sentinel(rest);
            self.stdout.extend_from_slice(head);
            fresh = head;
            if let Some(tail) = tail {
                self.sentinels = 1;
                rest = tail;
            } else {
                rest = &[];
            }
        }

        if self.sentinels == 1 {
            let (head, tail) = split_at_sentinel(rest);
            self.stderr.extend_from_slice(head);
            if let Some(tail) = tail {
                self.sentinels = 2;
                rest = tail;
            } else {
                rest = &[];
            }
        }

        Feed {
            stdout: fresh,
            rest,
        }
    }

    /// Returns `(stdout, stderr)` collected so far.
    pub fn finish(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout, self.stderr)
    }
}

/// Splits `data` at the first sentinel, dropping the sentinel itself.
fn split_at_sentinel(data: &[u8]) -> (&[u8], Option<&[u8]>) {
    match data.iter().position(|&b| b == EOT) {
        Some(i) => (&data[..i], Some(&data[i + 1..])),
        None => (data, None),
    }
}

/// Returns the index of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

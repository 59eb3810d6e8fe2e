//! Read termination.
//!
//! A read stops at the first of: the termination character (when enabled),
//! the requested byte count, or, with termination disabled, whatever data
//! is available. Bytes past the stopping point stay in the session's
//! carry-over buffer for the next read.

use bytes::{Bytes, BytesMut};
use visalib_core::status::Completion;

/// Parameters of one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    /// Maximum number of bytes to return.
    pub max: usize,
    /// Stop after this byte, if set.
    pub term_char: Option<u8>,
}

/// Data returned by a completed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub data: Bytes,
    /// Why the read stopped: [`Completion::TermChar`], [`Completion::MaxCount`]
    /// or [`Completion::Success`] for a partial read.
    pub completion: Completion,
}

impl ReadResult {
    pub(crate) fn empty() -> Self {
        Self {
            data: Bytes::new(),
            completion: Completion::Success,
        }
    }
}

/// Take one message from `carry` if a stopping condition is met.
///
/// Returns `None` when more data is needed.
pub fn take_message(carry: &mut BytesMut, limits: ReadLimits) -> Option<ReadResult> {
    let window = carry.len().min(limits.max);

    if let Some(tc) = limits.term_char {
        if let Some(pos) = carry[..window].iter().position(|&b| b == tc) {
            return Some(ReadResult {
                data: carry.split_to(pos + 1).freeze(),
                completion: Completion::TermChar,
            });
        }
    }

    if carry.len() >= limits.max {
        return Some(ReadResult {
            data: carry.split_to(limits.max).freeze(),
            completion: Completion::MaxCount,
        });
    }

    if limits.term_char.is_none() && !carry.is_empty() {
        return Some(ReadResult {
            data: carry.split().freeze(),
            completion: Completion::Success,
        });
    }

    None
}

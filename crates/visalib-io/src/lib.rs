//! Per-session IO task for visalib.
//!
//! One tokio task owns a session's transport exclusively and runs its
//! reads, writes, asynchronous jobs and device clears in order, with read
//! termination and a carry-over buffer for bytes past the end of a message.
//!
//! # Architecture
//!
//! - [`framing`] -- where a read stops (termination character, byte count)
//! - [`io`] -- IO task types, spawn, and the select loop

pub mod framing;
pub mod io;

pub use framing::{ReadLimits, ReadResult};
pub use io::{CompletionSink, IoConfig, IoHandle, spawn_io_task};

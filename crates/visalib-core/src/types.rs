//! Core types used throughout visalib.
//!
//! Handles are opaque newtypes over integers so that a session id can never
//! be confused with a job id at compile time.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::status::Status;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw handle value.
            pub const fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            /// Return the raw handle value.
            pub const fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Opaque session handle, unique per `open` within one resource manager.
    SessionId,
    "session"
);

handle_type!(
    /// Identifies one asynchronous I/O job.
    JobId,
    "job"
);

handle_type!(
    /// Identifies one installed event handler.
    HandlerId,
    "handler"
);

handle_type!(
    /// Identifies one delivered event occurrence.
    EventId,
    "event"
);

/// Access mode requested when opening a session, and the lock state a
/// session currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    /// No lock.
    #[default]
    NoLock,
    /// Exclusive lock: sole I/O access to the resource.
    ExclusiveLock,
    /// Shared lock: I/O access for every session presenting the same key.
    SharedLock,
}

impl AccessMode {
    /// Raw VISA access-mode value.
    pub fn raw(&self) -> u32 {
        match self {
            AccessMode::NoLock => 0,
            AccessMode::ExclusiveLock => 1,
            AccessMode::SharedLock => 2,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessMode::NoLock => "no lock",
            AccessMode::ExclusiveLock => "exclusive lock",
            AccessMode::SharedLock => "shared lock",
        };
        write!(f, "{s}")
    }
}

/// Timeout for blocking operations.
///
/// `Immediate` still performs one non-waiting attempt: data or a lock that
/// is available right now is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeout {
    Immediate,
    After(Duration),
    Infinite,
}

impl Timeout {
    /// Raw value meaning "wait forever".
    pub const INFINITE_MS: u32 = 0xFFFF_FFFF;

    /// Build a timeout from a raw millisecond value.
    pub fn from_millis(ms: u32) -> Self {
        match ms {
            0 => Timeout::Immediate,
            Self::INFINITE_MS => Timeout::Infinite,
            ms => Timeout::After(Duration::from_millis(u64::from(ms))),
        }
    }

    /// Raw millisecond value (saturating at just below the infinite marker).
    pub fn as_millis(&self) -> u32 {
        match self {
            Timeout::Immediate => 0,
            Timeout::Infinite => Self::INFINITE_MS,
            Timeout::After(d) => {
                u32::try_from(d.as_millis()).map_or(Self::INFINITE_MS - 1, |ms| {
                    ms.min(Self::INFINITE_MS - 1)
                })
            }
        }
    }

    /// Absolute deadline, or `None` for an infinite wait.
    pub fn deadline(&self) -> Option<Instant> {
        let now = Instant::now();
        match self {
            Timeout::Immediate => Some(now),
            Timeout::After(d) => Some(now + *d),
            Timeout::Infinite => None,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            Timeout::Immediate
        } else {
            Timeout::After(d)
        }
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeout::Immediate => write!(f, "immediate"),
            Timeout::After(d) => write!(f, "{} ms", d.as_millis()),
            Timeout::Infinite => write!(f, "infinite"),
        }
    }
}

/// Kind of asynchronous I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Read,
    Write,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Read => write!(f, "read"),
            JobKind::Write => write!(f, "write"),
        }
    }
}

/// Terminal state of an asynchronous job.
///
/// Produced exactly once per job, either delivered as an
/// [`IoCompletion`](crate::events::EventType::IoCompletion) event or handed
/// out by polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// The job this outcome belongs to.
    pub job: JobId,
    /// Whether the job was a read or a write.
    pub kind: JobKind,
    /// Completion or failure code. [`Status::ERROR_ABORT`] when terminated.
    pub status: Status,
    /// Number of bytes transferred.
    pub count: usize,
    /// Data read (empty for writes and failed reads).
    pub data: Bytes,
}

impl JobOutcome {
    /// Whether the job completed successfully.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the job was terminated before completing.
    pub fn is_aborted(&self) -> bool {
        self.status == Status::ERROR_ABORT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_display() {
        assert_eq!(SessionId::from_raw(3).to_string(), "session#3");
        assert_eq!(JobId::from_raw(12).to_string(), "job#12");
        assert_eq!(HandlerId::from_raw(1).to_string(), "handler#1");
    }

    #[test]
    fn timeout_from_raw_millis() {
        assert_eq!(Timeout::from_millis(0), Timeout::Immediate);
        assert_eq!(Timeout::from_millis(Timeout::INFINITE_MS), Timeout::Infinite);
        assert_eq!(
            Timeout::from_millis(2000),
            Timeout::After(Duration::from_secs(2))
        );
    }

    #[test]
    fn timeout_as_millis() {
        assert_eq!(Timeout::Immediate.as_millis(), 0);
        assert_eq!(Timeout::Infinite.as_millis(), Timeout::INFINITE_MS);
        assert_eq!(Timeout::After(Duration::from_millis(250)).as_millis(), 250);
        assert_eq!(
            Timeout::After(Duration::from_secs(u64::MAX / 2)).as_millis(),
            Timeout::INFINITE_MS - 1
        );
    }

    #[test]
    fn timeout_from_zero_duration_is_immediate() {
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::Immediate);
    }

    #[tokio::test]
    async fn infinite_timeout_has_no_deadline() {
        assert!(Timeout::Infinite.deadline().is_none());
        assert!(Timeout::Immediate.deadline().is_some());
    }

    #[test]
    fn access_mode_raw_values() {
        assert_eq!(AccessMode::NoLock.raw(), 0);
        assert_eq!(AccessMode::ExclusiveLock.raw(), 1);
        assert_eq!(AccessMode::SharedLock.raw(), 2);
        assert_eq!(AccessMode::default(), AccessMode::NoLock);
    }

    #[test]
    fn job_outcome_flags() {
        let aborted = JobOutcome {
            job: JobId::from_raw(1),
            kind: JobKind::Write,
            status: Status::ERROR_ABORT,
            count: 0,
            data: Bytes::new(),
        };
        assert!(aborted.is_aborted());
        assert!(!aborted.is_success());
    }
}

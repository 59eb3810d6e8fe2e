//! Error types for visalib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport failures, lock conflicts,
//! attribute validation and event misuse are all captured here.
//!
//! Every variant maps onto a small closed set of [`ErrorKind`]s. Callers
//! that only care about the category (e.g. "is this resource locked?")
//! should match on [`Error::kind()`] rather than on individual variants.

use std::fmt;

use crate::attribute::AttrKind;
use crate::events::EventType;
use crate::types::JobId;

/// The error type for all visalib operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The session, find list or handler reference is not (or no longer) valid.
    #[error("invalid handle")]
    InvalidHandle,

    /// The handle was closed while the call was in flight, or the resource
    /// manager itself has been closed.
    #[error("already closed")]
    AlreadyClosed,

    /// A resource search expression could not be compiled.
    #[error("invalid search pattern: {0}")]
    InvalidPattern(String),

    /// A resource name does not follow any known descriptor grammar.
    #[error("invalid resource descriptor: {0}")]
    InvalidDescriptor(String),

    /// The requested resource (or the next find-list entry) does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The job id is unknown, or its outcome has already been consumed.
    #[error("invalid job id: {0}")]
    InvalidJob(JobId),

    /// No handler matching the given reference is installed.
    #[error("handler not installed")]
    HandlerNotInstalled,

    /// Timed out waiting for I/O, a lock, or an event.
    #[error("timeout expired before operation completed")]
    Timeout,

    /// The resource is locked by another session.
    #[error("resource is locked by another session")]
    ResourceLocked,

    /// The session does not hold the lock it tried to release, or presented
    /// a key that does not match the current shared lock.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The attribute id is unknown or does not apply to this resource.
    #[error("unsupported attribute: {0}")]
    InvalidAttribute(String),

    /// The attribute value is out of range or cannot be changed right now.
    #[error("unsupported attribute state: {0}")]
    InvalidAttributeState(String),

    /// The attribute is read-only.
    #[error("attribute {0} is read-only")]
    AttributeReadOnly(AttrKind),

    /// The event is already enabled with a different delivery mechanism,
    /// or the mechanism is not valid for the request.
    #[error("invalid event mechanism: {0}")]
    InvalidMechanism(String),

    /// The event type is not enabled for queued delivery on this session.
    #[error("event {0} is not enabled for queuing")]
    EventNotEnabled(EventType),

    /// The operation was terminated before it completed.
    #[error("operation aborted")]
    Aborted,

    /// An invalid parameter was passed to an operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The requested operation is not supported for this resource.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A transport-level error (serial port, TCP socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (unexpected bytes from a scripted peer).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport has not been connected, or was closed.
    #[error("not connected")]
    NotConnected,

    /// The connection to the instrument was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Closed categorisation of [`Error`] values.
///
/// Lock conflicts and timeouts are expected, recoverable outcomes; callers
/// routinely probe a locked resource and branch on
/// [`ErrorKind::ResourceLocked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidHandle,
    InvalidPattern,
    NotFound,
    Timeout,
    ResourceLocked,
    AccessDenied,
    InvalidAttribute,
    IoFailure,
    AlreadyClosed,
    InvalidParameter,
    Unsupported,
    Aborted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidHandle => "invalid handle",
            ErrorKind::InvalidPattern => "invalid pattern",
            ErrorKind::NotFound => "not found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceLocked => "resource locked",
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::InvalidAttribute => "invalid attribute",
            ErrorKind::IoFailure => "I/O failure",
            ErrorKind::AlreadyClosed => "already closed",
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

impl Error {
    /// Return the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidHandle | Error::InvalidJob(_) | Error::HandlerNotInstalled => {
                ErrorKind::InvalidHandle
            }
            Error::AlreadyClosed => ErrorKind::AlreadyClosed,
            Error::InvalidPattern(_) => ErrorKind::InvalidPattern,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Timeout => ErrorKind::Timeout,
            Error::ResourceLocked => ErrorKind::ResourceLocked,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            Error::InvalidAttribute(_)
            | Error::InvalidAttributeState(_)
            | Error::AttributeReadOnly(_) => ErrorKind::InvalidAttribute,
            Error::InvalidDescriptor(_)
            | Error::InvalidMechanism(_)
            | Error::EventNotEnabled(_)
            | Error::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Aborted => ErrorKind::Aborted,
            Error::Transport(_)
            | Error::Protocol(_)
            | Error::NotConnected
            | Error::ConnectionLost
            | Error::Io(_) => ErrorKind::IoFailure,
        }
    }

    /// Whether this error is an expected, recoverable condition (lock
    /// conflict, timeout, aborted job) rather than a hard failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceLocked | ErrorKind::Timeout | ErrorKind::Aborted
        )
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

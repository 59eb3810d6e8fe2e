//! VISA-style status codes.
//!
//! Operations return [`Result`](crate::Result), but the numeric status
//! convention is kept for interoperability with tooling that expects it:
//! non-negative codes are successes (positive values qualify the success,
//! e.g. "stopped at termination character"), negative codes are failures.

use std::fmt;

use crate::error::{Error, ErrorKind};

/// A numeric completion or error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(i32);

const fn error_code(offset: u32) -> i32 {
    (0xBFFF_0000u32 | offset) as i32
}

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const SUCCESS_EVENT_EN: Status = Status(0x3FFF_0002);
    pub const SUCCESS_EVENT_DIS: Status = Status(0x3FFF_0003);
    pub const SUCCESS_QUEUE_EMPTY: Status = Status(0x3FFF_0004);
    pub const SUCCESS_TERM_CHAR: Status = Status(0x3FFF_0005);
    pub const SUCCESS_MAX_CNT: Status = Status(0x3FFF_0006);
    pub const SUCCESS_NESTED_SHARED: Status = Status(0x3FFF_0099);
    pub const SUCCESS_NESTED_EXCLUSIVE: Status = Status(0x3FFF_009A);

    pub const ERROR_SYSTEM_ERROR: Status = Status(error_code(0x0000));
    pub const ERROR_INV_OBJECT: Status = Status(error_code(0x000E));
    pub const ERROR_RSRC_LOCKED: Status = Status(error_code(0x000F));
    pub const ERROR_INV_EXPR: Status = Status(error_code(0x0010));
    pub const ERROR_RSRC_NFOUND: Status = Status(error_code(0x0011));
    pub const ERROR_INV_RSRC_NAME: Status = Status(error_code(0x0012));
    pub const ERROR_TMO: Status = Status(error_code(0x0015));
    pub const ERROR_CLOSING_FAILED: Status = Status(error_code(0x0016));
    pub const ERROR_NSUP_ATTR: Status = Status(error_code(0x001D));
    pub const ERROR_NSUP_ATTR_STATE: Status = Status(error_code(0x001E));
    pub const ERROR_ATTR_READONLY: Status = Status(error_code(0x001F));
    pub const ERROR_INV_ACCESS_KEY: Status = Status(error_code(0x0021));
    pub const ERROR_INV_EVENT: Status = Status(error_code(0x0026));
    pub const ERROR_INV_MECH: Status = Status(error_code(0x0027));
    pub const ERROR_HNDLR_NINSTALLED: Status = Status(error_code(0x0028));
    pub const ERROR_NENABLED: Status = Status(error_code(0x002F));
    pub const ERROR_ABORT: Status = Status(error_code(0x0030));
    pub const ERROR_IO: Status = Status(error_code(0x003E));
    pub const ERROR_NSUP_OPER: Status = Status(error_code(0x0067));
    pub const ERROR_INV_JOB_ID: Status = Status(error_code(0x006B));
    pub const ERROR_INV_PARAMETER: Status = Status(error_code(0x0078));
    pub const ERROR_SESN_NLOCKED: Status = Status(error_code(0x009C));
    pub const ERROR_CONN_LOST: Status = Status(error_code(0x00A6));

    /// Wrap a raw status code.
    pub const fn from_raw(code: i32) -> Self {
        Status(code)
    }

    /// Return the raw status code.
    pub const fn code(&self) -> i32 {
        self.0
    }

    /// `true` for every non-negative code.
    pub const fn is_success(&self) -> bool {
        self.0 >= 0
    }

    /// Recover the error category of a failure code.
    ///
    /// Returns `None` for success codes.
    pub fn kind(&self) -> Option<ErrorKind> {
        if self.is_success() {
            return None;
        }
        let kind = match *self {
            Status::ERROR_INV_OBJECT
            | Status::ERROR_INV_JOB_ID
            | Status::ERROR_HNDLR_NINSTALLED => ErrorKind::InvalidHandle,
            Status::ERROR_CLOSING_FAILED => ErrorKind::AlreadyClosed,
            Status::ERROR_INV_EXPR => ErrorKind::InvalidPattern,
            Status::ERROR_RSRC_NFOUND => ErrorKind::NotFound,
            Status::ERROR_TMO => ErrorKind::Timeout,
            Status::ERROR_RSRC_LOCKED => ErrorKind::ResourceLocked,
            Status::ERROR_SESN_NLOCKED | Status::ERROR_INV_ACCESS_KEY => ErrorKind::AccessDenied,
            Status::ERROR_NSUP_ATTR
            | Status::ERROR_NSUP_ATTR_STATE
            | Status::ERROR_ATTR_READONLY => ErrorKind::InvalidAttribute,
            Status::ERROR_INV_RSRC_NAME
            | Status::ERROR_INV_MECH
            | Status::ERROR_INV_EVENT
            | Status::ERROR_NENABLED
            | Status::ERROR_INV_PARAMETER => ErrorKind::InvalidParameter,
            Status::ERROR_NSUP_OPER => ErrorKind::Unsupported,
            Status::ERROR_ABORT => ErrorKind::Aborted,
            _ => ErrorKind::IoFailure,
        };
        Some(kind)
    }

    /// Human-readable description of the code.
    pub fn description(&self) -> &'static str {
        match *self {
            Status::SUCCESS => "Operation completed successfully.",
            Status::SUCCESS_EVENT_EN => "Specified event is already enabled for at least one of the specified mechanisms.",
            Status::SUCCESS_EVENT_DIS => "Specified event is already disabled for at least one of the specified mechanisms.",
            Status::SUCCESS_QUEUE_EMPTY => "Operation completed successfully, but queue was already empty.",
            Status::SUCCESS_TERM_CHAR => "The specified termination character was read.",
            Status::SUCCESS_MAX_CNT => "The number of bytes read is equal to the input count.",
            Status::SUCCESS_NESTED_SHARED => "Specified access mode is successfully acquired, and this session has nested shared locks.",
            Status::SUCCESS_NESTED_EXCLUSIVE => "Specified access mode is successfully acquired, and this session has nested exclusive locks.",
            Status::ERROR_INV_OBJECT => "The given session or object reference is invalid.",
            Status::ERROR_RSRC_LOCKED => "Specified type of lock cannot be obtained, or specified operation cannot be performed, because the resource is locked.",
            Status::ERROR_INV_EXPR => "Invalid expression specified for search.",
            Status::ERROR_RSRC_NFOUND => "Insufficient location information or resource not present in the system.",
            Status::ERROR_INV_RSRC_NAME => "Invalid resource reference specified. Parsing error.",
            Status::ERROR_TMO => "Timeout expired before operation completed.",
            Status::ERROR_CLOSING_FAILED => "The session was closed while the operation was in progress.",
            Status::ERROR_NSUP_ATTR => "The specified attribute is not defined or supported by the referenced resource.",
            Status::ERROR_NSUP_ATTR_STATE => "The specified state of the attribute is not valid, or is not supported.",
            Status::ERROR_ATTR_READONLY => "The specified attribute is read-only.",
            Status::ERROR_INV_ACCESS_KEY => "The access key to the resource associated with this session is invalid.",
            Status::ERROR_INV_EVENT => "Specified event type is not supported by the resource.",
            Status::ERROR_INV_MECH => "Invalid mechanism specified.",
            Status::ERROR_HNDLR_NINSTALLED => "A handler is not currently installed for the specified event.",
            Status::ERROR_NENABLED => "The session must be enabled for events of the specified type in order to receive them.",
            Status::ERROR_ABORT => "User abort occurred during transfer.",
            Status::ERROR_IO => "Could not perform operation because of I/O error.",
            Status::ERROR_NSUP_OPER => "The given session does not support this operation.",
            Status::ERROR_INV_JOB_ID => "Specified job identifier is invalid.",
            Status::ERROR_INV_PARAMETER => "The value of some parameter is invalid.",
            Status::ERROR_SESN_NLOCKED => "The current session did not have any lock on the resource.",
            Status::ERROR_CONN_LOST => "The connection for the given session has been lost.",
            Status::ERROR_SYSTEM_ERROR => "Unknown system error.",
            s if s.is_success() => "Operation completed successfully.",
            _ => "Unknown error.",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010X}", self.0 as u32)
    }
}

impl From<&Error> for Status {
    fn from(e: &Error) -> Self {
        match e {
            Error::InvalidHandle => Status::ERROR_INV_OBJECT,
            Error::AlreadyClosed => Status::ERROR_CLOSING_FAILED,
            Error::InvalidPattern(_) => Status::ERROR_INV_EXPR,
            Error::InvalidDescriptor(_) => Status::ERROR_INV_RSRC_NAME,
            Error::NotFound(_) => Status::ERROR_RSRC_NFOUND,
            Error::InvalidJob(_) => Status::ERROR_INV_JOB_ID,
            Error::HandlerNotInstalled => Status::ERROR_HNDLR_NINSTALLED,
            Error::Timeout => Status::ERROR_TMO,
            Error::ResourceLocked => Status::ERROR_RSRC_LOCKED,
            Error::AccessDenied(_) => Status::ERROR_SESN_NLOCKED,
            Error::InvalidAttribute(_) => Status::ERROR_NSUP_ATTR,
            Error::InvalidAttributeState(_) => Status::ERROR_NSUP_ATTR_STATE,
            Error::AttributeReadOnly(_) => Status::ERROR_ATTR_READONLY,
            Error::InvalidMechanism(_) => Status::ERROR_INV_MECH,
            Error::EventNotEnabled(_) => Status::ERROR_NENABLED,
            Error::Aborted => Status::ERROR_ABORT,
            Error::InvalidParameter(_) => Status::ERROR_INV_PARAMETER,
            Error::Unsupported(_) => Status::ERROR_NSUP_OPER,
            Error::ConnectionLost => Status::ERROR_CONN_LOST,
            Error::Transport(_) | Error::Protocol(_) | Error::NotConnected | Error::Io(_) => {
                Status::ERROR_IO
            }
        }
    }
}

/// A successful outcome, optionally qualified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Completion {
    /// Plain success.
    Success,
    /// A read stopped because the termination character was received.
    TermChar,
    /// A read stopped because the requested byte count was reached.
    MaxCount,
    /// The event was already enabled with the requested mechanism.
    EventAlreadyEnabled,
    /// The event was already disabled.
    EventAlreadyDisabled,
    /// There was nothing to discard.
    QueueEmpty,
    /// The lock was granted and this session now holds nested exclusive locks.
    NestedExclusive,
    /// The lock was granted and this session now holds nested shared locks.
    NestedShared,
}

impl Completion {
    /// The numeric code for this completion.
    pub fn status(&self) -> Status {
        match self {
            Completion::Success => Status::SUCCESS,
            Completion::TermChar => Status::SUCCESS_TERM_CHAR,
            Completion::MaxCount => Status::SUCCESS_MAX_CNT,
            Completion::EventAlreadyEnabled => Status::SUCCESS_EVENT_EN,
            Completion::EventAlreadyDisabled => Status::SUCCESS_EVENT_DIS,
            Completion::QueueEmpty => Status::SUCCESS_QUEUE_EMPTY,
            Completion::NestedExclusive => Status::SUCCESS_NESTED_EXCLUSIVE,
            Completion::NestedShared => Status::SUCCESS_NESTED_SHARED,
        }
    }
}

impl From<Completion> for Status {
    fn from(c: Completion) -> Self {
        c.status()
    }
}

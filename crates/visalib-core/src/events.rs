//! Event types and delivery mechanisms.
//!
//! Events reach a session either through a bounded FIFO drained by
//! `wait_on_event` ([`Mechanism::Queue`]) or through installed
//! [`EventHandler`]s invoked on a dispatcher task ([`Mechanism::Handler`]).
//! The two mechanisms are mutually exclusive per (session, event type).

use std::fmt;

use crate::error::{Error, Result};
use crate::status::Status;
use crate::types::{EventId, JobOutcome, SessionId};

/// Kind of event a session can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// An asynchronous read or write finished (or was terminated).
    IoCompletion,
    /// The instrument requested service.
    ServiceRequest,
    /// A trigger line fired.
    Trigger,
    /// The device was cleared.
    Clear,
    /// An operation on the session failed.
    Exception,
}

impl EventType {
    /// Every event type.
    pub const ALL: [EventType; 5] = [
        EventType::IoCompletion,
        EventType::ServiceRequest,
        EventType::Trigger,
        EventType::Clear,
        EventType::Exception,
    ];

    /// Raw VISA event id.
    pub fn raw(&self) -> u32 {
        match self {
            EventType::IoCompletion => 0x3FFF_2009,
            EventType::ServiceRequest => 0x3FFF_200B,
            EventType::Trigger => 0xBFFF_200A,
            EventType::Clear => 0x3FFF_200D,
            EventType::Exception => 0xBFFF_200E,
        }
    }

    /// Look up an event type by raw id.
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.raw() == raw)
            .ok_or_else(|| Error::InvalidParameter(format!("unknown event type {raw:#010X}")))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How events of one type are delivered to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// Appended to a bounded FIFO and dequeued by `wait_on_event`.
    Queue,
    /// Passed to installed handlers on the dispatcher task.
    Handler,
}

impl Mechanism {
    /// Raw VISA mechanism value.
    pub fn raw(&self) -> u16 {
        match self {
            Mechanism::Queue => 1,
            Mechanism::Handler => 2,
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::Queue => write!(f, "queue"),
            Mechanism::Handler => write!(f, "handler"),
        }
    }
}

/// Payload carried by an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventContext {
    /// Outcome of an asynchronous job.
    IoCompletion(JobOutcome),

    /// Service request, optionally with the status byte already read.
    ServiceRequest {
        /// IEEE 488.2 status byte, if the poster has it.
        status_byte: Option<u8>,
    },

    /// Trigger notification.
    Trigger {
        /// Trigger line that fired.
        line: i16,
    },

    /// Device clear notification.
    Clear,

    /// A failed operation.
    Exception {
        /// Failure code of the operation.
        status: Status,
        /// Name of the failed operation, e.g. `"read"`.
        operation: String,
    },
}

impl EventContext {
    /// The event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            EventContext::IoCompletion(_) => EventType::IoCompletion,
            EventContext::ServiceRequest { .. } => EventType::ServiceRequest,
            EventContext::Trigger { .. } => EventType::Trigger,
            EventContext::Clear => EventType::Clear,
            EventContext::Exception { .. } => EventType::Exception,
        }
    }
}

/// One event occurrence delivered to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Unique id of this occurrence.
    pub id: EventId,
    /// The session the event was delivered to.
    pub session: SessionId,
    /// Event payload.
    pub context: EventContext,
}

impl Event {
    /// The type of this event.
    pub fn event_type(&self) -> EventType {
        self.context.event_type()
    }
}

/// Callback invoked for events delivered with [`Mechanism::Handler`].
///
/// Handlers run on the dispatcher task, one event at a time per session.
/// They must not block for long and must not wait on a synchronous call of
/// the session they are handling, since that session's dispatch is stalled
/// until the handler returns.
///
/// Any `Fn(SessionId, &Event) + Send + Sync` closure is a handler.
pub trait EventHandler: Send + Sync {
    fn handle(&self, session: SessionId, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(SessionId, &Event) + Send + Sync,
{
    fn handle(&self, session: SessionId, event: &Event) {
        self(session, event)
    }
}

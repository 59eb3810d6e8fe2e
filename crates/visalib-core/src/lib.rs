//! visalib-core: Core types, traits, and error definitions for visalib.
//!
//! This crate defines the interface-agnostic vocabulary shared by every
//! visalib crate: resource descriptors, session attributes, events, status
//! codes and the transport abstraction. Applications normally use it
//! through the `visalib` facade crate.
//!
//! # Key types
//!
//! - [`ResourceDescriptor`] -- a parsed resource name such as `GPIB0::2::INSTR`
//! - [`Attribute`] / [`AttrKind`] -- typed session attributes
//! - [`EventType`] / [`Event`] / [`EventHandler`] -- event delivery
//! - [`Transport`] / [`Connector`] -- byte-level communication channel
//! - [`Error`] / [`Result`] / [`Status`] -- error handling

pub mod attribute;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod status;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use visalib_core::*`.
pub use attribute::{
    AttrKind, Attribute, DEFAULT_BAUD_RATE, DEFAULT_QUEUE_LENGTH, DEFAULT_TERM_CHAR,
    MAX_QUEUE_LENGTH_CAP,
};
pub use descriptor::{Address, InterfaceType, ResourceClass, ResourceDescriptor};
pub use error::{Error, ErrorKind, Result};
pub use events::{Event, EventContext, EventHandler, EventType, Mechanism};
pub use status::{Completion, Status};
pub use transport::{Connector, Transport, TransportSetting};
pub use types::*;

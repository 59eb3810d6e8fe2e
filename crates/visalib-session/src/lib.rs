//! Resource manager and sessions for visalib.
//!
//! A [`ResourceManager`] resolves resource names to connectors, opens
//! [`Session`]s, and owns the state that sessions of the same resource
//! share: locks, asynchronous jobs and event delivery.
//!
//! # Architecture
//!
//! - [`manager`] -- builder, resource manager, open and close
//! - [`session`] -- per-session I/O, attributes, locking and events
//! - [`registry`] -- registered resources, aliases, `find` results
//! - [`pattern`] -- VISA resource search expressions
//! - `lock` -- exclusive and shared locks per resource
//! - `jobs` -- asynchronous job table and completion routing
//! - `dispatcher` -- per-session event queues and handler tasks

mod dispatcher;
mod jobs;
mod lock;
pub mod manager;
pub mod pattern;
pub mod registry;
pub mod session;

pub use lock::SharedGrant;
pub use manager::{ResourceManager, ResourceManagerBuilder};
pub use pattern::ResourcePattern;
pub use registry::{FindList, ParsedResource};
pub use session::Session;
pub use visalib_io::ReadResult;

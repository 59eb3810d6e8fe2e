//! # visalib -- Asynchronous Instrument I/O
//!
//! `visalib` is an asynchronous Rust library for talking to test and
//! measurement instruments through VISA-style resource names such as
//! `GPIB0::2::INSTR`, `TCPIP0::10.0.0.5::5025::SOCKET` or `ASRL1::INSTR`.
//! It provides a resource manager, independent sessions, exclusive and
//! shared locks, asynchronous jobs, and event delivery by queue or handler.
//!
//! ## Quick Start
//!
//! ```no_run
//! use visalib::{AccessMode, Attribute, ResourceManager, Timeout};
//!
//! #[tokio::main]
//! async fn main() -> visalib::Result<()> {
//!     let rm = ResourceManager::open_default()?;
//!     let dmm = rm
//!         .open("TCPIP0::192.168.1.20::5025::SOCKET", AccessMode::NoLock, Timeout::Immediate)
//!         .await?;
//!     dmm.set_attribute(Attribute::TermCharEnabled(true)).await?;
//!
//!     dmm.write(b"*IDN?\n").await?;
//!     let reply = dmm.read(256).await?;
//!     println!("{}", String::from_utf8_lossy(&reply.data));
//!
//!     dmm.close().await?;
//!     rm.close().await
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized as a workspace of focused crates:
//!
//! | Crate                  | Purpose                                              |
//! |------------------------|------------------------------------------------------|
//! | `visalib-core`         | Descriptors, attributes, events, status codes, errors |
//! | `visalib-transport`    | TCP socket and serial transports, [`DefaultConnector`] |
//! | `visalib-io`           | Per-session IO task, read termination               |
//! | `visalib-session`      | [`ResourceManager`], [`Session`], locks, dispatch   |
//! | **`visalib`**          | This facade crate -- re-exports everything          |
//!
//! GPIB, USB-TMC and VXI resources need a vendor bus driver. Register one
//! as a [`Connector`] with
//! [`ResourceManagerBuilder::resource`] or
//! [`ResourceManagerBuilder::connector`].
//!
//! ## Events
//!
//! Each session enables an [`EventType`] with one [`Mechanism`] at a time.
//! Queued events are taken with [`Session::wait_on_event`]; handlers run
//! on the session's dispatch task:
//!
//! ```no_run
//! use visalib::{Event, EventType, Mechanism, Session, SessionId};
//! # fn example(session: &Session) -> visalib::Result<()> {
//! session.install_handler(EventType::ServiceRequest, |sid: SessionId, e: &Event| {
//!     println!("{sid}: {:?}", e.context);
//! })?;
//! session.enable_event(EventType::ServiceRequest, Mechanism::Handler)?;
//! # Ok(())
//! # }
//! ```

pub use visalib_core::*;
pub use visalib_session::*;

/// Concrete transports.
///
/// Provides [`TcpTransport`](transports::TcpTransport) for raw TCP sockets
/// and [`SerialTransport`](transports::SerialTransport) for RS-232 and USB
/// virtual COM ports, plus serial port enumeration.
pub mod transports {
    pub use visalib_transport::*;
}

/// Per-session IO task.
///
/// Useful for building a [`Connector`](crate::Connector) test double or a
/// custom session layer on top of a [`Transport`](crate::Transport).
pub mod io {
    pub use visalib_io::*;
}

pub use visalib_transport::DefaultConnector;

//! Transport implementations for visalib.
//!
//! This crate provides concrete implementations of the
//! [`Transport`](visalib_core::Transport) trait from `visalib-core`:
//!
//! - [`TcpTransport`]: raw TCP sockets (`TCPIP[n]::host::port::SOCKET`)
//! - [`SerialTransport`]: RS-232 and USB virtual COM ports (`ASRL` resources)
//!
//! and [`DefaultConnector`], which picks between them from a resource
//! descriptor. GPIB, USB-TMC and VXI need vendor bus drivers and are not
//! handled here; plug them in with a custom [`Connector`](visalib_core::Connector).

pub mod connector;
pub mod serial;
pub mod tcp;

pub use connector::DefaultConnector;
pub use serial::{
    DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits, available_ports,
};
pub use tcp::TcpTransport;

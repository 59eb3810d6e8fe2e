//! visalib-test-harness: Mock transports and connectors for testing visalib.
//!
//! This crate provides [`MockTransport`] for scripted request/response
//! testing without instruments, [`LoopbackTransport`] for echo round trips,
//! connectors that hand them to a resource manager, and [`MockTcpServer`]
//! for testing socket resources over a real TCP connection.

pub mod connector;
pub mod loopback;
pub mod mock_tcp;
pub mod mock_transport;

pub use connector::{LoopbackConnector, MockConnector};
pub use loopback::LoopbackTransport;
pub use mock_tcp::MockTcpServer;
pub use mock_transport::MockTransport;

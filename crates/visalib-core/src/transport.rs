//! Transport and connector traits.
//!
//! The [`Transport`] trait abstracts over the physical link to an
//! instrument. Implementations exist for TCP sockets, serial ports, and
//! mock/loopback transports for testing.
//!
//! A [`Connector`] turns a [`ResourceDescriptor`] into a connected
//! transport. The resource manager holds connectors, not transports, so
//! that every `open` gets its own independent link.

use async_trait::async_trait;
use std::time::Duration;

use crate::descriptor::ResourceDescriptor;
use crate::error::Result;

/// Link-level setting forwarded from a session attribute to its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSetting {
    /// Disable (`true`) or enable Nagle's algorithm.
    NoDelay(bool),
    /// Serial line speed.
    BaudRate(u32),
}

/// Asynchronous byte-level transport to an instrument.
///
/// Implementations handle buffering and error recovery at the physical
/// layer. Message termination and locking are handled by the layers that
/// consume this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the instrument.
    ///
    /// Implementations should block until all bytes have been written to
    /// the underlying transport (serial TX buffer, TCP socket, etc.).
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the instrument into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if no data is received within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Apply a link-level setting.
    ///
    /// Transports that have no such setting accept and ignore it.
    async fn configure(&mut self, setting: TransportSetting) -> Result<()> {
        let _ = setting;
        Ok(())
    }

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// Opens transports for resource descriptors.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `descriptor`, giving up after `timeout`.
    async fn connect(
        &self,
        descriptor: &ResourceDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>>;
}

//! The default [`Connector`]: TCP sockets and serial ports.

use async_trait::async_trait;
use std::time::Duration;
use visalib_core::descriptor::{InterfaceType, ResourceDescriptor};
use visalib_core::error::{Error, Result};
use visalib_core::transport::{Connector, Transport};

use crate::serial::{SerialConfig, SerialTransport};
use crate::tcp::TcpTransport;

/// Connects `TCPIP::...::SOCKET` resources over TCP and `ASRL` resources
/// over the OS serial driver. Other interfaces need a bus driver this
/// library does not provide and fail with [`Error::Unsupported`].
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    serial: SerialConfig,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Line settings used when opening serial resources.
    pub fn with_serial_config(mut self, config: SerialConfig) -> Self {
        self.serial = config;
        self
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        descriptor: &ResourceDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        match descriptor.interface() {
            InterfaceType::Tcpip => Ok(Box::new(TcpTransport::open(descriptor, timeout).await?)),
            InterfaceType::Asrl => Ok(Box::new(SerialTransport::open(
                descriptor,
                self.serial.clone(),
            )?)),
            other => Err(Error::Unsupported(format!(
                "{descriptor}: no {other} driver available"
            ))),
        }
    }
}

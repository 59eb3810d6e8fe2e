//! TCP socket transport.
//!
//! [`TcpTransport`] carries `TCPIP[n]::host::port::SOCKET` resources: a raw
//! byte stream to a LAN instrument, typically on port 5025 for SCPI. Nagle's
//! algorithm is disabled on connect since instrument traffic is made of
//! small, latency-sensitive messages; the `TcpNoDelay` attribute turns it
//! back on through [`Transport::configure`].
//!
//! # Example
//!
//! ```no_run
//! use visalib_transport::TcpTransport;
//! use visalib_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> visalib_core::Result<()> {
//! let mut transport =
//!     TcpTransport::connect("192.168.1.50", 5025, Duration::from_secs(5)).await?;
//! transport.send(b"*IDN?\n").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(2)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use visalib_core::descriptor::{Address, ResourceDescriptor};
use visalib_core::error::{Error, Result};
use visalib_core::transport::{Transport, TransportSetting};

/// TCP transport for `SOCKET` resources.
#[derive(Debug)]
pub struct TcpTransport {
    /// The underlying TCP stream, `None` after `close()` is called.
    stream: Option<TcpStream>,
    /// `host:port` label for logging.
    addr: String,
}

impl TcpTransport {
    /// Connect to `host:port`, giving up after `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{host}:{port}");
        tracing::debug!(
            addr = %addr,
            timeout_ms = timeout.as_millis(),
            "Connecting to TCP socket resource"
        );

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                tracing::error!(addr = %addr, "TCP connection timed out");
                Error::Timeout
            })?
            .map_err(|e| {
                tracing::error!(addr = %addr, error = %e, "TCP connection failed");
                map_connect_error(e, &addr)
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        tracing::info!(addr = %addr, "TCP connection established");

        Ok(Self {
            stream: Some(stream),
            addr,
        })
    }

    /// Connect to the socket named by a `TCPIP::host::port::SOCKET` descriptor.
    ///
    /// `TCPIP::host::INSTR` resources speak VXI-11 or HiSLIP rather than a
    /// raw stream and are rejected with [`Error::Unsupported`].
    pub async fn open(descriptor: &ResourceDescriptor, timeout: Duration) -> Result<Self> {
        match descriptor.address() {
            Address::TcpipSocket { host, port } => Self::connect(host, *port, timeout).await,
            Address::TcpipInstr { .. } => Err(Error::Unsupported(format!(
                "{descriptor}: LAN instrument protocols are not implemented, use a SOCKET resource"
            ))),
            _ => Err(Error::InvalidParameter(format!(
                "{descriptor} is not a TCPIP resource"
            ))),
        }
    }

    /// Wrap an already-connected stream, e.g. one accepted from a listener.
    pub fn from_stream(stream: TcpStream, addr: String) -> Self {
        tracing::debug!(addr = %addr, "Wrapping existing TCP stream");
        Self {
            stream: Some(stream),
            addr,
        }
    }

    /// The `host:port` this transport was connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether Nagle's algorithm is currently disabled.
    pub fn nodelay(&self) -> Result<bool> {
        let stream = self.stream.as_ref().ok_or(Error::NotConnected)?;
        Ok(stream.nodelay()?)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(addr = %self.addr, bytes = data.len(), data = ?data, "Sending data");

        stream.write_all(data).await.map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to send data");
            map_io_error(e)
        })?;
        stream.flush().await.map_err(|e| {
            tracing::error!(addr = %self.addr, error = %e, "Failed to flush TCP stream");
            map_io_error(e)
        })?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Ok(Ok(0)) if !buf.is_empty() => {
                tracing::warn!(addr = %self.addr, "Peer closed connection");
                Err(Error::ConnectionLost)
            }
            Ok(Ok(n)) => {
                tracing::trace!(addr = %self.addr, bytes = n, data = ?&buf[..n], "Received data");
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(addr = %self.addr, error = %e, "Failed to receive data");
                Err(map_io_error(e))
            }
            Err(_) => {
                tracing::trace!(
                    addr = %self.addr,
                    timeout_ms = timeout.as_millis(),
                    "Timeout waiting for data"
                );
                Err(Error::Timeout)
            }
        }
    }

    async fn configure(&mut self, setting: TransportSetting) -> Result<()> {
        match setting {
            TransportSetting::NoDelay(on) => {
                let stream = self.stream.as_ref().ok_or(Error::NotConnected)?;
                stream.set_nodelay(on)?;
                tracing::debug!(addr = %self.addr, nodelay = on, "TCP_NODELAY updated");
            }
            other => {
                tracing::trace!(addr = %self.addr, setting = ?other, "Ignoring setting");
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            tracing::debug!(addr = %self.addr, "Closing TCP connection");

            if let Err(e) = stream.shutdown().await {
                tracing::warn!(
                    addr = %self.addr,
                    error = %e,
                    "Failed to shut down TCP stream (continuing anyway)"
                );
            }

            tracing::info!(addr = %self.addr, "TCP connection closed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

fn map_connect_error(e: std::io::Error, addr: &str) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Error::Transport(format!("connection refused: {addr}"))
        }
        _ => Error::Io(e),
    }
}

fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::ConnectionAborted => Error::ConnectionLost,
        _ => Error::Io(e),
    }
}

//! Echo transport.
//!
//! Everything sent to a [`LoopbackTransport`] becomes readable from it, in
//! order. An optional latency is applied to every send, which is how tests
//! keep an asynchronous write in flight long enough to race it.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::time::Duration;

use visalib_core::error::{Error, Result};
use visalib_core::transport::Transport;

#[derive(Debug, Default)]
pub struct LoopbackTransport {
    buffer: BytesMut,
    latency: Duration,
    closed: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo transport whose sends each take `latency` to complete.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        if self.buffer.is_empty() {
            // Nothing else can write to this transport while we hold it.
            tokio::time::sleep(timeout).await;
            return Err(Error::Timeout);
        }
        let n = self.buffer.len().min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.buffer.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_in_order() {
        let mut lo = LoopbackTransport::new();
        lo.send(b"abc").await.unwrap();
        lo.send(b"def").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(lo.receive(&mut buf, Duration::ZERO).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(lo.receive(&mut buf, Duration::ZERO).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[tokio::test]
    async fn empty_loopback_times_out() {
        let mut lo = LoopbackTransport::new();
        let mut buf = [0u8; 4];
        assert!(matches!(
            lo.receive(&mut buf, Duration::from_millis(5)).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn latency_delays_send() {
        let mut lo = LoopbackTransport::with_latency(Duration::from_millis(20));
        let started = tokio::time::Instant::now();
        lo.send(b"x").await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn closed_loopback_is_not_connected() {
        let mut lo = LoopbackTransport::new();
        lo.close().await.unwrap();
        assert!(!lo.is_connected());
        assert!(matches!(lo.send(b"x").await, Err(Error::NotConnected)));
    }
}

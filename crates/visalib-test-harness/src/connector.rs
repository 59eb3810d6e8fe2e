//! Connectors that hand out test transports.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use visalib_core::descriptor::ResourceDescriptor;
use visalib_core::error::{Error, Result};
use visalib_core::transport::{Connector, Transport};

use crate::loopback::LoopbackTransport;
use crate::mock_transport::MockTransport;

/// Opens a fresh [`LoopbackTransport`] for every connect.
#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    latency: Duration,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loopbacks whose sends each take `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        _descriptor: &ResourceDescriptor,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        Ok(Box::new(LoopbackTransport::with_latency(self.latency)))
    }
}

/// Hands out queued [`MockTransport`]s, one per connect.
///
/// Connecting with an empty queue fails with [`Error::Transport`], which is
/// how tests simulate an unreachable instrument.
#[derive(Debug, Default)]
pub struct MockConnector {
    queue: Mutex<VecDeque<MockTransport>>,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector that yields each of `mocks` in turn.
    pub fn with(mocks: impl IntoIterator<Item = MockTransport>) -> Self {
        let connector = Self::new();
        for mock in mocks {
            connector.push(mock);
        }
        connector
    }

    /// Queue a transport for the next connect.
    pub fn push(&self, mock: MockTransport) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(mock);
    }

    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        descriptor: &ResourceDescriptor,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>> {
        let next = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        match next {
            Some(mock) => {
                self.connects.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(mock))
            }
            None => Err(Error::Transport(format!(
                "no mock transport queued for {descriptor}"
            ))),
        }
    }
}

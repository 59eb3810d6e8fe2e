//! Scripted mock transport.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs, so session behaviour can be tested without an
//! instrument. It is a cheap cloneable handle: keep one clone in the test to
//! inspect what was sent, and hand another to a connector.
//!
//! # Example
//!
//! ```
//! use visalib_test_harness::MockTransport;
//!
//! let mock = MockTransport::new();
//! // When the session writes "*IDN?\n", the instrument answers with an id string.
//! mock.expect(b"*IDN?\n", b"ACME,DMM-1,42,1.0\n");
//! // Unsolicited output, e.g. a measurement pushed by the instrument.
//! mock.push_incoming(b"+1.2345E+00\n");
//! ```

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use visalib_core::error::{Error, Result};
use visalib_core::transport::{Transport, TransportSetting};

#[derive(Debug, Clone)]
struct Expectation {
    request: Vec<u8>,
    response: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    expectations: VecDeque<Expectation>,
    incoming: BytesMut,
    connected: bool,
    closed: bool,
    sent_log: Vec<Vec<u8>>,
    settings: Vec<TransportSetting>,
    send_delay: Duration,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MockState>,
    data_ready: Notify,
}

/// A mock [`Transport`] driven by a script of expectations.
///
/// Expectations are consumed in order. Each `send()` is recorded and
/// matched against the next expectation; its response becomes readable.
/// A send with no expectation left, or with unexpected bytes, fails with
/// [`Error::Protocol`].
///
/// `receive()` waits up to its timeout for data, so a session reading from
/// a silent mock times out just as it would against a real instrument.
#[derive(Debug, Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MockState {
                    expectations: VecDeque::new(),
                    incoming: BytesMut::new(),
                    connected: true,
                    closed: false,
                    sent_log: Vec::new(),
                    settings: Vec::new(),
                    send_delay: Duration::ZERO,
                }),
                data_ready: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the script from the others.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an expected request and the response it produces.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        self.state().expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Add an expected request that produces no response.
    pub fn expect_write(&self, request: &[u8]) {
        self.expect(request, &[]);
    }

    /// Make bytes readable without a preceding request.
    pub fn push_incoming(&self, data: &[u8]) {
        self.state().incoming.extend_from_slice(data);
        self.shared.data_ready.notify_waiters();
    }

    /// Every payload passed to `send()`, in order.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.state().sent_log.clone()
    }

    /// Number of expectations not yet consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.state().expectations.len()
    }

    /// Settings applied through `configure()`, in order.
    pub fn settings(&self) -> Vec<TransportSetting> {
        self.state().settings.clone()
    }

    /// Number of readable bytes not yet received.
    pub fn pending_incoming(&self) -> usize {
        self.state().incoming.len()
    }

    /// Simulate a link failure (`false`) or recovery (`true`).
    ///
    /// While disconnected, `send()` and `receive()` fail with
    /// [`Error::NotConnected`].
    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
        self.shared.data_ready.notify_waiters();
    }

    /// Delay applied to every `send()`, to widen race windows in tests.
    pub fn set_send_delay(&self, delay: Duration) {
        self.state().send_delay = delay;
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let delay = {
            let state = self.state();
            if !state.connected {
                return Err(Error::NotConnected);
            }
            state.send_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.sent_log.push(data.to_vec());

        let Some(expectation) = state.expectations.pop_front() else {
            return Err(Error::Protocol("no more expectations in mock transport".into()));
        };
        if data != expectation.request.as_slice() {
            return Err(Error::Protocol(format!(
                "unexpected send data: expected {:02X?}, got {:02X?}",
                expectation.request, data
            )));
        }
        if !expectation.response.is_empty() {
            state.incoming.extend_from_slice(&expectation.response);
            drop(state);
            self.shared.data_ready.notify_waiters();
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if !state.connected {
                    return Err(Error::NotConnected);
                }
                if !state.incoming.is_empty() {
                    let n = state.incoming.len().min(buf.len());
                    buf[..n].copy_from_slice(&state.incoming[..n]);
                    state.incoming.advance(n);
                    return Ok(n);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }

    async fn configure(&mut self, setting: TransportSetting) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(Error::NotConnected);
        }
        state.settings.push(setting);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        state.connected = false;
        state.closed = true;
        state.incoming.clear();
        drop(state);
        self.shared.data_ready.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_query() {
        let mut mock = MockTransport::new();
        mock.expect(b"*IDN?\n", b"ACME,DMM-1\n");

        mock.send(b"*IDN?\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"ACME,DMM-1\n");
        assert_eq!(mock.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn clones_share_the_script() {
        let observer = MockTransport::new();
        let mut link = observer.clone();
        observer.expect_write(b"OUTP ON\n");

        link.send(b"OUTP ON\n").await.unwrap();
        assert_eq!(observer.sent_data(), vec![b"OUTP ON\n".to_vec()]);
    }

    #[tokio::test]
    async fn wrong_data_and_exhausted_script_error() {
        let mut mock = MockTransport::new();
        mock.expect(b"A", b"");
        assert!(matches!(mock.send(b"B").await, Err(Error::Protocol(_))));
        assert!(matches!(mock.send(b"C").await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn receive_waits_for_pushed_data() {
        let mut mock = MockTransport::new();
        let pusher = mock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push_incoming(b"SRQ");
        });

        let mut buf = [0u8; 8];
        let n = mock.receive(&mut buf, Duration::from_secs(2)).await.unwrap();
        assert_eq!(&buf[..n], b"SRQ");
    }

    #[tokio::test]
    async fn silent_mock_times_out() {
        let mut mock = MockTransport::new();
        let mut buf = [0u8; 8];
        let started = tokio::time::Instant::now();
        let result = mock.receive(&mut buf, Duration::from_millis(30)).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn partial_receive() {
        let mut mock = MockTransport::new();
        mock.push_incoming(&[0xAA, 0xBB, 0xCC]);

        let mut buf = [0u8; 2];
        assert_eq!(mock.receive(&mut buf, Duration::ZERO).await.unwrap(), 2);
        assert_eq!(buf, [0xAA, 0xBB]);
        assert_eq!(mock.pending_incoming(), 1);
    }

    #[tokio::test]
    async fn disconnect_and_close() {
        let mut mock = MockTransport::new();
        mock.set_connected(false);
        assert!(matches!(mock.send(b"x").await, Err(Error::NotConnected)));
        mock.set_connected(true);

        mock.configure(TransportSetting::NoDelay(false)).await.unwrap();
        assert_eq!(mock.settings(), vec![TransportSetting::NoDelay(false)]);

        mock.close().await.unwrap();
        assert!(mock.is_closed());
        assert!(!mock.is_connected());
    }
}

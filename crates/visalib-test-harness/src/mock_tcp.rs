//! Mock TCP instrument.
//!
//! [`MockTcpServer`] listens on a random localhost port and plays a script
//! of request/response pairs to the first client, so socket resources can be
//! tested end to end through the real TCP transport.
//!
//! # Example
//!
//! ```
//! use visalib_test_harness::MockTcpServer;
//!
//! # async fn example() -> visalib_core::Result<()> {
//! let mut server = MockTcpServer::new().await?;
//! server.expect(b"MEAS:VOLT?\n", b"+4.99E+00\n");
//!
//! // Open this resource through the default connector.
//! let resource = server.resource_name();
//! server.start();
//! // ... open, query, close ...
//! server.wait().await.unwrap();
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use visalib_core::error::{Error, Result};

#[derive(Debug, Clone)]
struct TcpExpectation {
    request: Vec<u8>,
    response: Vec<u8>,
}

/// A scripted TCP peer on localhost.
///
/// The server accepts a single connection once [`start`](MockTcpServer::start)
/// is called and processes expectations in order: it reads exactly the
/// expected request bytes and writes the response back. A mismatch ends the
/// script with an error reported by [`wait`](MockTcpServer::wait).
pub struct MockTcpServer {
    listener: Option<TcpListener>,
    port: u16,
    expectations: VecDeque<TcpExpectation>,
    server_handle: Option<JoinHandle<std::result::Result<(), String>>>,
}

impl MockTcpServer {
    /// Bind a new server on a random localhost port.
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock TCP server: {e}")))?;
        let port = listener.local_addr()?.port();
        Ok(Self {
            listener: Some(listener),
            port,
            expectations: VecDeque::new(),
            server_handle: None,
        })
    }

    /// Add an expected request/response pair.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.expectations.push_back(TcpExpectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Port the server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `TCPIP0::127.0.0.1::<port>::SOCKET` resource name for this server.
    pub fn resource_name(&self) -> String {
        format!("TCPIP0::127.0.0.1::{}::SOCKET", self.port)
    }

    /// Start accepting. The listener is already bound, so clients may
    /// connect as soon as this returns.
    pub fn start(&mut self) {
        let listener = self.listener.take();
        let expectations: Vec<TcpExpectation> = self.expectations.drain(..).collect();

        self.server_handle = Some(tokio::spawn(async move {
            let listener = listener.ok_or_else(|| "server already started".to_string())?;
            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {e}"))?;
            play_script(&mut stream, &expectations).await?;
            // Hold the connection until the client hangs up.
            let mut sink = [0u8; 64];
            while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
            Ok(())
        }));
    }

    /// Wait for the script to finish and report any mismatch.
    pub async fn wait(self) -> std::result::Result<(), String> {
        match self.server_handle {
            Some(handle) => handle
                .await
                .map_err(|e| format!("server task panicked: {e}"))?,
            None => Ok(()),
        }
    }
}

async fn play_script(
    stream: &mut TcpStream,
    expectations: &[TcpExpectation],
) -> std::result::Result<(), String> {
    for (i, expectation) in expectations.iter().enumerate() {
        let mut buf = vec![0u8; expectation.request.len()];
        stream.read_exact(&mut buf).await.map_err(|e| {
            format!("expectation {i}: read error: {e}")
        })?;

        if buf != expectation.request {
            return Err(format!(
                "expectation {i}: request mismatch: expected {:02X?}, got {:02X?}",
                expectation.request, buf
            ));
        }

        stream
            .write_all(&expectation.response)
            .await
            .map_err(|e| format!("expectation {i}: write error: {e}"))?;
    }
    Ok(())
}

//! IO task types and implementation.
//!
//! One tokio task per session owns the transport exclusively. Synchronous
//! reads and writes, asynchronous jobs, device clears and transport
//! settings are all sent to it over one channel and executed in arrival
//! order, so a session's byte stream is never interleaved.
//!
//! The task also owns the session's carry-over buffer: bytes received past
//! a termination character, or left behind by a read that timed out, are
//! returned by the next read.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use visalib_core::error::{Error, Result};
use visalib_core::status::Status;
use visalib_core::transport::{Transport, TransportSetting};
use visalib_core::types::{JobId, JobKind, JobOutcome, Timeout};

use crate::framing::{self, ReadLimits, ReadResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Configuration for one session's IO task.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Resource name, used as the `resource` field in log events.
    pub label: String,
    /// Size of each transport receive.
    pub chunk_size: usize,
    /// Receive timeout used while waiting with an infinite timeout, so the
    /// task keeps noticing cancellation.
    pub poll_interval: Duration,
}

impl IoConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            chunk_size: 4096,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Receives the outcome of every asynchronous job run by an IO task.
///
/// Called on the IO task; implementations must not block.
pub trait CompletionSink: Send + Sync + 'static {
    fn complete(&self, outcome: JobOutcome);
}

impl<F> CompletionSink for F
where
    F: Fn(JobOutcome) + Send + Sync + 'static,
{
    fn complete(&self, outcome: JobOutcome) {
        self(outcome)
    }
}

/// A request sent from a session to its IO task.
enum Request {
    Read {
        limits: ReadLimits,
        timeout: Timeout,
        reply: oneshot::Sender<Result<ReadResult>>,
    },
    Write {
        data: Bytes,
        timeout: Timeout,
        reply: oneshot::Sender<Result<usize>>,
    },
    ReadJob {
        job: JobId,
        limits: ReadLimits,
        timeout: Timeout,
        token: CancellationToken,
    },
    WriteJob {
        job: JobId,
        data: Bytes,
        timeout: Timeout,
        token: CancellationToken,
    },
    Clear {
        reply: oneshot::Sender<Result<usize>>,
    },
    Configure {
        setting: TransportSetting,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a session's IO task.
///
/// Every method fails with [`Error::AlreadyClosed`] once
/// [`shutdown`](IoHandle::shutdown) has started, including calls that were
/// already waiting for the task.
pub struct IoHandle {
    tx: mpsc::UnboundedSender<Request>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IoHandle {
    fn submit(&self, req: Request) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::AlreadyClosed);
        }
        self.tx.send(req).map_err(|_| Error::AlreadyClosed)
    }

    /// Read one message.
    pub async fn read(&self, limits: ReadLimits, timeout: Timeout) -> Result<ReadResult> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Read {
            limits,
            timeout,
            reply,
        })?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Write `data`, returning the number of bytes written.
    pub async fn write(&self, data: Bytes, timeout: Timeout) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Write {
            data,
            timeout,
            reply,
        })?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Queue an asynchronous read. Its outcome goes to the completion sink
    /// unless the task is shut down first.
    pub fn submit_read(
        &self,
        job: JobId,
        limits: ReadLimits,
        timeout: Timeout,
        token: CancellationToken,
    ) -> Result<()> {
        self.submit(Request::ReadJob {
            job,
            limits,
            timeout,
            token,
        })
    }

    /// Queue an asynchronous write.
    pub fn submit_write(
        &self,
        job: JobId,
        data: Bytes,
        timeout: Timeout,
        token: CancellationToken,
    ) -> Result<()> {
        self.submit(Request::WriteJob {
            job,
            data,
            timeout,
            token,
        })
    }

    /// Discard buffered input. Returns the number of bytes dropped.
    pub async fn clear(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Clear { reply })?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Apply a link-level setting to the transport.
    pub async fn configure(&self, setting: TransportSetting) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Request::Configure { setting, reply })?;
        rx.await.map_err(|_| Error::AlreadyClosed)?
    }

    /// Stop the task and close the transport.
    ///
    /// In-flight and queued requests fail with [`Error::AlreadyClosed`];
    /// queued jobs are dropped without reaching the completion sink.
    /// Calling this again is a no-op.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "IO task ended abnormally");
            }
        }
    }

    /// Whether shutdown has started.
    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task. Returns the handle for sending requests.
pub fn spawn_io_task(
    transport: Box<dyn Transport>,
    config: IoConfig,
    sink: Arc<dyn CompletionSink>,
) -> IoHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(io_loop(transport, config, sink, rx, cancel.clone()));

    IoHandle {
        tx,
        cancel,
        task: Mutex::new(Some(task)),
    }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

/// Upper bound on receive rounds in one device clear.
const MAX_DRAIN_ROUNDS: usize = 64;

async fn io_loop(
    mut transport: Box<dyn Transport>,
    config: IoConfig,
    sink: Arc<dyn CompletionSink>,
    mut rx: mpsc::UnboundedReceiver<Request>,
    cancel: CancellationToken,
) {
    let mut carry = BytesMut::new();
    debug!(resource = %config.label, "IO task started");

    loop {
        let req = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };

        handle_request(req, &mut *transport, &mut carry, &config, &*sink, &cancel).await;
    }

    // Queued requests are dropped with the receiver; their callers see
    // their reply channel close.
    drop(rx);
    if let Err(e) = transport.close().await {
        tracing::warn!(resource = %config.label, error = %e, "Failed to close transport");
    }
    debug!(resource = %config.label, "IO task stopped");
}

async fn handle_request(
    req: Request,
    transport: &mut dyn Transport,
    carry: &mut BytesMut,
    config: &IoConfig,
    sink: &dyn CompletionSink,
    cancel: &CancellationToken,
) {
    match req {
        Request::Read {
            limits,
            timeout,
            reply,
        } => {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::AlreadyClosed),
                r = read_message(transport, carry, limits, timeout, config) => r,
            };
            let _ = reply.send(result);
        }
        Request::Write {
            data,
            timeout,
            reply,
        } => {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::AlreadyClosed),
                r = write_message(transport, &data, timeout, config) => r,
            };
            let _ = reply.send(result);
        }
        Request::ReadJob {
            job,
            limits,
            timeout,
            token,
        } => {
            if token.is_cancelled() {
                debug!(resource = %config.label, job = %job, "Skipping terminated read job");
                sink.complete(aborted(job, JobKind::Read));
                return;
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = token.cancelled() => {
                    sink.complete(aborted(job, JobKind::Read));
                    return;
                }
                r = read_message(transport, carry, limits, timeout, config) => r,
            };
            let outcome = match result {
                Ok(r) => JobOutcome {
                    job,
                    kind: JobKind::Read,
                    status: r.completion.status(),
                    count: r.data.len(),
                    data: r.data,
                },
                Err(e) => failed(job, JobKind::Read, &e),
            };
            debug!(resource = %config.label, job = %job, status = %outcome.status, "Read job done");
            sink.complete(outcome);
        }
        Request::WriteJob {
            job,
            data,
            timeout,
            token,
        } => {
            if token.is_cancelled() {
                debug!(resource = %config.label, job = %job, "Skipping terminated write job");
                sink.complete(aborted(job, JobKind::Write));
                return;
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = token.cancelled() => {
                    sink.complete(aborted(job, JobKind::Write));
                    return;
                }
                r = write_message(transport, &data, timeout, config) => r,
            };
            let outcome = match result {
                Ok(n) => JobOutcome {
                    job,
                    kind: JobKind::Write,
                    status: Status::SUCCESS,
                    count: n,
                    data: Bytes::new(),
                },
                Err(e) => failed(job, JobKind::Write, &e),
            };
            debug!(resource = %config.label, job = %job, status = %outcome.status, "Write job done");
            sink.complete(outcome);
        }
        Request::Clear { reply } => {
            let buffered = carry.len();
            carry.clear();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::AlreadyClosed),
                r = drain_input(transport, config) => r.map(|n| n + buffered),
            };
            let _ = reply.send(result);
        }
        Request::Configure { setting, reply } => {
            let _ = reply.send(transport.configure(setting).await);
        }
    }
}

fn aborted(job: JobId, kind: JobKind) -> JobOutcome {
    JobOutcome {
        job,
        kind,
        status: Status::ERROR_ABORT,
        count: 0,
        data: Bytes::new(),
    }
}

fn failed(job: JobId, kind: JobKind, error: &Error) -> JobOutcome {
    JobOutcome {
        job,
        kind,
        status: Status::from(error),
        count: 0,
        data: Bytes::new(),
    }
}

// ---------------------------------------------------------------------------
// Transfers
// ---------------------------------------------------------------------------

/// Read one message into the carry buffer and split it off.
///
/// With a finite timeout, at least one receive is attempted before the
/// deadline is checked, so data already waiting is returned even with
/// [`Timeout::Immediate`]. On timeout the partial data stays buffered.
async fn read_message(
    transport: &mut dyn Transport,
    carry: &mut BytesMut,
    limits: ReadLimits,
    timeout: Timeout,
    config: &IoConfig,
) -> Result<ReadResult> {
    if limits.max == 0 {
        return Ok(ReadResult::empty());
    }

    let deadline = timeout.deadline();
    let mut chunk = vec![0u8; config.chunk_size.max(1)];
    let mut attempted = false;

    loop {
        if let Some(msg) = framing::take_message(carry, limits) {
            tracing::trace!(
                resource = %config.label,
                bytes = msg.data.len(),
                completion = ?msg.completion,
                "Read complete"
            );
            return Ok(msg);
        }

        let wait = match deadline {
            None => config.poll_interval,
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() && attempted {
                    tracing::trace!(
                        resource = %config.label,
                        buffered = carry.len(),
                        "Read timed out"
                    );
                    return Err(Error::Timeout);
                }
                left
            }
        };
        attempted = true;

        match transport.receive(&mut chunk, wait).await {
            Ok(n) => carry.extend_from_slice(&chunk[..n]),
            Err(Error::Timeout) => {}
            Err(e) => return Err(e),
        }
    }
}

async fn write_message(
    transport: &mut dyn Transport,
    data: &[u8],
    timeout: Timeout,
    config: &IoConfig,
) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    match timeout.deadline() {
        None => transport.send(data).await?,
        Some(deadline) => tokio::time::timeout_at(deadline, transport.send(data))
            .await
            .map_err(|_| Error::Timeout)??,
    }
    tracing::trace!(resource = %config.label, bytes = data.len(), "Write complete");
    Ok(data.len())
}

async fn drain_input(transport: &mut dyn Transport, config: &IoConfig) -> Result<usize> {
    let mut chunk = vec![0u8; config.chunk_size.max(1)];
    let mut drained = 0;
    for _ in 0..MAX_DRAIN_ROUNDS {
        match transport.receive(&mut chunk, Duration::ZERO).await {
            Ok(0) | Err(Error::Timeout) => break,
            Ok(n) => drained += n,
            Err(e) => return Err(e),
        }
    }
    debug!(resource = %config.label, bytes = drained, "Input cleared");
    Ok(drained)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

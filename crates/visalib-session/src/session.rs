//! Session -- one open connection to a resource.
//!
//! A session owns its IO task, its attribute values and its event
//! subscriptions. Locks live in the resource manager and are shared by all
//! sessions to the same resource. Every I/O call first passes the lock
//! admission check, so a locked resource fails fast with
//! [`Error::ResourceLocked`] instead of blocking.
//!
//! Synchronous calls (`read`, `write`, `lock_*`, `wait_on_event`) are async
//! functions that resolve on completion, error or timeout. `read_async` and
//! `write_async` are plain functions that only queue work and return a
//! [`JobId`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use visalib_core::attribute::{AttrKind, Attribute, DEFAULT_BAUD_RATE, DEFAULT_TERM_CHAR};
use visalib_core::descriptor::ResourceDescriptor;
use visalib_core::error::{Error, Result};
use visalib_core::events::{Event, EventContext, EventHandler, EventType, Mechanism};
use visalib_core::status::{Completion, Status};
use visalib_core::transport::TransportSetting;
use visalib_core::types::{HandlerId, JobId, JobKind, JobOutcome, SessionId, Timeout};
use visalib_io::{IoHandle, ReadLimits, ReadResult};

use crate::lock::SharedGrant;
use crate::manager::ManagerInner;

/// Per-session attribute values that live in the session itself.
///
/// `MaxQueueLength` lives with the event state, `LockState` with the lock
/// manager, and the read-only attributes come from the descriptor.
#[derive(Debug, Clone, Copy)]
struct AttributeValues {
    timeout: Timeout,
    term_char: u8,
    term_char_enabled: bool,
    tcp_no_delay: bool,
    asrl_baud: u32,
}

impl AttributeValues {
    fn read_limits(&self, max: usize) -> ReadLimits {
        ReadLimits {
            max,
            term_char: self.term_char_enabled.then_some(self.term_char),
        }
    }
}

pub(crate) struct SessionShared {
    pub id: SessionId,
    pub descriptor: ResourceDescriptor,
    /// Canonical resource name; the lock key.
    pub resource: String,
    pub io: IoHandle,
    attrs: Mutex<AttributeValues>,
    pub closed: AtomicBool,
    /// Cancelled by close before the session's locks are released.
    pub closing: CancellationToken,
}

impl SessionShared {
    pub fn new(id: SessionId, descriptor: ResourceDescriptor, io: IoHandle, timeout: Timeout) -> Self {
        let resource = descriptor.to_string();
        SessionShared {
            id,
            descriptor,
            resource,
            io,
            attrs: Mutex::new(AttributeValues {
                timeout,
                term_char: DEFAULT_TERM_CHAR,
                term_char_enabled: false,
                tcp_no_delay: true,
                asrl_baud: DEFAULT_BAUD_RATE,
            }),
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
        }
    }

    fn attrs(&self) -> AttributeValues {
        *self.attrs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_attrs(&self, f: impl FnOnce(&mut AttributeValues)) {
        f(&mut self.attrs.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// An open session.
///
/// Cloning yields another handle to the same session. After
/// [`close`](Session::close) every operation on any handle fails with
/// [`Error::InvalidHandle`]; calls already in flight fail with
/// [`Error::AlreadyClosed`].
///
/// Only one synchronous call should be in flight per session at a time.
/// Distinct sessions, even to the same resource, are fully independent.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    manager: Arc<ManagerInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("resource", &self.shared.resource)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(shared: Arc<SessionShared>, manager: Arc<ManagerInner>) -> Self {
        Session { shared, manager }
    }

    /// Session handle.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// The resource this session is open to.
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.shared.descriptor
    }

    /// Canonical resource name.
    pub fn resource_name(&self) -> &str {
        &self.shared.resource
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::InvalidHandle);
        }
        Ok(())
    }

    fn check_access(&self) -> Result<()> {
        self.manager
            .locks
            .check_access(&self.shared.resource, self.shared.id)
    }

    /// Raise an `Exception` event for a failed operation.
    fn report<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if !matches!(e, Error::AlreadyClosed | Error::InvalidHandle) {
                tracing::debug!(session = %self.shared.id, operation, error = %e, "Operation failed");
                self.manager.dispatcher.post(
                    self.shared.id,
                    EventContext::Exception {
                        status: Status::from(e),
                        operation: operation.to_string(),
                    },
                );
            }
        }
        result
    }

    // -----------------------------------------------------------------
    // Synchronous I/O
    // -----------------------------------------------------------------

    /// Read up to `max` bytes.
    ///
    /// With `TermCharEnabled` the read stops after the termination
    /// character ([`Completion::TermChar`]); otherwise it returns what
    /// arrived first, which may be fewer than `max` bytes. Reaching `max`
    /// reports [`Completion::MaxCount`]. Waits up to the `Timeout`
    /// attribute.
    pub async fn read(&self, max: usize) -> Result<ReadResult> {
        self.ensure_open()?;
        let result = self.read_admitted(max).await;
        self.report("read", result)
    }

    async fn read_admitted(&self, max: usize) -> Result<ReadResult> {
        self.check_access()?;
        let attrs = self.shared.attrs();
        let result = self
            .shared
            .io
            .read(attrs.read_limits(max), attrs.timeout)
            .await?;
        tracing::trace!(session = %self.shared.id, bytes = result.data.len(), "Read");
        Ok(result)
    }

    /// Write `data`, returning the number of bytes written.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let result = self.write_admitted(Bytes::copy_from_slice(data)).await;
        self.report("write", result)
    }

    async fn write_admitted(&self, data: Bytes) -> Result<usize> {
        self.check_access()?;
        let timeout = self.shared.attrs().timeout;
        let n = self.shared.io.write(data, timeout).await?;
        tracing::trace!(session = %self.shared.id, bytes = n, "Write");
        Ok(n)
    }

    /// Discard buffered input, including bytes kept from earlier reads.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let result = self.clear_admitted().await;
        self.report("clear", result)
    }

    async fn clear_admitted(&self) -> Result<()> {
        self.check_access()?;
        let dropped = self.shared.io.clear().await?;
        tracing::debug!(session = %self.shared.id, bytes = dropped, "Input cleared");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Asynchronous I/O
    // -----------------------------------------------------------------

    /// Queue a read of up to `max` bytes and return immediately.
    ///
    /// The outcome arrives as an `IoCompletion` event if that type is
    /// enabled, and through [`poll_job`](Session::poll_job) otherwise.
    pub fn read_async(&self, max: usize) -> Result<JobId> {
        self.ensure_open()?;
        let result = self.submit_job(JobKind::Read, |io, job, attrs, token| {
            io.submit_read(job, attrs.read_limits(max), attrs.timeout, token)
        });
        self.report("read_async", result)
    }

    /// Queue a write of `data` and return immediately.
    pub fn write_async(&self, data: impl Into<Bytes>) -> Result<JobId> {
        self.ensure_open()?;
        let data = data.into();
        let result = self.submit_job(JobKind::Write, |io, job, attrs, token| {
            io.submit_write(job, data, attrs.timeout, token)
        });
        self.report("write_async", result)
    }

    fn submit_job<F>(&self, kind: JobKind, submit: F) -> Result<JobId>
    where
        F: FnOnce(&IoHandle, JobId, AttributeValues, CancellationToken) -> Result<()>,
    {
        self.check_access()?;
        let (job, token) = self.manager.jobs.issue(self.shared.id, kind);
        if let Err(e) = submit(&self.shared.io, job, self.shared.attrs(), token) {
            self.manager.jobs.withdraw(job);
            return Err(e);
        }
        Ok(job)
    }

    /// Cancel a pending job.
    ///
    /// On success the job ends aborted: an `IoCompletion` event (or polled
    /// outcome) with [`Status::ERROR_ABORT`] is delivered in place of its
    /// normal completion. If the job already completed the call fails with
    /// [`Error::InvalidJob`] and its normal outcome stands. Either way the
    /// job ends exactly once.
    pub fn terminate(&self, job: JobId) -> Result<()> {
        self.ensure_open()?;
        self.manager
            .jobs
            .terminate(&self.manager.dispatcher, job, self.shared.id)
    }

    /// Outcome of a job whose completion was not delivered as an event.
    ///
    /// `Ok(None)` while the job is pending. An outcome is returned once;
    /// after that, or for unknown jobs, the call fails with
    /// [`Error::InvalidJob`].
    pub fn poll_job(&self, job: JobId) -> Result<Option<JobOutcome>> {
        self.ensure_open()?;
        self.manager.jobs.poll(job, self.shared.id)
    }

    // -----------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------

    /// Take the exclusive lock on this session's resource.
    ///
    /// Waits up to `timeout` for other sessions to release; fails with
    /// [`Error::Timeout`] otherwise. Locking again while holding it nests
    /// and returns [`Completion::NestedExclusive`].
    pub async fn lock_exclusive(&self, timeout: Timeout) -> Result<Completion> {
        self.ensure_open()?;
        self.manager
            .locks
            .lock_exclusive(&self.shared.resource, self.shared.id, &self.shared.closing, timeout)
            .await
    }

    /// Take or join a shared lock.
    ///
    /// With no shared lock in place, `requested_key` (or a generated key)
    /// becomes the access key. An existing shared lock is joined only by
    /// presenting its key. On expiry fails with [`Error::ResourceLocked`]
    /// if the resource is exclusively locked and [`Error::Timeout`] if it
    /// is shared under another key.
    pub async fn lock_shared(
        &self,
        timeout: Timeout,
        requested_key: Option<&str>,
    ) -> Result<SharedGrant> {
        self.ensure_open()?;
        self.manager
            .locks
            .lock_shared(
                &self.shared.resource,
                self.shared.id,
                &self.shared.closing,
                timeout,
                requested_key,
            )
            .await
    }

    /// Release one level of the lock this session holds.
    ///
    /// Fails with [`Error::AccessDenied`] if it holds none.
    pub fn unlock(&self) -> Result<()> {
        self.ensure_open()?;
        self.manager
            .locks
            .unlock(&self.shared.resource, self.shared.id)
    }

    // -----------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------

    fn check_applies(&self, kind: AttrKind) -> Result<()> {
        if !kind.applies_to(&self.shared.descriptor) {
            return Err(Error::InvalidAttribute(format!(
                "{kind} does not apply to {}",
                self.shared.resource
            )));
        }
        Ok(())
    }

    /// Current value of an attribute.
    pub fn get_attribute(&self, kind: AttrKind) -> Result<Attribute> {
        self.ensure_open()?;
        self.check_applies(kind)?;

        let attrs = self.shared.attrs();
        let descriptor = &self.shared.descriptor;
        let not_applicable =
            || Error::InvalidAttribute(format!("{kind} does not apply to {descriptor}"));

        let value = match kind {
            AttrKind::Timeout => Attribute::Timeout(attrs.timeout),
            AttrKind::TermChar => Attribute::TermChar(attrs.term_char),
            AttrKind::TermCharEnabled => Attribute::TermCharEnabled(attrs.term_char_enabled),
            AttrKind::MaxQueueLength => {
                Attribute::MaxQueueLength(self.manager.dispatcher.max_queue(self.shared.id)?)
            }
            AttrKind::TcpNoDelay => Attribute::TcpNoDelay(attrs.tcp_no_delay),
            AttrKind::AsrlBaud => Attribute::AsrlBaud(attrs.asrl_baud),
            AttrKind::ResourceName => Attribute::ResourceName(self.shared.resource.clone()),
            AttrKind::ResourceClass => Attribute::ResourceClass(descriptor.class().to_string()),
            AttrKind::InterfaceType => Attribute::InterfaceType(descriptor.interface().raw()),
            AttrKind::InterfaceNumber => Attribute::InterfaceNumber(descriptor.board()),
            AttrKind::TcpHostname => Attribute::TcpHostname(
                descriptor.host().ok_or_else(not_applicable)?.to_string(),
            ),
            AttrKind::TcpPort => Attribute::TcpPort(descriptor.port().ok_or_else(not_applicable)?),
            AttrKind::LockState => Attribute::LockState(
                self.manager
                    .locks
                    .held_by(&self.shared.resource, self.shared.id),
            ),
        };
        Ok(value)
    }

    /// Set a writable attribute.
    ///
    /// `TcpNoDelay` and `AsrlBaud` are applied to the transport first and
    /// only recorded if that succeeds.
    pub async fn set_attribute(&self, attr: Attribute) -> Result<()> {
        self.ensure_open()?;
        let kind = attr.kind();
        self.check_applies(kind)?;
        if !kind.is_writable() {
            return Err(Error::AttributeReadOnly(kind));
        }
        attr.validate()?;

        match &attr {
            Attribute::Timeout(t) => {
                let t = *t;
                self.shared.update_attrs(|a| a.timeout = t);
            }
            Attribute::TermChar(c) => {
                let c = *c;
                self.shared.update_attrs(|a| a.term_char = c);
            }
            Attribute::TermCharEnabled(on) => {
                let on = *on;
                self.shared.update_attrs(|a| a.term_char_enabled = on);
            }
            Attribute::MaxQueueLength(n) => {
                self.manager.dispatcher.set_max_queue(self.shared.id, *n)?;
            }
            Attribute::TcpNoDelay(on) => {
                let on = *on;
                self.shared.io.configure(TransportSetting::NoDelay(on)).await?;
                self.shared.update_attrs(|a| a.tcp_no_delay = on);
            }
            Attribute::AsrlBaud(baud) => {
                let baud = *baud;
                self.shared.io.configure(TransportSetting::BaudRate(baud)).await?;
                self.shared.update_attrs(|a| a.asrl_baud = baud);
            }
            other => return Err(Error::AttributeReadOnly(other.kind())),
        }

        tracing::debug!(session = %self.shared.id, attribute = %attr, "Attribute set");
        Ok(())
    }

    /// [`get_attribute`](Session::get_attribute) by raw attribute id.
    pub fn get_attribute_raw(&self, id: u32) -> Result<Attribute> {
        self.ensure_open()?;
        self.get_attribute(AttrKind::from_raw(id)?)
    }

    /// [`set_attribute`](Session::set_attribute) from a raw id and value.
    pub async fn set_attribute_raw(&self, id: u32, value: u64) -> Result<()> {
        self.ensure_open()?;
        self.set_attribute(Attribute::from_raw(id, value)?).await
    }

    // -----------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------

    /// Start delivering `ty` events with `mechanism`.
    ///
    /// [`Mechanism::Handler`] needs at least one installed handler. A type
    /// is delivered by one mechanism at a time.
    pub fn enable_event(&self, ty: EventType, mechanism: Mechanism) -> Result<Completion> {
        self.ensure_open()?;
        self.manager.dispatcher.enable(self.shared.id, ty, mechanism)
    }

    /// Stop delivering `ty` events and drop those not yet delivered.
    pub fn disable_event(&self, ty: EventType) -> Result<Completion> {
        self.ensure_open()?;
        self.manager.dispatcher.disable(self.shared.id, ty)
    }

    /// Drop `ty` events not yet delivered. Returns
    /// [`Completion::QueueEmpty`] if there were none queued.
    pub fn discard_events(&self, ty: EventType) -> Result<Completion> {
        self.ensure_open()?;
        self.manager.dispatcher.discard(self.shared.id, ty)
    }

    /// Wait up to `timeout` for the oldest queued `ty` event.
    pub async fn wait_on_event(&self, ty: EventType, timeout: Timeout) -> Result<Event> {
        self.ensure_open()?;
        self.manager.dispatcher.wait(self.shared.id, ty, timeout).await
    }

    /// Install a handler for `ty` events.
    ///
    /// Handlers run on this session's dispatch task, newest first. Keep
    /// them short, and do not wait on a synchronous call of this session
    /// from inside one.
    pub fn install_handler<H>(&self, ty: EventType, handler: H) -> Result<HandlerId>
    where
        H: EventHandler + 'static,
    {
        self.ensure_open()?;
        self.manager
            .dispatcher
            .install_handler(self.shared.id, ty, Arc::new(handler))
    }

    /// Remove a handler installed with
    /// [`install_handler`](Session::install_handler).
    pub fn uninstall_handler(&self, ty: EventType, handler: HandlerId) -> Result<()> {
        self.ensure_open()?;
        self.manager
            .dispatcher
            .uninstall_handler(self.shared.id, ty, handler)
    }

    /// Number of `ty` events dropped because the queue was full.
    pub fn dropped_events(&self, ty: EventType) -> Result<u64> {
        self.ensure_open()?;
        self.manager.dispatcher.dropped(self.shared.id, ty)
    }

    // -----------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------

    /// Close the session.
    ///
    /// Releases its locks, cancels its pending jobs, fails its blocked
    /// waits with [`Error::AlreadyClosed`] and closes the transport. No
    /// event or completion reaches its subscribers afterwards. Closing
    /// again fails with [`Error::InvalidHandle`].
    pub async fn close(&self) -> Result<()> {
        if self.manager.close_session(&self.shared).await {
            Ok(())
        } else {
            Err(Error::InvalidHandle)
        }
    }
}

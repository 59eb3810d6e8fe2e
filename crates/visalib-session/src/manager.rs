//! ResourceManager -- entry point for finding and opening resources.
//!
//! A resource manager owns everything sessions share: the registry of known
//! resources, the per-resource lock states, the job table and the event
//! dispatcher. There are no process-wide singletons; two managers are fully
//! independent, including their locks.
//!
//! # Example
//!
//! ```no_run
//! use visalib_core::{AccessMode, Timeout};
//! use visalib_session::ResourceManager;
//!
//! # async fn example() -> visalib_core::Result<()> {
//! let rm = ResourceManager::open_default()?;
//! let dmm = rm
//!     .open("TCPIP0::192.168.1.50::5025::SOCKET", AccessMode::NoLock, Timeout::Immediate)
//!     .await?;
//! dmm.write(b"*IDN?\n").await?;
//! let reply = dmm.read(256).await?;
//! println!("{}", String::from_utf8_lossy(&reply.data));
//! rm.close().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use visalib_core::attribute::{Attribute, DEFAULT_QUEUE_LENGTH};
use visalib_core::error::{Error, Result};
use visalib_core::events::EventContext;
use visalib_core::transport::Connector;
use visalib_core::types::{AccessMode, SessionId, Timeout};
use visalib_io::{CompletionSink, IoConfig, spawn_io_task};
use visalib_transport::DefaultConnector;

use crate::dispatcher::Dispatcher;
use crate::jobs::{CompletionRouter, JobTable};
use crate::lock::LockManager;
use crate::registry::{FindList, ParsedResource, Registry};
use crate::session::{Session, SessionShared};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent builder for [`ResourceManager`].
///
/// Defaults: 2000 ms session timeout, 5 s connect timeout, event queues of
/// 50 entries, no serial port scan, no fallback connector.
pub struct ResourceManagerBuilder {
    default_timeout: Timeout,
    connect_timeout: Duration,
    max_queue_length: u32,
    scan_serial_ports: bool,
    connector: Option<Arc<dyn Connector>>,
    resources: Vec<(String, Arc<dyn Connector>)>,
    aliases: Vec<(String, String)>,
}

impl Default for ResourceManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManagerBuilder {
    pub fn new() -> Self {
        ResourceManagerBuilder {
            default_timeout: Timeout::After(Duration::from_millis(2000)),
            connect_timeout: Duration::from_secs(5),
            max_queue_length: DEFAULT_QUEUE_LENGTH,
            scan_serial_ports: false,
            connector: None,
            resources: Vec::new(),
            aliases: Vec::new(),
        }
    }

    /// I/O timeout new sessions start with (the `Timeout` attribute).
    pub fn default_timeout(mut self, timeout: Timeout) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// How long `open` may spend connecting the transport (default: 5s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Event queue capacity new sessions start with (default: 50).
    pub fn max_queue_length(mut self, n: u32) -> Self {
        self.max_queue_length = n;
        self
    }

    /// List the OS serial ports as `ASRL<path>::INSTR` in `find` results.
    pub fn scan_serial_ports(mut self, enabled: bool) -> Self {
        self.scan_serial_ports = enabled;
        self
    }

    /// Connector for resources that are not registered.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Register a resource that `find` reports and `open` connects with
    /// `connector`.
    pub fn resource(mut self, name: &str, connector: Arc<dyn Connector>) -> Self {
        self.resources.push((name.to_string(), connector));
        self
    }

    /// Register `alias` as another name for `target`.
    pub fn alias(mut self, alias: &str, target: &str) -> Self {
        self.aliases.push((alias.to_string(), target.to_string()));
        self
    }

    /// Build the resource manager.
    ///
    /// Fails with [`Error::InvalidDescriptor`] for a malformed resource or
    /// alias target and [`Error::InvalidAttributeState`] for a queue length
    /// outside `1..=65536`.
    pub fn build(self) -> Result<ResourceManager> {
        Attribute::MaxQueueLength(self.max_queue_length).validate()?;

        let mut registry = Registry::new(self.connector, self.scan_serial_ports);
        for (name, connector) in self.resources {
            registry.register(&name, connector)?;
        }
        for (alias, target) in &self.aliases {
            registry.add_alias(alias, target)?;
        }

        tracing::debug!(
            default_timeout = %self.default_timeout,
            connect_timeout_ms = self.connect_timeout.as_millis() as u64,
            max_queue_length = self.max_queue_length,
            "Resource manager created"
        );

        Ok(ResourceManager {
            inner: Arc::new(ManagerInner {
                default_timeout: self.default_timeout,
                connect_timeout: self.connect_timeout,
                max_queue_length: self.max_queue_length,
                registry,
                locks: LockManager::new(),
                jobs: Arc::new(JobTable::new()),
                dispatcher: Arc::new(Dispatcher::new()),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub(crate) struct ManagerInner {
    pub default_timeout: Timeout,
    pub connect_timeout: Duration,
    pub max_queue_length: u32,
    pub registry: Registry,
    pub locks: LockManager,
    pub jobs: Arc<JobTable>,
    pub dispatcher: Arc<Dispatcher>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionShared>>>,
    next_session: AtomicU64,
    closed: AtomicBool,
}

impl ManagerInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionShared>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }

    /// Tear a session down. Returns `false` if it was already closed.
    ///
    /// After this returns no further event or completion reaches the
    /// session's subscribers.
    pub async fn close_session(&self, shared: &SessionShared) -> bool {
        if shared.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Before `release_all`: a lock wait still in flight must not be
        // granted once the session's locks are gone.
        shared.closing.cancel();
        self.sessions().remove(&shared.id);
        self.dispatcher.remove(shared.id);
        let cancelled = self.jobs.cancel_session(shared.id);
        self.locks.release_all(&shared.resource, shared.id);
        shared.io.shutdown().await;

        tracing::info!(
            session = %shared.id,
            resource = %shared.resource,
            cancelled_jobs = cancelled,
            "Session closed"
        );
        true
    }
}

/// Owner of sessions, locks, jobs and event state.
///
/// Cloning is cheap and yields another handle to the same manager.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

impl ResourceManager {
    /// Start configuring a resource manager.
    pub fn builder() -> ResourceManagerBuilder {
        ResourceManagerBuilder::new()
    }

    /// A resource manager with default settings that opens TCP socket and
    /// serial resources through [`DefaultConnector`].
    pub fn open_default() -> Result<Self> {
        Self::builder()
            .connector(Arc::new(DefaultConnector::new()))
            .build()
    }

    /// Search the known resources.
    ///
    /// No match is not an error: the list is simply empty.
    pub fn find(&self, pattern: &str) -> Result<FindList> {
        self.inner.ensure_open()?;
        self.inner.registry.find(pattern)
    }

    /// Resolve an alias or resource name without opening it.
    pub fn parse_resource(&self, name: &str) -> Result<ParsedResource> {
        self.inner.ensure_open()?;
        self.inner.registry.parse(name)
    }

    /// Open a session to `name`.
    ///
    /// Every call yields an independent session, even for the same
    /// resource. With [`AccessMode::ExclusiveLock`] or
    /// [`AccessMode::SharedLock`] the lock is taken before returning,
    /// waiting up to `timeout` for it.
    pub async fn open(&self, name: &str, access: AccessMode, timeout: Timeout) -> Result<Session> {
        self.inner.ensure_open()?;
        let resolved = self.inner.registry.resolve(name)?;
        let resource = resolved.descriptor.to_string();

        let transport = resolved
            .connector
            .connect(&resolved.descriptor, self.inner.connect_timeout)
            .await?;

        let id = SessionId::from_raw(self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        let sink: Arc<dyn CompletionSink> = Arc::new(CompletionRouter {
            jobs: Arc::clone(&self.inner.jobs),
            dispatcher: Arc::clone(&self.inner.dispatcher),
        });
        let io = spawn_io_task(transport, IoConfig::new(format!("{id} {resource}")), sink);
        self.inner.dispatcher.register(id, self.inner.max_queue_length);

        let shared = Arc::new(SessionShared::new(
            id,
            resolved.descriptor,
            io,
            self.inner.default_timeout,
        ));

        let accepted = {
            let mut sessions = self.inner.sessions();
            // Checked under the map lock so a concurrent `close` either
            // sees this session or makes us back out.
            if self.inner.closed.load(Ordering::SeqCst) {
                false
            } else {
                sessions.insert(id, Arc::clone(&shared));
                true
            }
        };
        let session = Session::new(Arc::clone(&shared), Arc::clone(&self.inner));
        if !accepted {
            let _ = session.close().await;
            return Err(Error::AlreadyClosed);
        }

        let locked = match access {
            AccessMode::NoLock => Ok(()),
            AccessMode::ExclusiveLock => session.lock_exclusive(timeout).await.map(drop),
            AccessMode::SharedLock => session.lock_shared(timeout, None).await.map(drop),
        };
        // The manager may have closed us while the lock was pending or just
        // after it was granted; its close releases the lock.
        if shared.closing.is_cancelled() {
            return Err(Error::AlreadyClosed);
        }
        if let Err(e) = locked {
            let _ = session.close().await;
            return Err(e);
        }

        tracing::info!(session = %id, resource = %resource, access = %access, "Session opened");
        Ok(session)
    }

    /// Deliver an event to every open session on `resource` that enabled
    /// its type. Returns the number of sessions reached.
    ///
    /// This is how a bus driver (or a test) raises service requests,
    /// triggers and similar notifications.
    pub fn post_event(&self, resource: &str, context: EventContext) -> Result<usize> {
        self.inner.ensure_open()?;
        let canonical = self.inner.registry.parse(resource)?.descriptor.to_string();

        let mut targets: Vec<SessionId> = self
            .inner
            .sessions()
            .values()
            .filter(|s| s.resource == canonical)
            .map(|s| s.id)
            .collect();
        targets.sort();

        let ty = context.event_type();
        let reached = targets
            .into_iter()
            .filter(|id| self.inner.dispatcher.post(*id, context.clone()))
            .count();

        tracing::debug!(resource = %canonical, event = %ty, reached, "Event posted");
        Ok(reached)
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Whether [`close`](ResourceManager::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close every session and the manager itself.
    ///
    /// Afterwards the manager's own operations fail with
    /// [`Error::AlreadyClosed`]; closing again fails with
    /// [`Error::InvalidHandle`].
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidHandle);
        }
        let sessions: Vec<Arc<SessionShared>> =
            self.inner.sessions().drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        // No pending lock wait may be granted by a release further down.
        for shared in &sessions {
            shared.closing.cancel();
        }
        for shared in sessions {
            self.inner.close_session(&shared).await;
        }
        tracing::info!(sessions = count, "Resource manager closed");
        Ok(())
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use visalib_core::events::{Event, EventType, Mechanism};
    use visalib_core::status::Status;
    use visalib_test_harness::{LoopbackConnector, MockConnector, MockTcpServer, MockTransport};

    const DMM: &str = "GPIB0::14::INSTR";

    fn loopback_manager() -> ResourceManager {
        let loopback: Arc<dyn Connector> = Arc::new(LoopbackConnector::new());
        ResourceManager::builder()
            .resource(DMM, Arc::clone(&loopback))
            .resource("GPIB0::2::INSTR", Arc::clone(&loopback))
            .resource("ASRL1::INSTR", loopback)
            .alias("dmm", DMM)
            .default_timeout(Timeout::After(Duration::from_millis(200)))
            .build()
            .unwrap()
    }

    async fn open(rm: &ResourceManager, name: &str) -> Session {
        rm.open(name, AccessMode::NoLock, Timeout::Immediate)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn find_counts_and_walks() {
        let rm = loopback_manager();
        let mut list = rm.find("GPIB?*INSTR").unwrap();
        assert_eq!(list.count(), 2);
        assert_eq!(list.first(), Some("GPIB0::14::INSTR"));
        assert_eq!(list.find_next().unwrap(), "GPIB0::2::INSTR");
        assert!(matches!(list.find_next(), Err(Error::NotFound(_))));
        list.close().unwrap();
    }

    #[tokio::test]
    async fn find_no_match_is_zero_not_error() {
        let rm = loopback_manager();
        let list = rm.find("NOMATCH::*").unwrap();
        assert_eq!(list.count(), 0);
    }

    #[tokio::test]
    async fn open_by_alias_and_parse() {
        let rm = loopback_manager();
        let parsed = rm.parse_resource("DMM").unwrap();
        assert_eq!(parsed.descriptor.to_string(), DMM);
        assert_eq!(parsed.alias.as_deref(), Some("dmm"));

        let s = open(&rm, "dmm").await;
        assert_eq!(s.resource_name(), DMM);
    }

    #[tokio::test]
    async fn open_unknown_resource_is_not_found() {
        let rm = loopback_manager();
        let err = rm
            .open("GPIB0::9::INSTR", AccessMode::NoLock, Timeout::Immediate)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn open_with_bad_name_is_invalid_descriptor() {
        let rm = loopback_manager();
        let err = rm
            .open("nonsense", AccessMode::NoLock, Timeout::Immediate)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn failed_connect_propagates() {
        let rm = ResourceManager::builder()
            .resource(DMM, Arc::new(MockConnector::new()))
            .build()
            .unwrap();
        let err = rm
            .open(DMM, AccessMode::NoLock, Timeout::Immediate)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(rm.session_count(), 0);
    }

    #[tokio::test]
    async fn same_resource_opens_independent_sessions() {
        let rm = loopback_manager();
        let a = open(&rm, DMM).await;
        let b = open(&rm, DMM).await;
        assert_ne!(a.id(), b.id());
        assert_eq!(rm.session_count(), 2);

        a.close().await.unwrap();
        assert_eq!(rm.session_count(), 1);
        b.write(b"still open").await.unwrap();
    }

    #[tokio::test]
    async fn open_exclusive_blocks_other_opens_from_locking() {
        let rm = loopback_manager();
        let owner = rm
            .open(DMM, AccessMode::ExclusiveLock, Timeout::Immediate)
            .await
            .unwrap();
        assert_eq!(
            owner.get_attribute(visalib_core::AttrKind::LockState).unwrap(),
            Attribute::LockState(AccessMode::ExclusiveLock)
        );

        let err = rm
            .open(DMM, AccessMode::ExclusiveLock, Timeout::After(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        // The failed open left no session behind.
        assert_eq!(rm.session_count(), 1);

        let plain = open(&rm, DMM).await;
        assert!(matches!(plain.write(b"x").await, Err(Error::ResourceLocked)));
    }

    #[tokio::test]
    async fn two_session_lock_scenario() {
        let rm = loopback_manager();
        let s1 = open(&rm, DMM).await;
        let s2 = open(&rm, DMM).await;

        s1.lock_exclusive(Timeout::Immediate).await.unwrap();
        assert!(matches!(s2.write(b"*RST\n").await, Err(Error::ResourceLocked)));
        s1.unlock().unwrap();
        assert_eq!(s2.write(b"*RST\n").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn open_waiting_for_lock_fails_when_manager_closes() {
        let rm = loopback_manager();
        let holder = rm
            .open(DMM, AccessMode::ExclusiveLock, Timeout::Immediate)
            .await
            .unwrap();

        let opener = {
            let rm = rm.clone();
            tokio::spawn(async move {
                rm.open(DMM, AccessMode::ExclusiveLock, Timeout::Infinite).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rm.session_count(), 2);
        rm.close().await.unwrap();

        assert!(matches!(opener.await.unwrap(), Err(Error::AlreadyClosed)));
        assert!(holder.is_closed());
        let bystander = SessionId::from_raw(u64::MAX);
        rm.inner.locks.check_access(DMM, bystander).unwrap();
    }

    #[tokio::test]
    async fn post_event_reaches_enabled_sessions_in_order() {
        let rm = loopback_manager();
        let s1 = open(&rm, DMM).await;
        let s2 = open(&rm, DMM).await;
        let other = open(&rm, "GPIB0::2::INSTR").await;

        s1.enable_event(EventType::ServiceRequest, Mechanism::Queue)
            .unwrap();
        other
            .enable_event(EventType::ServiceRequest, Mechanism::Queue)
            .unwrap();

        for sb in [0x41, 0x42, 0x43] {
            let reached = rm
                .post_event("dmm", EventContext::ServiceRequest { status_byte: Some(sb) })
                .unwrap();
            assert_eq!(reached, 1);
        }

        for sb in [0x41, 0x42, 0x43] {
            let e = s1
                .wait_on_event(EventType::ServiceRequest, Timeout::Immediate)
                .await
                .unwrap();
            assert_eq!(e.context, EventContext::ServiceRequest { status_byte: Some(sb) });
        }
        assert!(matches!(
            s2.wait_on_event(EventType::ServiceRequest, Timeout::Immediate)
                .await,
            Err(Error::EventNotEnabled(_))
        ));
        assert!(matches!(
            other
                .wait_on_event(EventType::ServiceRequest, Timeout::Immediate)
                .await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn handlers_receive_posted_events() {
        let rm = loopback_manager();
        let s = open(&rm, DMM).await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        s.install_handler(EventType::Trigger, move |_: SessionId, e: &Event| {
            assert_eq!(e.event_type(), EventType::Trigger);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        s.enable_event(EventType::Trigger, Mechanism::Handler).unwrap();

        rm.post_event(DMM, EventContext::Trigger { line: 0 }).unwrap();
        rm.post_event(DMM, EventContext::Trigger { line: 1 }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_manager_closes_sessions() {
        let rm = loopback_manager();
        let s = open(&rm, DMM).await;
        s.lock_exclusive(Timeout::Immediate).await.unwrap();

        rm.close().await.unwrap();
        assert!(rm.is_closed());
        assert!(s.is_closed());
        assert!(matches!(s.write(b"x").await, Err(Error::InvalidHandle)));
        assert!(matches!(rm.find("?*"), Err(Error::AlreadyClosed)));
        assert!(matches!(
            rm.open(DMM, AccessMode::NoLock, Timeout::Immediate).await,
            Err(Error::AlreadyClosed)
        ));
        assert!(matches!(rm.close().await, Err(Error::InvalidHandle)));
    }

    #[tokio::test]
    async fn managers_are_independent() {
        let a = loopback_manager();
        let b = loopback_manager();
        let sa = open(&a, DMM).await;
        let sb = open(&b, DMM).await;
        sa.lock_exclusive(Timeout::Immediate).await.unwrap();
        sb.lock_exclusive(Timeout::Immediate).await.unwrap();
    }

    #[tokio::test]
    async fn builder_rejects_bad_configuration() {
        assert!(matches!(
            ResourceManager::builder().max_queue_length(0).build(),
            Err(Error::InvalidAttributeState(_))
        ));
        assert!(matches!(
            ResourceManager::builder()
                .resource("GPIB0::99::INSTR", Arc::new(LoopbackConnector::new()))
                .build(),
            Err(Error::InvalidDescriptor(_))
        ));
    }

    #[tokio::test]
    async fn scripted_instrument_query() {
        let mock = MockTransport::new();
        mock.expect(b"MEAS:VOLT?\n", b"+4.99E+00\n");
        let rm = ResourceManager::builder()
            .resource(DMM, Arc::new(MockConnector::with([mock.clone()])))
            .build()
            .unwrap();
        let s = open(&rm, DMM).await;
        s.set_attribute(Attribute::TermCharEnabled(true)).await.unwrap();

        s.write(b"MEAS:VOLT?\n").await.unwrap();
        let reply = s.read(64).await.unwrap();
        assert_eq!(&reply.data[..], b"+4.99E+00\n");
        assert_eq!(reply.completion.status(), Status::SUCCESS_TERM_CHAR);
        assert_eq!(mock.remaining_expectations(), 0);

        s.close().await.unwrap();
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn tcp_socket_end_to_end() {
        let mut server = MockTcpServer::new().await.unwrap();
        server.expect(b"*IDN?\n", b"ACME,DMM-1,0,1.0\n");
        let resource = server.resource_name();
        server.start();

        let rm = ResourceManager::open_default().unwrap();
        let s = rm
            .open(&resource, AccessMode::NoLock, Timeout::Immediate)
            .await
            .unwrap();
        assert_eq!(
            s.get_attribute(visalib_core::AttrKind::TcpNoDelay).unwrap(),
            Attribute::TcpNoDelay(true)
        );
        s.set_attribute(Attribute::TermCharEnabled(true)).await.unwrap();
        s.write(b"*IDN?\n").await.unwrap();
        let reply = s.read(256).await.unwrap();
        assert_eq!(reply.data, Bytes::from_static(b"ACME,DMM-1,0,1.0\n"));

        rm.close().await.unwrap();
        server.wait().await.unwrap();
    }
}

//! Event dispatch.
//!
//! Each session has its own event state: which types are enabled and with
//! which mechanism, one bounded FIFO per queued type, and the handlers
//! installed per type. Handler deliveries go through an unbounded channel
//! to a per-session dispatch task, so handlers never run on the caller's
//! task, events of one session are handled one at a time in arrival order,
//! and different sessions dispatch concurrently.
//!
//! Disabling or discarding a type bumps its generation; deliveries already
//! in the channel with an older generation are dropped by the dispatch
//! task instead of reaching a handler.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{Notify, mpsc};
use visalib_core::error::{Error, Result};
use visalib_core::events::{Event, EventContext, EventHandler, EventType, Mechanism};
use visalib_core::status::Completion;
use visalib_core::types::{EventId, HandlerId, SessionId, Timeout};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EventQueue {
    events: VecDeque<Event>,
    dropped: u64,
}

struct Delivery {
    event: Event,
    generation: u64,
}

struct EventState {
    closed: bool,
    max_queue: usize,
    enabled: HashMap<EventType, Mechanism>,
    queues: HashMap<EventType, EventQueue>,
    handlers: HashMap<EventType, Vec<(HandlerId, Arc<dyn EventHandler>)>>,
    generations: HashMap<EventType, u64>,
    worker: Option<mpsc::UnboundedSender<Delivery>>,
}

impl EventState {
    fn generation(&self, ty: EventType) -> u64 {
        self.generations.get(&ty).copied().unwrap_or(0)
    }

    fn bump(&mut self, ty: EventType) {
        *self.generations.entry(ty).or_insert(0) += 1;
    }

    fn clear_queue(&mut self, ty: EventType) -> usize {
        self.queues
            .get_mut(&ty)
            .map(|q| {
                let n = q.events.len();
                q.events.clear();
                n
            })
            .unwrap_or(0)
    }

    fn queuing_enabled(&self) -> bool {
        self.enabled.values().any(|m| *m == Mechanism::Queue)
    }
}

struct SessionEvents {
    state: Mutex<EventState>,
    arrived: Notify,
}

impl SessionEvents {
    fn state(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Event state of all sessions of one resource manager.
#[derive(Default)]
pub(crate) struct Dispatcher {
    sessions: Mutex<HashMap<SessionId, Arc<SessionEvents>>>,
    next_event: AtomicU64,
    next_handler: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionEvents>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn events(&self, session: SessionId) -> Result<Arc<SessionEvents>> {
        self.sessions()
            .get(&session)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    /// Create the event state of a new session and start its dispatch task.
    pub fn register(&self, session: SessionId, max_queue: u32) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = Arc::new(SessionEvents {
            state: Mutex::new(EventState {
                closed: false,
                max_queue: max_queue as usize,
                enabled: HashMap::new(),
                queues: HashMap::new(),
                handlers: HashMap::new(),
                generations: HashMap::new(),
                worker: Some(tx),
            }),
            arrived: Notify::new(),
        });
        tokio::spawn(dispatch_loop(session, Arc::downgrade(&events), rx));
        self.sessions().insert(session, events);
    }

    /// Tear down a session's event state. Blocked waits fail with
    /// [`Error::AlreadyClosed`] and nothing more is delivered.
    pub fn remove(&self, session: SessionId) {
        let Some(events) = self.sessions().remove(&session) else {
            return;
        };
        {
            let mut state = events.state();
            state.closed = true;
            state.enabled.clear();
            state.queues.clear();
            state.handlers.clear();
            state.worker = None;
        }
        events.arrived.notify_waiters();
    }

    /// Enable delivery of `ty` events to `session` with `mechanism`.
    pub fn enable(
        &self,
        session: SessionId,
        ty: EventType,
        mechanism: Mechanism,
    ) -> Result<Completion> {
        let events = self.events(session)?;
        let mut state = events.state();

        match state.enabled.get(&ty) {
            Some(current) if *current == mechanism => return Ok(Completion::EventAlreadyEnabled),
            Some(current) => {
                return Err(Error::InvalidMechanism(format!(
                    "{ty} is already enabled for {current} delivery"
                )));
            }
            None => {}
        }
        if mechanism == Mechanism::Handler
            && state.handlers.get(&ty).is_none_or(|h| h.is_empty())
        {
            return Err(Error::HandlerNotInstalled);
        }

        state.enabled.insert(ty, mechanism);
        tracing::debug!(session = %session, event = %ty, mechanism = %mechanism, "Event enabled");
        Ok(Completion::Success)
    }

    /// Disable `ty` for `session` and drop its undelivered events.
    pub fn disable(&self, session: SessionId, ty: EventType) -> Result<Completion> {
        let events = self.events(session)?;
        {
            let mut state = events.state();
            if state.enabled.remove(&ty).is_none() {
                return Ok(Completion::EventAlreadyDisabled);
            }
            state.bump(ty);
            state.clear_queue(ty);
        }
        events.arrived.notify_waiters();
        tracing::debug!(session = %session, event = %ty, "Event disabled");
        Ok(Completion::Success)
    }

    /// Drop undelivered `ty` events of `session`, keeping the subscription.
    pub fn discard(&self, session: SessionId, ty: EventType) -> Result<Completion> {
        let events = self.events(session)?;
        let mut state = events.state();
        state.bump(ty);
        let dropped = state.clear_queue(ty);
        tracing::debug!(session = %session, event = %ty, dropped, "Events discarded");
        if dropped == 0 {
            Ok(Completion::QueueEmpty)
        } else {
            Ok(Completion::Success)
        }
    }

    /// Whether `session` still has event state, i.e. has not been closed.
    pub fn contains(&self, session: SessionId) -> bool {
        self.sessions().contains_key(&session)
    }

    /// Whether `ty` is enabled for `session` with either mechanism.
    pub fn is_enabled(&self, session: SessionId, ty: EventType) -> bool {
        self.events(session).is_ok_and(|events| {
            let state = events.state();
            state.enabled.contains_key(&ty)
        })
    }

    /// Wait for the oldest queued `ty` event of `session`.
    pub async fn wait(&self, session: SessionId, ty: EventType, timeout: Timeout) -> Result<Event> {
        let events = self.events(session)?;
        let deadline = timeout.deadline();

        loop {
            let arrived = events.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            {
                let mut state = events.state();
                if state.closed {
                    return Err(Error::AlreadyClosed);
                }
                if state.enabled.get(&ty) != Some(&Mechanism::Queue) {
                    return Err(Error::EventNotEnabled(ty));
                }
                if let Some(event) = state.queues.get_mut(&ty).and_then(|q| q.events.pop_front()) {
                    return Ok(event);
                }
            }

            match deadline {
                None => arrived.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }

    /// Install `handler` for `ty` events of `session`.
    pub fn install_handler(
        &self,
        session: SessionId,
        ty: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<HandlerId> {
        let events = self.events(session)?;
        let id = HandlerId::from_raw(self.next_handler.fetch_add(1, Ordering::Relaxed) + 1);
        events
            .state()
            .handlers
            .entry(ty)
            .or_default()
            .push((id, handler));
        tracing::debug!(session = %session, event = %ty, handler = %id, "Handler installed");
        Ok(id)
    }

    /// Remove the handler `id` installed for `ty` on `session`.
    pub fn uninstall_handler(
        &self,
        session: SessionId,
        ty: EventType,
        id: HandlerId,
    ) -> Result<()> {
        let events = self.events(session)?;
        let mut state = events.state();
        let handlers = state.handlers.get_mut(&ty).ok_or(Error::HandlerNotInstalled)?;
        let pos = handlers
            .iter()
            .position(|(h, _)| *h == id)
            .ok_or(Error::HandlerNotInstalled)?;
        handlers.remove(pos);
        tracing::debug!(session = %session, event = %ty, handler = %id, "Handler removed");
        Ok(())
    }

    /// Deliver an event to `session` if it enabled the event's type.
    ///
    /// Returns whether the event was queued or handed to the dispatch task.
    pub fn post(&self, session: SessionId, context: EventContext) -> bool {
        let Ok(events) = self.events(session) else {
            return false;
        };
        let ty = context.event_type();
        let mut state = events.state();
        if state.closed {
            return false;
        }

        match state.enabled.get(&ty).copied() {
            Some(Mechanism::Queue) => {
                let event = self.event(session, context);
                let max = state.max_queue;
                let queue = state.queues.entry(ty).or_default();
                if queue.events.len() >= max {
                    if let Some(oldest) = queue.events.pop_front() {
                        queue.dropped += 1;
                        tracing::warn!(
                            session = %session,
                            event = %ty,
                            dropped_event = %oldest.id,
                            max_queue = max,
                            "Event queue full, dropping oldest"
                        );
                    }
                }
                queue.events.push_back(event);
                drop(state);
                events.arrived.notify_waiters();
                true
            }
            Some(Mechanism::Handler) => {
                let delivery = Delivery {
                    event: self.event(session, context),
                    generation: state.generation(ty),
                };
                state
                    .worker
                    .as_ref()
                    .is_some_and(|tx| tx.send(delivery).is_ok())
            }
            None => false,
        }
    }

    fn event(&self, session: SessionId, context: EventContext) -> Event {
        Event {
            id: EventId::from_raw(self.next_event.fetch_add(1, Ordering::Relaxed) + 1),
            session,
            context,
        }
    }

    /// Change the per-type queue capacity of `session`.
    ///
    /// Only allowed while no event type is enabled for queuing.
    pub fn set_max_queue(&self, session: SessionId, max: u32) -> Result<()> {
        let events = self.events(session)?;
        let mut state = events.state();
        if state.queuing_enabled() {
            return Err(Error::InvalidAttributeState(
                "MaxQueueLength cannot change while events are enabled for queuing".into(),
            ));
        }
        state.max_queue = max as usize;
        Ok(())
    }

    /// Current per-type queue capacity of `session`.
    pub fn max_queue(&self, session: SessionId) -> Result<u32> {
        let events = self.events(session)?;
        let max = events.state().max_queue;
        Ok(u32::try_from(max).unwrap_or(u32::MAX))
    }

    /// Number of `ty` events dropped from `session`'s full queue.
    pub fn dropped(&self, session: SessionId, ty: EventType) -> Result<u64> {
        let events = self.events(session)?;
        let dropped = events.state().queues.get(&ty).map_or(0, |q| q.dropped);
        Ok(dropped)
    }
}

// ---------------------------------------------------------------------------
// Dispatch task
// ---------------------------------------------------------------------------

async fn dispatch_loop(
    session: SessionId,
    weak: Weak<SessionEvents>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) {
    tracing::trace!(session = %session, "Dispatch task started");

    while let Some(delivery) = rx.recv().await {
        let Some(events) = weak.upgrade() else {
            break;
        };
        let ty = delivery.event.event_type();

        // Newest handler first.
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let state = events.state();
            let current = !state.closed
                && state.enabled.get(&ty) == Some(&Mechanism::Handler)
                && state.generation(ty) == delivery.generation;
            if !current {
                continue;
            }
            state
                .handlers
                .get(&ty)
                .map(|hs| hs.iter().rev().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        drop(events);

        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| {
                handler.handle(session, &delivery.event);
            }));
            if result.is_err() {
                tracing::warn!(
                    session = %session,
                    event = %ty,
                    event_id = %delivery.event.id,
                    "Event handler panicked"
                );
            }
        }
    }

    tracing::trace!(session = %session, "Dispatch task stopped");
}

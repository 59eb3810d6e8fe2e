//! Asynchronous job tracking.
//!
//! Every job issued by `read_async`/`write_async` is entered here before it
//! is queued on the session's IO task. A job leaves the pending table
//! exactly once, either when the IO task reports its outcome or when it is
//! terminated, and whichever comes second finds nothing to do. Outcomes
//! that no event subscription wants are parked until polled.
//!
//! Leaving the pending table, routing the outcome and parking it happen in
//! one critical section, so a concurrent poll sees the job either pending
//! or finished. Routing only posts to the dispatcher, which never calls
//! back into this table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use visalib_core::error::{Error, Result};
use visalib_core::events::{EventContext, EventType};
use visalib_core::status::Status;
use visalib_core::types::{JobId, JobKind, JobOutcome, SessionId};
use visalib_io::CompletionSink;

use crate::dispatcher::Dispatcher;

struct PendingJob {
    session: SessionId,
    kind: JobKind,
    token: CancellationToken,
}

#[derive(Default)]
struct Jobs {
    pending: HashMap<JobId, PendingJob>,
    parked: HashMap<JobId, (SessionId, JobOutcome)>,
}

/// Jobs of all sessions of one resource manager.
#[derive(Default)]
pub(crate) struct JobTable {
    jobs: Mutex<Jobs>,
    next_id: AtomicU64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter a new pending job. The token cancels it on the IO task.
    pub fn issue(&self, session: SessionId, kind: JobKind) -> (JobId, CancellationToken) {
        let job = JobId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let token = CancellationToken::new();
        self.jobs().pending.insert(
            job,
            PendingJob {
                session,
                kind,
                token: token.clone(),
            },
        );
        tracing::debug!(session = %session, job = %job, kind = %kind, "Job issued");
        (job, token)
    }

    /// Forget a job that never reached the IO task.
    pub fn withdraw(&self, job: JobId) {
        self.jobs().pending.remove(&job);
    }

    /// Deliver the IO task's outcome of a pending job.
    ///
    /// Returns `false` if the job was already resolved, typically because
    /// it was terminated first.
    pub fn complete(&self, dispatcher: &Dispatcher, outcome: JobOutcome) -> bool {
        let mut jobs = self.jobs();
        let Some(pending) = jobs.pending.remove(&outcome.job) else {
            return false;
        };
        if let Some((session, unclaimed)) = route(dispatcher, pending.session, outcome) {
            jobs.parked.insert(unclaimed.job, (session, unclaimed));
        }
        true
    }

    /// Cancel a pending job of `session` and deliver its aborted outcome.
    ///
    /// Fails with [`Error::InvalidJob`] if the job is unknown, belongs to
    /// another session, or has already completed.
    pub fn terminate(&self, dispatcher: &Dispatcher, job: JobId, session: SessionId) -> Result<()> {
        let mut jobs = self.jobs();
        let pending = match jobs.pending.get(&job) {
            Some(p) if p.session == session => jobs.pending.remove(&job),
            _ => None,
        };
        let pending = pending.ok_or(Error::InvalidJob(job))?;
        pending.token.cancel();
        tracing::debug!(session = %session, job = %job, "Job terminated");

        let aborted = JobOutcome {
            job,
            kind: pending.kind,
            status: Status::ERROR_ABORT,
            count: 0,
            data: Bytes::new(),
        };
        if let Some((session, unclaimed)) = route(dispatcher, session, aborted) {
            jobs.parked.insert(unclaimed.job, (session, unclaimed));
        }
        Ok(())
    }

    /// Outcome of a job of `session`: `Some` once (then consumed), `None`
    /// while still pending.
    pub fn poll(&self, job: JobId, session: SessionId) -> Result<Option<JobOutcome>> {
        let mut jobs = self.jobs();
        if let Some((owner, _)) = jobs.parked.get(&job) {
            if *owner == session {
                return Ok(jobs.parked.remove(&job).map(|(_, outcome)| outcome));
            }
        }
        match jobs.pending.get(&job) {
            Some(p) if p.session == session => Ok(None),
            _ => Err(Error::InvalidJob(job)),
        }
    }

    /// Cancel and forget every job of `session`. Returns how many were
    /// still pending.
    pub fn cancel_session(&self, session: SessionId) -> usize {
        let mut jobs = self.jobs();
        let ids: Vec<JobId> = jobs
            .pending
            .iter()
            .filter(|(_, p)| p.session == session)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(p) = jobs.pending.remove(id) {
                p.token.cancel();
            }
        }
        jobs.parked.retain(|_, (owner, _)| *owner != session);
        ids.len()
    }
}

// ---------------------------------------------------------------------------
// Completion routing
// ---------------------------------------------------------------------------

/// Hand a resolved outcome to the session as an `IoCompletion` event if the
/// session enabled one. Failed jobs also raise an `Exception` event.
///
/// Returns the outcome when nobody took it and the session can still poll
/// for it.
fn route(
    dispatcher: &Dispatcher,
    session: SessionId,
    outcome: JobOutcome,
) -> Option<(SessionId, JobOutcome)> {
    if !outcome.is_success() && !outcome.is_aborted() {
        dispatcher.post(
            session,
            EventContext::Exception {
                status: outcome.status,
                operation: format!("{}_async", outcome.kind),
            },
        );
    }

    tracing::debug!(
        session = %session,
        job = %outcome.job,
        status = %outcome.status,
        bytes = outcome.count,
        "Job complete"
    );

    if dispatcher.is_enabled(session, EventType::IoCompletion)
        && dispatcher.post(session, EventContext::IoCompletion(outcome.clone()))
    {
        return None;
    }
    // Nobody can poll for a closed session.
    dispatcher.contains(session).then_some((session, outcome))
}

/// The [`CompletionSink`] every session's IO task reports to.
pub(crate) struct CompletionRouter {
    pub jobs: Arc<JobTable>,
    pub dispatcher: Arc<Dispatcher>,
}

impl CompletionSink for CompletionRouter {
    fn complete(&self, outcome: JobOutcome) {
        let job = outcome.job;
        if !self.jobs.complete(&self.dispatcher, outcome) {
            tracing::trace!(job = %job, "Outcome of a resolved job dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(n: u64) -> SessionId {
        SessionId::from_raw(n)
    }

    fn outcome(job: JobId) -> JobOutcome {
        JobOutcome {
            job,
            kind: JobKind::Write,
            status: Status::SUCCESS,
            count: 4,
            data: Bytes::new(),
        }
    }

    fn dispatcher_with(sessions: &[u64]) -> Dispatcher {
        let dispatcher = Dispatcher::new();
        for n in sessions {
            dispatcher.register(sid(*n), 8);
        }
        dispatcher
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let table = JobTable::new();
        let (a, _) = table.issue(sid(1), JobKind::Read);
        let (b, _) = table.issue(sid(2), JobKind::Read);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn completion_happens_once() {
        let table = JobTable::new();
        let dispatcher = dispatcher_with(&[1]);
        let (job, _) = table.issue(sid(1), JobKind::Write);
        assert!(table.complete(&dispatcher, outcome(job)));
        assert!(!table.complete(&dispatcher, outcome(job)));
        assert_eq!(table.poll(job, sid(1)).unwrap(), Some(outcome(job)));
    }

    #[tokio::test]
    async fn terminate_cancels_token_and_wins_over_completion() {
        let table = JobTable::new();
        let dispatcher = dispatcher_with(&[1]);
        let (job, token) = table.issue(sid(1), JobKind::Write);

        table.terminate(&dispatcher, job, sid(1)).unwrap();
        assert!(token.is_cancelled());

        // The IO task's late report finds nothing.
        assert!(!table.complete(&dispatcher, outcome(job)));
        let aborted = table.poll(job, sid(1)).unwrap().unwrap();
        assert!(aborted.is_aborted());
        assert_eq!(aborted.kind, JobKind::Write);
        assert!(matches!(
            table.terminate(&dispatcher, job, sid(1)),
            Err(Error::InvalidJob(_))
        ));
    }

    #[tokio::test]
    async fn terminate_after_completion_is_invalid() {
        let table = JobTable::new();
        let dispatcher = dispatcher_with(&[1]);
        let (job, token) = table.issue(sid(1), JobKind::Read);
        table.complete(&dispatcher, outcome(job));
        assert!(matches!(
            table.terminate(&dispatcher, job, sid(1)),
            Err(Error::InvalidJob(_))
        ));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn terminate_by_other_session_is_invalid() {
        let table = JobTable::new();
        let dispatcher = dispatcher_with(&[1, 2]);
        let (job, _) = table.issue(sid(1), JobKind::Read);
        assert!(matches!(
            table.terminate(&dispatcher, job, sid(2)),
            Err(Error::InvalidJob(_))
        ));
        assert!(table.complete(&dispatcher, outcome(job)));
    }

    #[tokio::test]
    async fn poll_pending_then_parked_then_consumed() {
        let table = JobTable::new();
        let dispatcher = dispatcher_with(&[1, 2]);
        let (job, _) = table.issue(sid(1), JobKind::Write);
        assert_eq!(table.poll(job, sid(1)).unwrap(), None);

        table.complete(&dispatcher, outcome(job));
        assert!(matches!(table.poll(job, sid(2)), Err(Error::InvalidJob(_))));
        assert_eq!(table.poll(job, sid(1)).unwrap(), Some(outcome(job)));
        assert!(matches!(table.poll(job, sid(1)), Err(Error::InvalidJob(_))));
    }

    #[tokio::test]
    async fn cancel_session_only_touches_its_jobs() {
        let table = JobTable::new();
        let dispatcher = dispatcher_with(&[1, 2]);
        let (a, ta) = table.issue(sid(1), JobKind::Read);
        let (b, tb) = table.issue(sid(2), JobKind::Read);
        let (c, _) = table.issue(sid(1), JobKind::Write);
        table.complete(&dispatcher, outcome(c));

        assert_eq!(table.cancel_session(sid(1)), 1);
        assert!(ta.is_cancelled());
        assert!(!tb.is_cancelled());
        assert!(!table.complete(&dispatcher, outcome(a)));
        assert!(matches!(table.poll(c, sid(1)), Err(Error::InvalidJob(_))));
        assert!(table.complete(&dispatcher, outcome(b)));
    }

    #[tokio::test]
    async fn unclaimed_outcomes_park_only_for_live_sessions() {
        let table = JobTable::new();
        let dispatcher = dispatcher_with(&[1]);

        let (live, _) = table.issue(sid(1), JobKind::Write);
        let (gone, _) = table.issue(sid(2), JobKind::Write);
        assert!(table.complete(&dispatcher, outcome(live)));
        assert!(table.complete(&dispatcher, outcome(gone)));

        assert_eq!(table.poll(live, sid(1)).unwrap(), Some(outcome(live)));
        assert!(matches!(table.poll(gone, sid(2)), Err(Error::InvalidJob(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn poll_racing_completion_never_loses_the_job() {
        let table = Arc::new(JobTable::new());
        let dispatcher = Arc::new(dispatcher_with(&[1]));

        for _ in 0..200 {
            let (job, _) = table.issue(sid(1), JobKind::Write);
            let completer = {
                let table = Arc::clone(&table);
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move { table.complete(&dispatcher, outcome(job)) })
            };

            let mut seen = None;
            while seen.is_none() {
                match table.poll(job, sid(1)) {
                    Ok(Some(done)) => seen = Some(done),
                    Ok(None) => tokio::task::yield_now().await,
                    Err(e) => panic!("job {job} lost while completing: {e}"),
                }
            }
            assert!(completer.await.unwrap());
            assert_eq!(seen, Some(outcome(job)));
        }
    }
}

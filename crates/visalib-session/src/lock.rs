//! Per-resource lock arbitration.
//!
//! Every resource (by canonical name) has one lock state:
//!
//! - `Unlocked`
//! - `Exclusive { owner, depth }`: one session, possibly nested
//! - `Shared { key, owners }`: any number of sessions presenting the same
//!   access key, each possibly nested
//!
//! State changes happen under the resource's mutex. Waiters park on a
//! [`Notify`] that is signalled whenever a lock is released, and re-check
//! the state after every wakeup until they are granted or their deadline
//! passes.
//!
//! Each request carries its session's closing token. The token is checked
//! under the resource's mutex before anything is granted, and a session's
//! locks are released only after its token is cancelled, so a lock can never
//! outlive the session that asked for it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use visalib_core::error::{Error, Result};
use visalib_core::status::Completion;
use visalib_core::types::{AccessMode, SessionId, Timeout};

#[derive(Debug, Default)]
enum LockState {
    #[default]
    Unlocked,
    Exclusive {
        owner: SessionId,
        depth: u32,
    },
    Shared {
        key: String,
        owners: BTreeMap<SessionId, u32>,
    },
}

#[derive(Default)]
struct ResourceLock {
    state: Mutex<LockState>,
    released: Notify,
}

impl ResourceLock {
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of one attempt to take a lock.
enum Attempt<T> {
    Granted(T),
    /// Not grantable now; the error is returned if the deadline passes.
    Wait(Error),
    /// Never grantable while this session holds what it holds.
    Fail(Error),
}

/// A granted shared lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedGrant {
    /// The access key other sessions must present to join.
    pub key: String,
    /// [`Completion::Success`] or [`Completion::NestedShared`].
    pub completion: Completion,
}

/// Lock states of all resources of one resource manager.
#[derive(Default)]
pub(crate) struct LockManager {
    resources: Mutex<HashMap<String, Arc<ResourceLock>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, resource: &str) -> Arc<ResourceLock> {
        let mut map = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(resource.to_string()).or_default())
    }

    fn existing(&self, resource: &str) -> Option<Arc<ResourceLock>> {
        let map = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(resource).cloned()
    }

    /// Take the exclusive lock on `resource`, waiting up to `timeout`.
    pub async fn lock_exclusive(
        &self,
        resource: &str,
        session: SessionId,
        closing: &CancellationToken,
        timeout: Timeout,
    ) -> Result<Completion> {
        let completion = self
            .acquire(resource, closing, timeout, |state| match state {
                LockState::Unlocked => {
                    *state = LockState::Exclusive {
                        owner: session,
                        depth: 1,
                    };
                    Attempt::Granted(Completion::Success)
                }
                LockState::Exclusive { owner, depth } if *owner == session => {
                    *depth += 1;
                    Attempt::Granted(Completion::NestedExclusive)
                }
                LockState::Exclusive { .. } => Attempt::Wait(Error::Timeout),
                LockState::Shared { owners, .. } if owners.contains_key(&session) => {
                    Attempt::Fail(Error::ResourceLocked)
                }
                LockState::Shared { .. } => Attempt::Wait(Error::Timeout),
            })
            .await?;

        tracing::debug!(resource = %resource, session = %session, "Exclusive lock granted");
        Ok(completion)
    }

    /// Take or join a shared lock on `resource`, waiting up to `timeout`.
    ///
    /// From `Unlocked` the requested key (or a generated one) becomes the
    /// lock's key. An existing shared lock is joined only with its key.
    pub async fn lock_shared(
        &self,
        resource: &str,
        session: SessionId,
        closing: &CancellationToken,
        timeout: Timeout,
        requested_key: Option<&str>,
    ) -> Result<SharedGrant> {
        let grant = self
            .acquire(resource, closing, timeout, |state| match state {
                LockState::Unlocked => {
                    let key = requested_key.map_or_else(generate_key, str::to_string);
                    *state = LockState::Shared {
                        key: key.clone(),
                        owners: BTreeMap::from([(session, 1)]),
                    };
                    Attempt::Granted(SharedGrant {
                        key,
                        completion: Completion::Success,
                    })
                }
                LockState::Shared { key, owners } => {
                    let key_matches = requested_key.is_none_or(|k| k == key.as_str());
                    match owners.get_mut(&session) {
                        Some(depth) if key_matches => {
                            *depth += 1;
                            Attempt::Granted(SharedGrant {
                                key: key.clone(),
                                completion: Completion::NestedShared,
                            })
                        }
                        None if requested_key == Some(key.as_str()) => {
                            owners.insert(session, 1);
                            Attempt::Granted(SharedGrant {
                                key: key.clone(),
                                completion: Completion::Success,
                            })
                        }
                        Some(_) => Attempt::Fail(Error::AccessDenied(
                            "key does not match the shared lock this session holds".into(),
                        )),
                        None => Attempt::Wait(Error::Timeout),
                    }
                }
                LockState::Exclusive { owner, .. } if *owner == session => {
                    Attempt::Fail(Error::ResourceLocked)
                }
                LockState::Exclusive { .. } => Attempt::Wait(Error::ResourceLocked),
            })
            .await?;

        tracing::debug!(
            resource = %resource,
            session = %session,
            nested = grant.completion == Completion::NestedShared,
            "Shared lock granted"
        );
        Ok(grant)
    }

    async fn acquire<T, F>(
        &self,
        resource: &str,
        closing: &CancellationToken,
        timeout: Timeout,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(&mut LockState) -> Attempt<T>,
    {
        let lock = self.entry(resource);
        let deadline = timeout.deadline();

        loop {
            let released = lock.released.notified();
            tokio::pin!(released);
            // Register before checking, so a release between the check and
            // the await still wakes us.
            released.as_mut().enable();

            let on_expiry = {
                let mut state = lock.state();
                if closing.is_cancelled() {
                    return Err(Error::AlreadyClosed);
                }
                match attempt(&mut *state) {
                    Attempt::Granted(value) => return Ok(value),
                    Attempt::Fail(e) => return Err(e),
                    Attempt::Wait(e) => e,
                }
            };

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut released => {}
                _ = closing.cancelled() => {
                    tracing::debug!(resource = %resource, "Lock wait ended by close");
                    return Err(Error::AlreadyClosed);
                }
                _ = expired => {
                    tracing::debug!(resource = %resource, error = %on_expiry, "Lock wait expired");
                    return Err(on_expiry);
                }
            }
        }
    }

    /// Release one level of the lock `session` holds on `resource`.
    ///
    /// Fails with [`Error::AccessDenied`] and leaves the state untouched if
    /// the session holds no lock there.
    pub fn unlock(&self, resource: &str, session: SessionId) -> Result<()> {
        let not_owner =
            || Error::AccessDenied(format!("{session} holds no lock on {resource}"));
        let lock = self.existing(resource).ok_or_else(not_owner)?;

        let released = {
            let mut state = lock.state();
            match &mut *state {
                LockState::Exclusive { owner, depth } if *owner == session => {
                    *depth -= 1;
                    if *depth == 0 {
                        *state = LockState::Unlocked;
                        true
                    } else {
                        false
                    }
                }
                LockState::Shared { owners, .. } => match owners.get_mut(&session) {
                    Some(depth) => {
                        *depth -= 1;
                        if *depth == 0 {
                            owners.remove(&session);
                        }
                        if owners.is_empty() {
                            *state = LockState::Unlocked;
                        }
                        true
                    }
                    None => return Err(not_owner()),
                },
                _ => return Err(not_owner()),
            }
        };

        if released {
            lock.released.notify_waiters();
        }
        tracing::debug!(resource = %resource, session = %session, "Lock released");
        Ok(())
    }

    /// Drop every lock level `session` holds on `resource`.
    pub fn release_all(&self, resource: &str, session: SessionId) {
        let Some(lock) = self.existing(resource) else {
            return;
        };

        let released = {
            let mut state = lock.state();
            match &mut *state {
                LockState::Exclusive { owner, .. } if *owner == session => {
                    *state = LockState::Unlocked;
                    true
                }
                LockState::Shared { owners, .. } if owners.contains_key(&session) => {
                    owners.remove(&session);
                    if owners.is_empty() {
                        *state = LockState::Unlocked;
                    }
                    true
                }
                _ => false,
            }
        };

        if released {
            tracing::debug!(resource = %resource, session = %session, "Locks released on close");
            lock.released.notify_waiters();
        }
    }

    /// Admission check for I/O: fails with [`Error::ResourceLocked`] if
    /// another session holds the exclusive lock, or a shared lock this
    /// session is not part of.
    pub fn check_access(&self, resource: &str, session: SessionId) -> Result<()> {
        let Some(lock) = self.existing(resource) else {
            return Ok(());
        };
        match &*lock.state() {
            LockState::Unlocked => Ok(()),
            LockState::Exclusive { owner, .. } if *owner == session => Ok(()),
            LockState::Shared { owners, .. } if owners.contains_key(&session) => Ok(()),
            _ => Err(Error::ResourceLocked),
        }
    }

    /// The lock `session` holds on `resource`.
    pub fn held_by(&self, resource: &str, session: SessionId) -> AccessMode {
        let Some(lock) = self.existing(resource) else {
            return AccessMode::NoLock;
        };
        match &*lock.state() {
            LockState::Exclusive { owner, .. } if *owner == session => AccessMode::ExclusiveLock,
            LockState::Shared { owners, .. } if owners.contains_key(&session) => {
                AccessMode::SharedLock
            }
            _ => AccessMode::NoLock,
        }
    }
}

fn generate_key() -> String {
    format!("key-{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const R: &str = "GPIB0::2::INSTR";

    fn sid(n: u64) -> SessionId {
        SessionId::from_raw(n)
    }

    fn live() -> CancellationToken {
        CancellationToken::new()
    }

    fn ms(n: u64) -> Timeout {
        Timeout::After(Duration::from_millis(n))
    }

    #[tokio::test]
    async fn exclusive_then_unlock() {
        let locks = LockManager::new();
        let c = locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();
        assert_eq!(c, Completion::Success);
        assert_eq!(locks.held_by(R, sid(1)), AccessMode::ExclusiveLock);
        assert!(matches!(locks.check_access(R, sid(2)), Err(Error::ResourceLocked)));
        locks.check_access(R, sid(1)).unwrap();

        locks.unlock(R, sid(1)).unwrap();
        assert_eq!(locks.held_by(R, sid(1)), AccessMode::NoLock);
        locks.check_access(R, sid(2)).unwrap();
    }

    #[tokio::test]
    async fn exclusive_nests() {
        let locks = LockManager::new();
        locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();
        let c = locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();
        assert_eq!(c, Completion::NestedExclusive);

        locks.unlock(R, sid(1)).unwrap();
        assert_eq!(locks.held_by(R, sid(1)), AccessMode::ExclusiveLock);
        locks.unlock(R, sid(1)).unwrap();
        assert_eq!(locks.held_by(R, sid(1)), AccessMode::NoLock);
    }

    #[tokio::test]
    async fn exclusive_times_out_while_held() {
        let locks = LockManager::new();
        locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();
        let err = locks.lock_exclusive(R, sid(2), &live(), ms(30)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(matches!(
            locks.lock_exclusive(R, sid(2), &live(), Timeout::Immediate).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn waiter_is_granted_on_release() {
        let locks = Arc::new(LockManager::new());
        locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.lock_exclusive(R, sid(2), &live(), ms(2000)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.unlock(R, sid(1)).unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), Completion::Success);
        assert_eq!(locks.held_by(R, sid(2)), AccessMode::ExclusiveLock);
    }

    #[tokio::test]
    async fn unlock_by_non_owner_is_denied_and_changes_nothing() {
        let locks = LockManager::new();
        assert!(matches!(locks.unlock(R, sid(2)), Err(Error::AccessDenied(_))));

        locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();
        assert!(matches!(locks.unlock(R, sid(2)), Err(Error::AccessDenied(_))));
        assert_eq!(locks.held_by(R, sid(1)), AccessMode::ExclusiveLock);
        assert!(matches!(locks.check_access(R, sid(2)), Err(Error::ResourceLocked)));
    }

    #[tokio::test]
    async fn shared_lock_joined_by_key() {
        let locks = LockManager::new();
        let grant = locks
            .lock_shared(R, sid(1), &live(), Timeout::Immediate, None)
            .await
            .unwrap();
        assert!(grant.key.starts_with("key-"));
        assert_eq!(grant.completion, Completion::Success);

        // No key, no entry.
        assert!(matches!(
            locks.lock_shared(R, sid(2), &live(), ms(20), None).await,
            Err(Error::Timeout)
        ));
        assert!(matches!(locks.check_access(R, sid(2)), Err(Error::ResourceLocked)));

        let joined = locks
            .lock_shared(R, sid(2), &live(), Timeout::Immediate, Some(&grant.key))
            .await
            .unwrap();
        assert_eq!(joined.key, grant.key);
        locks.check_access(R, sid(2)).unwrap();
        assert!(matches!(locks.check_access(R, sid(3)), Err(Error::ResourceLocked)));

        locks.unlock(R, sid(1)).unwrap();
        assert!(matches!(locks.check_access(R, sid(3)), Err(Error::ResourceLocked)));
        locks.unlock(R, sid(2)).unwrap();
        locks.check_access(R, sid(3)).unwrap();
    }

    #[tokio::test]
    async fn shared_lock_uses_requested_key_when_unlocked() {
        let locks = LockManager::new();
        let grant = locks
            .lock_shared(R, sid(1), &live(), Timeout::Immediate, Some("bench-a"))
            .await
            .unwrap();
        assert_eq!(grant.key, "bench-a");

        let nested = locks
            .lock_shared(R, sid(1), &live(), Timeout::Immediate, Some("bench-a"))
            .await
            .unwrap();
        assert_eq!(nested.completion, Completion::NestedShared);
    }

    #[tokio::test]
    async fn shared_expiry_reports_blocker() {
        let locks = LockManager::new();
        locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();
        assert!(matches!(
            locks.lock_shared(R, sid(2), &live(), ms(20), Some("k")).await,
            Err(Error::ResourceLocked)
        ));

        locks.unlock(R, sid(1)).unwrap();
        locks.lock_shared(R, sid(1), &live(), Timeout::Immediate, Some("k1")).await.unwrap();
        assert!(matches!(
            locks.lock_shared(R, sid(2), &live(), ms(20), Some("k2")).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn release_all_frees_nested_locks() {
        let locks = LockManager::new();
        locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();
        locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();
        locks.release_all(R, sid(1));
        locks.lock_exclusive(R, sid(2), &live(), Timeout::Immediate).await.unwrap();
    }

    #[tokio::test]
    async fn resources_are_independent() {
        let locks = LockManager::new();
        locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();
        locks
            .lock_exclusive("GPIB0::3::INSTR", sid(2), &live(), Timeout::Immediate)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closing_session_is_never_granted() {
        let locks = LockManager::new();
        let closing = CancellationToken::new();
        closing.cancel();
        assert!(matches!(
            locks.lock_exclusive(R, sid(1), &closing, Timeout::Immediate).await,
            Err(Error::AlreadyClosed)
        ));
        assert!(matches!(
            locks.lock_shared(R, sid(1), &closing, Timeout::Immediate, None).await,
            Err(Error::AlreadyClosed)
        ));
        assert_eq!(locks.held_by(R, sid(1)), AccessMode::NoLock);
    }

    #[tokio::test]
    async fn close_ends_pending_wait_without_grant() {
        let locks = Arc::new(LockManager::new());
        locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();

        let closing = CancellationToken::new();
        let waiter = {
            let locks = Arc::clone(&locks);
            let closing = closing.clone();
            tokio::spawn(async move {
                locks.lock_exclusive(R, sid(2), &closing, Timeout::Infinite).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        closing.cancel();
        locks.release_all(R, sid(2));

        assert!(matches!(waiter.await.unwrap(), Err(Error::AlreadyClosed)));
        locks.unlock(R, sid(1)).unwrap();
        assert_eq!(locks.held_by(R, sid(2)), AccessMode::NoLock);
        locks.lock_exclusive(R, sid(3), &live(), Timeout::Immediate).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_racing_release_leaves_no_orphan_lock() {
        for _ in 0..50 {
            let locks = Arc::new(LockManager::new());
            locks.lock_exclusive(R, sid(1), &live(), Timeout::Immediate).await.unwrap();

            let closing = CancellationToken::new();
            let waiter = {
                let locks = Arc::clone(&locks);
                let closing = closing.clone();
                tokio::spawn(async move {
                    locks.lock_exclusive(R, sid(2), &closing, Timeout::Infinite).await
                })
            };
            tokio::task::yield_now().await;

            let releaser = {
                let locks = Arc::clone(&locks);
                tokio::spawn(async move { locks.unlock(R, sid(1)) })
            };
            closing.cancel();
            locks.release_all(R, sid(2));

            releaser.await.unwrap().unwrap();
            let _ = waiter.await.unwrap();
            assert_eq!(locks.held_by(R, sid(2)), AccessMode::NoLock);
            locks.check_access(R, sid(3)).unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_exclusive_owner_under_contention() {
        let locks = Arc::new(LockManager::new());
        let holders = Arc::new(AtomicUsize::new(0));
        let grants = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for n in 1..=16u64 {
            let locks = Arc::clone(&locks);
            let holders = Arc::clone(&holders);
            let grants = Arc::clone(&grants);
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    locks.lock_exclusive(R, sid(n), &live(), Timeout::Infinite).await.unwrap();
                    let inside = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    assert_eq!(inside, 1, "two sessions hold the exclusive lock");
                    tokio::task::yield_now().await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    grants.fetch_add(1, Ordering::SeqCst);
                    locks.unlock(R, sid(n)).unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(grants.load(Ordering::SeqCst), 16 * 20);
    }
}

//! The version-lease technique: acquire, refresh, and release expressed as
//! conditional writes against a [`LockStore`].
//!
//! Every lock record carries a fencing token (`version_number`) that rotates
//! on each write. Holding a lock means knowing the token of the last write;
//! every subsequent write is predicated on it. An acquirer that finds the
//! record occupied waits out the advertised lease and re-reads: an unchanged
//! token across a full wait means the holder missed its refresh and is
//! presumed dead, so the record may be overwritten with the stale token as
//! the predicate. The conditional write linearises concurrent stealers down
//! to one winner.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{AcquireTimeoutSnafu, LockError, StoreError};
use crate::handle::LockState;
use crate::identity::{Clock, HostIdentity};
use crate::store::{LockRecord, LockStore};

/// Immediate retries a single refresh gets on transport failure before the
/// lock is treated as stolen.
const REFRESH_TRANSIENT_ATTEMPTS: u32 = 3;

/// Outcome of one refresh pass for a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefreshOutcome {
    /// Ownership re-asserted; the handle carries the rotated token.
    Refreshed,
    /// Ownership is gone: stolen, released concurrently, or unreachable past
    /// the retry budget. The entry must stop refreshing.
    Lost,
}

/// The lock protocol over one store, shared by every handle of a session.
pub(crate) struct VersionLease {
    store: Arc<dyn LockStore>,
    identity: Arc<dyn HostIdentity>,
    clock: Arc<dyn Clock>,
}

impl VersionLease {
    pub(crate) fn new(
        store: Arc<dyn LockStore>,
        identity: Arc<dyn HostIdentity>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, identity, clock }
    }

    fn record(&self, lease_secs: u64, version: &str) -> LockRecord {
        LockRecord {
            lease_duration: lease_secs,
            version_number: version.to_string(),
            host_identifier: self.identity.host_id(),
        }
    }

    /// Acquire the named lock, waiting out live holders.
    ///
    /// Loops until the record could be written, the store fails, or the
    /// optional timeout elapses. On success the handle state is `Held` with
    /// the token of our write.
    pub(crate) async fn acquire(
        &self,
        state: &LockState,
        lease_secs: u64,
        retry_interval_secs: u64,
        timeout: Option<Duration>,
    ) -> Result<(), LockError> {
        let started = self.clock.now();
        let name = state.name().to_string();

        loop {
            let version = self.identity.new_version();
            match self
                .store
                .put_if_absent(&name, self.record(lease_secs, &version))
                .await
            {
                Ok(()) => {
                    state.set_held(version.clone());
                    debug!(key = %name, version = %version, lease_secs, "lock acquired");
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => {}
                Err(err) => return Err(err.into()),
            }

            // Occupied. Learn the holder's advertised lease and token.
            let Some(observed) = self.store.get(&name).await? else {
                // Released between our write and the read; take it right away.
                continue;
            };

            let required = Duration::from_secs(observed.lease_duration.min(retry_interval_secs));

            if let Some(limit) = timeout {
                let remaining = limit.saturating_sub(self.waited(started));
                if remaining < required {
                    // Not enough budget left to prove the holder dead. Wait
                    // out the remainder and take the lock only if it is
                    // freed; a truncated wait never justifies a steal.
                    tokio::time::sleep(remaining).await;
                    if self.store.get(&name).await?.is_none() {
                        let version = self.identity.new_version();
                        if self
                            .store
                            .put_if_absent(&name, self.record(lease_secs, &version))
                            .await
                            .is_ok()
                        {
                            state.set_held(version.clone());
                            debug!(key = %name, version = %version, lease_secs, "lock acquired");
                            return Ok(());
                        }
                    }
                    return AcquireTimeoutSnafu {
                        name,
                        waited_secs: self.waited(started).as_secs(),
                    }
                    .fail();
                }
            }
            tokio::time::sleep(required).await;

            match self.store.get(&name).await? {
                None => continue,
                Some(current) if current.version_number == observed.version_number => {
                    // The holder failed to refresh within its advertised
                    // lease; overwrite with its token as the predicate.
                    let version = self.identity.new_version();
                    match self
                        .store
                        .put_if_version(
                            &name,
                            self.record(lease_secs, &version),
                            &observed.version_number,
                        )
                        .await
                    {
                        Ok(()) => {
                            state.set_held(version.clone());
                            debug!(
                                key = %name,
                                version = %version,
                                previous_holder = %current.host_identifier,
                                "stole expired lock"
                            );
                            return Ok(());
                        }
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Some(_) => {
                    // Token moved: the holder is alive, or a rival stole
                    // first. Keep waiting until the deadline says stop.
                    if let Some(limit) = timeout {
                        if self.waited(started) >= limit {
                            return AcquireTimeoutSnafu {
                                name,
                                waited_secs: self.waited(started).as_secs(),
                            }
                            .fail();
                        }
                    }
                }
            }
        }
    }

    /// Re-assert ownership by rotating the record's token.
    pub(crate) async fn refresh(&self, state: &LockState, lease_secs: u64) -> RefreshOutcome {
        let name = state.name().to_string();
        let Some(old_version) = state.current_version() else {
            return RefreshOutcome::Lost;
        };
        let new_version = self.identity.new_version();
        let record = self.record(lease_secs, &new_version);

        let mut attempts = 0u32;
        loop {
            match self
                .store
                .put_if_version(&name, record.clone(), &old_version)
                .await
            {
                Ok(()) => {
                    if state.rotate_version(&old_version, new_version.clone()) {
                        debug!(key = %name, version = %new_version, "lock refreshed");
                        return RefreshOutcome::Refreshed;
                    }
                    // Released while our write was in flight; the record we
                    // just rotated is left to lease expiry.
                    return RefreshOutcome::Lost;
                }
                Err(StoreError::Conflict { .. }) => {
                    warn!(key = %name, "lock stolen: lease expired before refresh arrived");
                    state.mark_stolen(&old_version);
                    return RefreshOutcome::Lost;
                }
                Err(StoreError::Transient { ref message }) => {
                    attempts += 1;
                    if attempts >= REFRESH_TRANSIENT_ATTEMPTS {
                        warn!(
                            key = %name,
                            error = %message,
                            "refresh retries exhausted, treating lock as stolen"
                        );
                        state.mark_stolen(&old_version);
                        return RefreshOutcome::Lost;
                    }
                }
            }
        }
    }

    /// Delete the record if we still own it. Conflicts are swallowed: the
    /// record is not ours to delete once stolen, and the caller must be able
    /// to release unconditionally in cleanup paths.
    pub(crate) async fn release(&self, state: &LockState) -> Result<(), LockError> {
        let name = state.name().to_string();
        let Some(version) = state.take_if_held() else {
            return Ok(());
        };
        match self.store.delete_if_version(&name, &version).await {
            Ok(()) => {
                debug!(key = %name, "lock released");
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(key = %name, "release found a rotated record, leaving it to its lease");
                Ok(())
            }
            Err(err) => {
                // The handle is free either way; the record expires on its
                // own if this delete never lands.
                warn!(key = %name, error = %err, "release could not reach the store");
                Err(err.into())
            }
        }
    }

    fn waited(&self, started: Duration) -> Duration {
        self.clock.now().saturating_sub(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ProcessIdentity, TokioClock};
    use crate::store::InMemoryLockStore;

    fn technique(store: Arc<InMemoryLockStore>) -> VersionLease {
        VersionLease::new(
            store,
            Arc::new(ProcessIdentity::new()),
            Arc::new(TokioClock::default()),
        )
    }

    #[tokio::test]
    async fn acquire_writes_record_and_marks_held() {
        let store = InMemoryLockStore::new("locks");
        let lease = technique(store.clone());
        let state = LockState::new("job");

        lease.acquire(&state, 20, 10, None).await.unwrap();

        assert!(state.is_held());
        let record = store.get("job").await.unwrap().unwrap();
        assert_eq!(record.lease_duration, 20);
        assert_eq!(Some(record.version_number), state.current_version());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_steals_after_unrefreshed_lease() {
        let store = InMemoryLockStore::new("locks");
        let lease = technique(store.clone());

        let dead = LockState::new("job");
        lease.acquire(&dead, 2, 1, None).await.unwrap();
        let dead_version = dead.current_version().unwrap();

        // the dead holder never refreshes; a second acquirer waits out the
        // advertised lease and overwrites
        let thief = LockState::new("job");
        lease.acquire(&thief, 20, 10, None).await.unwrap();

        let record = store.get("job").await.unwrap().unwrap();
        assert_ne!(record.version_number, dead_version);
        assert_eq!(Some(record.version_number), thief.current_version());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_against_live_holder() {
        let store = InMemoryLockStore::new("locks");
        let lease = technique(store.clone());

        let holder = LockState::new("job");
        lease.acquire(&holder, 20, 10, None).await.unwrap();
        let holder_version = holder.current_version().unwrap();

        let contender = LockState::new("job");
        let result = lease
            .acquire(&contender, 20, 10, Some(Duration::from_secs(3)))
            .await;

        assert!(matches!(result, Err(LockError::AcquireTimeout { .. })));
        assert!(!contender.is_held());
        // the holder's record must be untouched: a truncated wait never steals
        let record = store.get("job").await.unwrap().unwrap();
        assert_eq!(record.version_number, holder_version);
    }

    #[tokio::test]
    async fn refresh_rotates_version() {
        let store = InMemoryLockStore::new("locks");
        let lease = technique(store.clone());
        let state = LockState::new("job");
        lease.acquire(&state, 20, 10, None).await.unwrap();
        let before = state.current_version().unwrap();

        assert_eq!(lease.refresh(&state, 20).await, RefreshOutcome::Refreshed);

        let after = state.current_version().unwrap();
        assert_ne!(before, after);
        assert_eq!(store.get("job").await.unwrap().unwrap().version_number, after);
    }

    #[tokio::test]
    async fn refresh_detects_steal() {
        let store = InMemoryLockStore::new("locks");
        let lease = technique(store.clone());
        let state = LockState::new("job");
        lease.acquire(&state, 20, 10, None).await.unwrap();

        // a rival rotates the record behind our back
        let stored = store.get("job").await.unwrap().unwrap();
        store
            .put_if_version(
                "job",
                LockRecord {
                    lease_duration: 20,
                    version_number: "rival-version".to_string(),
                    host_identifier: "rival".to_string(),
                },
                &stored.version_number,
            )
            .await
            .unwrap();

        assert_eq!(lease.refresh(&state, 20).await, RefreshOutcome::Lost);
        assert!(state.is_stolen());
    }

    #[tokio::test]
    async fn release_deletes_record_and_is_idempotent() {
        let store = InMemoryLockStore::new("locks");
        let lease = technique(store.clone());
        let state = LockState::new("job");
        lease.acquire(&state, 20, 10, None).await.unwrap();

        lease.release(&state).await.unwrap();
        assert!(!state.is_held());
        assert!(store.get("job").await.unwrap().is_none());

        // releasing a free handle is a no-op
        lease.release(&state).await.unwrap();
    }

    #[tokio::test]
    async fn release_swallows_conflict_after_steal() {
        let store = InMemoryLockStore::new("locks");
        let lease = technique(store.clone());
        let state = LockState::new("job");
        lease.acquire(&state, 20, 10, None).await.unwrap();

        let stored = store.get("job").await.unwrap().unwrap();
        store
            .put_if_version(
                "job",
                LockRecord {
                    lease_duration: 20,
                    version_number: "rival-version".to_string(),
                    host_identifier: "rival".to_string(),
                },
                &stored.version_number,
            )
            .await
            .unwrap();

        // not ours any more, but release still succeeds from our side
        lease.release(&state).await.unwrap();
        assert!(store.get("job").await.unwrap().is_some());
    }
}

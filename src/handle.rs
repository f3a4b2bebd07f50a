//! Per-caller lock handles.
//!
//! A [`LockHandle`] binds a logical lock name to a session. It is created
//! free, becomes held on acquire, and goes back to free on release. The
//! mutable part (the status tag and, while held, the current fencing token)
//! lives in a [`LockState`] shared with the session's refresh worker; its
//! critical sections are compare-and-swap only and never span an await.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{IllegalStateSnafu, LockError};
use crate::refresher::Refresher;
use crate::technique::{RefreshOutcome, VersionLease};

/// Tuning for one lock handle. All windows are whole seconds; the record
/// advertises whole seconds and sub-second leases are out of scope.
///
/// Clock drift between hosts is not mitigated: do not set `lease_secs` below
/// the expected cross-host clock skew plus worst-case one-way latency.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Advertised lease window. Other clients wait at least this long before
    /// stealing an unrefreshed lock.
    pub lease_secs: u64,
    /// Cadence of background refreshes; clamped strictly below the lease.
    pub refresh_period_secs: u64,
    /// Pause between acquire retries while another agent holds the lock.
    /// Defaults to half the lease.
    pub retry_interval_secs: Option<u64>,
    /// Default acquire deadline. `None` waits indefinitely.
    pub acquire_timeout_secs: Option<u64>,
    /// Whether a successful acquire registers with the session's refresh
    /// worker. Disable for short critical sections that finish well inside
    /// one lease window.
    pub auto_refresh: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: 20,
            refresh_period_secs: 5,
            retry_interval_secs: None,
            acquire_timeout_secs: None,
            auto_refresh: true,
        }
    }
}

impl LockConfig {
    /// Clamp the refresh cadence under the lease: at most half the lease,
    /// at least a second under it (network slack), never zero.
    pub(crate) fn normalized(mut self) -> Self {
        self.lease_secs = self.lease_secs.max(1);
        let ceiling = (self.lease_secs / 2)
            .min(self.lease_secs.saturating_sub(1))
            .max(1);
        self.refresh_period_secs = self.refresh_period_secs.clamp(1, ceiling);
        self
    }

    pub(crate) fn retry_interval(&self) -> u64 {
        self.retry_interval_secs
            .unwrap_or((self.lease_secs / 2).max(1))
            .max(1)
    }

    pub(crate) fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_period_secs)
    }

    pub(crate) fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LockStatus {
    Free,
    Held { version: String },
    Stolen,
    Transferred,
}

/// Shared mutable state of one handle: the status tag and current token.
pub(crate) struct LockState {
    name: String,
    status: Mutex<LockStatus>,
}

impl LockState {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Mutex::new(LockStatus::Free),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_held(&self) -> bool {
        matches!(&*self.status.lock(), LockStatus::Held { .. })
    }

    pub(crate) fn is_stolen(&self) -> bool {
        matches!(&*self.status.lock(), LockStatus::Stolen)
    }

    pub(crate) fn current_version(&self) -> Option<String> {
        match &*self.status.lock() {
            LockStatus::Held { version } => Some(version.clone()),
            _ => None,
        }
    }

    pub(crate) fn set_held(&self, version: String) {
        *self.status.lock() = LockStatus::Held { version };
    }

    /// Rotate the held token, but only if the handle still holds the token
    /// the write was predicated on; a concurrent release wins.
    pub(crate) fn rotate_version(&self, expected: &str, next: String) -> bool {
        let mut status = self.status.lock();
        match &*status {
            LockStatus::Held { version } if version == expected => {
                *status = LockStatus::Held { version: next };
                true
            }
            _ => false,
        }
    }

    /// Mark the lock stolen, but only if the handle still holds the token
    /// the failed write was predicated on.
    pub(crate) fn mark_stolen(&self, expected: &str) {
        let mut status = self.status.lock();
        if matches!(&*status, LockStatus::Held { version } if version == expected) {
            *status = LockStatus::Stolen;
        }
    }

    /// Transition `Held` to `Free`, handing the final token to the caller.
    pub(crate) fn take_if_held(&self) -> Option<String> {
        let mut status = self.status.lock();
        match &*status {
            LockStatus::Held { version } => {
                let version = version.clone();
                *status = LockStatus::Free;
                Some(version)
            }
            _ => None,
        }
    }

    fn mark_transferred(&self, expected: &str) -> bool {
        let mut status = self.status.lock();
        match &*status {
            LockStatus::Held { version } if version == expected => {
                *status = LockStatus::Transferred;
                true
            }
            _ => false,
        }
    }
}

/// A named lock bound to a session.
///
/// Create one with [`Session::create_lock`](crate::Session::create_lock) or
/// by deserializing a transferred lock. Handles are not `Clone`: one handle,
/// one holder.
pub struct LockHandle {
    state: Arc<LockState>,
    table: String,
    config: LockConfig,
    technique: Arc<VersionLease>,
    refresher: Arc<Refresher>,
    registration_id: u64,
}

impl LockHandle {
    pub(crate) fn new(
        name: String,
        table: String,
        config: LockConfig,
        technique: Arc<VersionLease>,
        refresher: Arc<Refresher>,
    ) -> Self {
        let registration_id = refresher.allocate_id();
        Self {
            state: Arc::new(LockState::new(name)),
            table,
            config,
            technique,
            refresher,
            registration_id,
        }
    }

    /// Logical lock name.
    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Advertised lease window.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.config.lease_secs)
    }

    /// Whether this handle currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.state.is_held()
    }

    /// Acquire the lock, waiting as long as the configured acquire timeout
    /// allows (indefinitely by default).
    ///
    /// Fails with [`LockError::IllegalState`] if this handle already holds
    /// the lock, and with [`LockError::AcquireTimeout`] once the deadline
    /// passes while another agent keeps the lock alive.
    pub async fn acquire(&self) -> Result<(), LockError> {
        self.acquire_inner(self.config.acquire_timeout()).await
    }

    /// Acquire with an explicit deadline, overriding the configured timeout.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<(), LockError> {
        self.acquire_inner(Some(timeout)).await
    }

    async fn acquire_inner(&self, timeout: Option<Duration>) -> Result<(), LockError> {
        if self.state.is_held() {
            return IllegalStateSnafu {
                operation: "acquire",
                reason: "this handle already holds the lock",
            }
            .fail();
        }
        self.technique
            .acquire(
                &self.state,
                self.config.lease_secs,
                self.config.retry_interval(),
                timeout,
            )
            .await?;
        if self.config.auto_refresh {
            self.refresher.register(
                self.registration_id,
                Arc::downgrade(&self.state),
                self.config.lease_secs,
                self.config.refresh_period(),
            );
        }
        Ok(())
    }

    /// Release the lock.
    ///
    /// Idempotent and safe in cleanup paths: releasing a free, stolen, or
    /// transferred handle is a silent no-op, and a record that was stolen
    /// underneath us is simply left to its new owner.
    pub async fn release(&self) -> Result<(), LockError> {
        self.refresher.deregister(self.registration_id);
        self.technique.release(&self.state).await
    }

    /// Re-assert ownership now, rotating the fencing token.
    ///
    /// The session's background worker does this automatically for
    /// auto-refresh handles; calling it by hand matters only when
    /// auto-refresh is disabled. Fails with [`LockError::IllegalState`] when
    /// the handle is not held, including when this very call discovers the
    /// lock was stolen and transitions the handle accordingly.
    pub async fn refresh(&self) -> Result<(), LockError> {
        if !self.state.is_held() {
            return IllegalStateSnafu {
                operation: "refresh",
                reason: "the lock is not held",
            }
            .fail();
        }
        match self.technique.refresh(&self.state, self.config.lease_secs).await {
            RefreshOutcome::Refreshed => Ok(()),
            RefreshOutcome::Lost => IllegalStateSnafu {
                operation: "refresh",
                reason: "the lock was stolen",
            }
            .fail(),
        }
    }

    /// Run `body` while holding the lock: acquire on entry, release on every
    /// exit path.
    ///
    /// Release failures after `body` completes are logged and swallowed so
    /// the body's outcome survives. If `body` panics, a best-effort release
    /// is spawned and the panic propagates; should that release never land,
    /// the record expires with its lease.
    pub async fn with<F, Fut, R>(&self, body: F) -> Result<R, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.acquire().await?;
        let guard = ReleaseGuard::arm(self);
        let result = body().await;
        guard.disarm();
        if let Err(error) = self.release().await {
            warn!(
                key = %self.name(),
                error = %error,
                "release after scoped use failed, record left to lease expiry"
            );
        }
        Ok(result)
    }

    /// Install ownership proven elsewhere (deserialization) and start
    /// refreshing.
    pub(crate) fn adopt_held(&self, version: String) {
        self.state.set_held(version);
        if self.config.auto_refresh {
            self.refresher.register(
                self.registration_id,
                Arc::downgrade(&self.state),
                self.config.lease_secs,
                self.config.refresh_period(),
            );
        }
    }

    /// Serialize this held lock for transfer to another process.
    ///
    /// Serializing detaches: the handle stops refreshing, performs one final
    /// token rotation so the recipient inherits a full lease window, and
    /// transitions to a transferred state in which `release` is a no-op and
    /// `acquire` starts over. The returned JSON blob is self-contained; feed
    /// it to [`Session::deserialize_lock`](crate::Session::deserialize_lock)
    /// on a session bound to the same table.
    pub async fn serialize(&self) -> Result<String, LockError> {
        if !self.state.is_held() {
            return IllegalStateSnafu {
                operation: "serialize",
                reason: "only a held lock can be transferred",
            }
            .fail();
        }
        // Wait out the deregistration so no background refresh of this
        // entry can race the handoff rotation below with the same expected
        // token.
        self.refresher.deregister_awaited(self.registration_id).await;
        if self.technique.refresh(&self.state, self.config.lease_secs).await == RefreshOutcome::Lost
        {
            return IllegalStateSnafu {
                operation: "serialize",
                reason: "the lock was stolen before it could be transferred",
            }
            .fail();
        }
        let Some(version) = self.state.current_version() else {
            return IllegalStateSnafu {
                operation: "serialize",
                reason: "the lock was released concurrently",
            }
            .fail();
        };
        if !self.state.mark_transferred(&version) {
            // The token moved again under us; a blob naming it would be
            // stale on arrival.
            return IllegalStateSnafu {
                operation: "serialize",
                reason: "the lock was stolen before it could be transferred",
            }
            .fail();
        }

        let blob = serde_json::json!({
            "table": self.table,
            "name": self.state.name(),
            "version": version,
            "lease": self.config.lease_secs,
            "refresh_period": self.config.refresh_period_secs,
        })
        .to_string();
        debug!(key = %self.name(), "lock serialized for transfer");
        Ok(blob)
    }
}

/// Fires a best-effort release if scoped use unwinds mid-body.
struct ReleaseGuard {
    armed: bool,
    state: Arc<LockState>,
    technique: Arc<VersionLease>,
    refresher: Arc<Refresher>,
    registration_id: u64,
}

impl ReleaseGuard {
    fn arm(handle: &LockHandle) -> Self {
        Self {
            armed: true,
            state: handle.state.clone(),
            technique: handle.technique.clone(),
            refresher: handle.refresher.clone(),
            registration_id: handle.registration_id,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.refresher.deregister(self.registration_id);
        let technique = self.technique.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let _ = technique.release(&state).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockError;
    use crate::identity::{ProcessIdentity, TokioClock};
    use crate::store::{InMemoryLockStore, LockStore};

    fn handle_on(store: Arc<InMemoryLockStore>, name: &str, config: LockConfig) -> LockHandle {
        let technique = Arc::new(VersionLease::new(
            store,
            Arc::new(ProcessIdentity::new()),
            Arc::new(TokioClock::default()),
        ));
        let refresher = Arc::new(Refresher::spawn(technique.clone()));
        LockHandle::new(
            name.to_string(),
            "locks".to_string(),
            config.normalized(),
            technique,
            refresher,
        )
    }

    #[tokio::test]
    async fn acquire_on_held_handle_is_illegal() {
        let store = InMemoryLockStore::new("locks");
        let handle = handle_on(store, "job", LockConfig::default());

        handle.acquire().await.unwrap();
        let result = handle.acquire().await;
        assert!(matches!(result, Err(LockError::IllegalState { .. })));

        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = InMemoryLockStore::new("locks");
        let handle = handle_on(store.clone(), "job", LockConfig::default());

        handle.acquire().await.unwrap();
        handle.release().await.unwrap();
        handle.release().await.unwrap();
        assert!(store.get("job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reacquire_after_release_succeeds() {
        let store = InMemoryLockStore::new("locks");
        let handle = handle_on(store, "job", LockConfig::default());

        handle.acquire().await.unwrap();
        handle.release().await.unwrap();
        handle.acquire().await.unwrap();
        assert!(handle.is_held());
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn scoped_use_releases_on_success_and_failure() {
        let store = InMemoryLockStore::new("locks");
        let handle = handle_on(store.clone(), "job", LockConfig::default());

        let value = handle.with(|| async { 7 }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!handle.is_held());
        assert!(store.get("job").await.unwrap().is_none());

        let failed: Result<Result<(), &str>, LockError> =
            handle.with(|| async { Err("worker failed") }).await;
        assert_eq!(failed.unwrap(), Err("worker failed"));
        assert!(!handle.is_held());
        assert!(store.get("job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn serialize_requires_held() {
        let store = InMemoryLockStore::new("locks");
        let handle = handle_on(store, "job", LockConfig::default());

        let result = handle.serialize().await;
        assert!(matches!(result, Err(LockError::IllegalState { .. })));
    }

    #[tokio::test]
    async fn serialize_detaches_and_rotates() {
        let store = InMemoryLockStore::new("locks");
        let handle = handle_on(store.clone(), "job", LockConfig::default());

        handle.acquire().await.unwrap();
        let before = store.get("job").await.unwrap().unwrap().version_number;

        let blob = handle.serialize().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&blob).unwrap();
        assert_eq!(parsed["table"], "locks");
        assert_eq!(parsed["name"], "job");
        assert_eq!(parsed["lease"], 20);
        assert_eq!(parsed["refresh_period"], 5);

        // the blob carries the rotated token, which is what the store holds
        let stored = store.get("job").await.unwrap().unwrap();
        assert_ne!(stored.version_number, before);
        assert_eq!(parsed["version"], stored.version_number.as_str());

        // detached: not held any more, release is a no-op on the record
        assert!(!handle.is_held());
        handle.release().await.unwrap();
        assert!(store.get("job").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn config_clamps_refresh_under_lease() {
        let config = LockConfig {
            lease_secs: 2,
            refresh_period_secs: 5,
            ..LockConfig::default()
        }
        .normalized();
        assert_eq!(config.refresh_period_secs, 1);

        let config = LockConfig {
            lease_secs: 20,
            refresh_period_secs: 19,
            ..LockConfig::default()
        }
        .normalized();
        assert_eq!(config.refresh_period_secs, 10);

        let config = LockConfig::default().normalized();
        assert_eq!(config.refresh_period_secs, 5);
        assert_eq!(config.retry_interval(), 10);
    }
}

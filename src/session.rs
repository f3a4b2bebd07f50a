//! Sessions: handle factories bound to one lock table.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{AlreadyInUseSnafu, LockError, StoreError, WrongTableSnafu};
use crate::handle::{LockConfig, LockHandle};
use crate::identity::{Clock, HostIdentity, ProcessIdentity, TokioClock};
use crate::refresher::Refresher;
use crate::store::{DynamoLockStore, LockRecord, LockStore};
use crate::technique::VersionLease;

/// The wire form of a transferred lock. Unknown fields are rejected so a
/// blob from a newer, incompatible writer fails loudly instead of silently
/// dropping state.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SerializedLock {
    table: String,
    name: String,
    version: String,
    lease: u64,
    refresh_period: u64,
}

/// A session binds lock handles to one table of one store and owns the
/// background refresh worker that keeps held locks alive.
///
/// Sessions are ordinary values: create as many as needed, each with its own
/// worker. Dropping a session cancels its worker without waiting; call
/// [`Session::close`] for an orderly stop. Neither path deletes lock
/// records: crash semantics rely on lease expiry, so records of a vanished
/// session simply expire.
pub struct Session {
    store: Arc<dyn LockStore>,
    identity: Arc<dyn HostIdentity>,
    technique: Arc<VersionLease>,
    refresher: Arc<Refresher>,
}

impl Session {
    /// Create a session over `store` with the default host identity and
    /// clock. Must be called within a tokio runtime; the refresh worker is
    /// spawned here.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self::with_sources(
            store,
            Arc::new(ProcessIdentity::new()),
            Arc::new(TokioClock::default()),
        )
    }

    /// Create a session with injected identity and clock sources.
    pub fn with_sources(
        store: Arc<dyn LockStore>,
        identity: Arc<dyn HostIdentity>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let technique = Arc::new(VersionLease::new(store.clone(), identity.clone(), clock));
        let refresher = Arc::new(Refresher::spawn(technique.clone()));
        Self {
            store,
            identity,
            technique,
            refresher,
        }
    }

    /// Name of the table this session is bound to.
    pub fn table(&self) -> &str {
        self.store.table()
    }

    /// Create a free handle for `name` with the default configuration
    /// (20 s lease, 5 s refresh, unbounded acquire).
    pub fn create_lock(&self, name: impl Into<String>) -> LockHandle {
        self.create_lock_with(name, LockConfig::default())
    }

    /// Create a free handle for `name` with explicit tuning.
    pub fn create_lock_with(&self, name: impl Into<String>, config: LockConfig) -> LockHandle {
        LockHandle::new(
            name.into(),
            self.store.table().to_string(),
            config.normalized(),
            self.technique.clone(),
            self.refresher.clone(),
        )
    }

    /// Reconstruct a held handle from a serialized lock.
    ///
    /// The blob's version is proven current by rotating it with a
    /// version-predicated write; the returned handle is already held and
    /// registered with this session's refresh worker. Fails with
    /// [`LockError::MalformedToken`] on an unparseable blob,
    /// [`LockError::WrongTable`] when the blob names another table, and
    /// [`LockError::AlreadyInUse`] when the lock was stolen, released, or
    /// refreshed since serialization, including by a previous deserialization
    /// of the same blob.
    pub async fn deserialize_lock(&self, blob: &str) -> Result<LockHandle, LockError> {
        let parsed: SerializedLock =
            serde_json::from_str(blob).map_err(|err| LockError::MalformedToken {
                reason: err.to_string(),
            })?;
        if parsed.table != self.store.table() {
            return WrongTableSnafu {
                blob_table: parsed.table,
                session_table: self.store.table().to_string(),
            }
            .fail();
        }

        let config = LockConfig {
            lease_secs: parsed.lease,
            refresh_period_secs: parsed.refresh_period,
            ..LockConfig::default()
        };
        let handle = self.create_lock_with(parsed.name.clone(), config);

        let version = self.identity.new_version();
        let record = LockRecord {
            lease_duration: parsed.lease.max(1),
            version_number: version.clone(),
            host_identifier: self.identity.host_id(),
        };
        match self
            .store
            .put_if_version(&parsed.name, record, &parsed.version)
            .await
        {
            Ok(()) => {
                handle.adopt_held(version);
                info!(key = %parsed.name, table = %self.store.table(), "lock adopted from serialized transfer");
                Ok(handle)
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(key = %parsed.name, "serialized lock no longer current");
                AlreadyInUseSnafu { name: parsed.name }.fail()
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stop the refresh worker and wait for it to wind down. Held records
    /// are left to expire naturally.
    pub async fn close(self) {
        self.refresher.shutdown().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.refresher.cancel();
    }
}

/// Convenience factory: a session over a DynamoDB-backed table, with
/// credentials resolved from the ambient environment.
///
/// Sessions are never cached globally; each call builds a fresh one, because
/// every session owns a background worker whose lifetime belongs to the
/// caller.
pub async fn get_session(table: impl Into<String>) -> Session {
    Session::new(DynamoLockStore::from_env(table).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLockStore;

    #[tokio::test]
    async fn create_lock_uses_defaults() {
        let session = Session::new(InMemoryLockStore::new("locks"));
        let handle = session.create_lock("job");
        assert_eq!(handle.name(), "job");
        assert_eq!(handle.lease_duration().as_secs(), 20);
        assert!(!handle.is_held());
        session.close().await;
    }

    #[tokio::test]
    async fn deserialize_rejects_garbage() {
        let session = Session::new(InMemoryLockStore::new("locks"));

        let result = session.deserialize_lock("not json").await;
        assert!(matches!(result, Err(LockError::MalformedToken { .. })));

        let result = session.deserialize_lock(r#"{"table":"locks"}"#).await;
        assert!(matches!(result, Err(LockError::MalformedToken { .. })));

        session.close().await;
    }

    #[tokio::test]
    async fn deserialize_rejects_unknown_fields() {
        let session = Session::new(InMemoryLockStore::new("locks"));
        let blob = serde_json::json!({
            "table": "locks",
            "name": "job",
            "version": "v",
            "lease": 20,
            "refresh_period": 5,
            "extra": true,
        })
        .to_string();

        let result = session.deserialize_lock(&blob).await;
        assert!(matches!(result, Err(LockError::MalformedToken { .. })));
        session.close().await;
    }

    #[tokio::test]
    async fn deserialize_rejects_foreign_table() {
        let session = Session::new(InMemoryLockStore::new("locks"));
        let blob = serde_json::json!({
            "table": "other-table",
            "name": "job",
            "version": "v",
            "lease": 20,
            "refresh_period": 5,
        })
        .to_string();

        let result = session.deserialize_lock(&blob).await;
        assert!(matches!(result, Err(LockError::WrongTable { .. })));
        session.close().await;
    }

    #[tokio::test]
    async fn deserialize_of_stale_version_is_already_in_use() {
        let store = InMemoryLockStore::new("locks");
        let session = Session::new(store.clone());

        let handle = session.create_lock("job");
        handle.acquire().await.unwrap();

        // blob names a token the store has already moved past
        let blob = serde_json::json!({
            "table": "locks",
            "name": "job",
            "version": "long-gone",
            "lease": 20,
            "refresh_period": 5,
        })
        .to_string();

        let result = session.deserialize_lock(&blob).await;
        assert!(matches!(result, Err(LockError::AlreadyInUse { .. })));
        session.close().await;
    }
}

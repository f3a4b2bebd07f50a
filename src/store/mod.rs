//! Store adapters: the narrow capability the lock protocol needs from a
//! backing table.
//!
//! A lock table maps a lock name to a single [`LockRecord`]. The protocol
//! only ever needs four operations against it, all conditional on the state
//! of that one record; no multi-key transactions, no scans. Anything that can
//! provide strongly consistent, linearizable conditional writes on a single
//! key can implement [`LockStore`].

mod dynamodb;
mod memory;

use async_trait::async_trait;

pub use dynamodb::{DynamoLockStore, TableControl};
pub use memory::InMemoryLockStore;

use crate::error::StoreError;

/// The on-store lock entry.
///
/// A lock name is held iff a record exists for it; absence means free. The
/// `version_number` is the fencing token: it is rotated on every write, and
/// the value observed by a reader is the only legitimate predicate for that
/// reader's subsequent conditional writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    /// Advertised lease window in whole seconds. Other clients must wait at
    /// least this long before concluding the holder is dead.
    pub lease_duration: u64,
    /// Fencing token; a fresh unique value on every write.
    pub version_number: String,
    /// Diagnostic only; never used for correctness decisions.
    pub host_identifier: String,
}

/// Conditional-write capability over one lock table.
///
/// Implementations must be safe for concurrent use and must back all four
/// operations with linearizable conditional writes on a single key. Transient
/// transport failures are retried inside the adapter within a bounded budget
/// and then surfaced as [`StoreError::Transient`]; conditional conflicts are
/// returned immediately as [`StoreError::Conflict`] and are never retried
/// here, because the protocol layer treats them as signals.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Name of the table this adapter is bound to.
    fn table(&self) -> &str;

    /// Write `record` under `key` only if no record exists for `key`.
    async fn put_if_absent(&self, key: &str, record: LockRecord) -> Result<(), StoreError>;

    /// Write `record` under `key` only if the stored record's version equals
    /// `expected_version`. Fails with `Conflict` on mismatch or absence.
    async fn put_if_version(
        &self,
        key: &str,
        record: LockRecord,
        expected_version: &str,
    ) -> Result<(), StoreError>;

    /// Delete the record under `key` only if its version equals
    /// `expected_version`. Fails with `Conflict` on mismatch or absence.
    async fn delete_if_version(&self, key: &str, expected_version: &str) -> Result<(), StoreError>;

    /// Strongly consistent read of the record under `key`.
    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError>;
}

#[async_trait]
impl<T: LockStore + ?Sized> LockStore for std::sync::Arc<T> {
    fn table(&self) -> &str {
        (**self).table()
    }

    async fn put_if_absent(&self, key: &str, record: LockRecord) -> Result<(), StoreError> {
        (**self).put_if_absent(key, record).await
    }

    async fn put_if_version(
        &self,
        key: &str,
        record: LockRecord,
        expected_version: &str,
    ) -> Result<(), StoreError> {
        (**self).put_if_version(key, record, expected_version).await
    }

    async fn delete_if_version(&self, key: &str, expected_version: &str) -> Result<(), StoreError> {
        (**self).delete_if_version(key, expected_version).await
    }

    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        (**self).get(key).await
    }
}

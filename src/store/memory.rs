//! In-memory lock store for tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{ConflictSnafu, StoreError};
use crate::store::{LockRecord, LockStore};

/// Deterministic in-memory implementation of [`LockStore`].
///
/// Records live in a `HashMap` behind a single mutex, which trivially makes
/// every conditional write linearizable. No persistence, no transients; the
/// behavior mirrors the production backend minus the network.
pub struct InMemoryLockStore {
    table: String,
    records: Mutex<HashMap<String, LockRecord>>,
}

impl InMemoryLockStore {
    /// Create an empty store posing as table `table`.
    pub fn new(table: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            table: table.into(),
            records: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn put_if_absent(&self, key: &str, record: LockRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(key) {
            return ConflictSnafu { key }.fail();
        }
        records.insert(key.to_string(), record);
        Ok(())
    }

    async fn put_if_version(
        &self,
        key: &str,
        record: LockRecord,
        expected_version: &str,
    ) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        match records.get(key) {
            Some(existing) if existing.version_number == expected_version => {
                records.insert(key.to_string(), record);
                Ok(())
            }
            _ => ConflictSnafu { key }.fail(),
        }
    }

    async fn delete_if_version(&self, key: &str, expected_version: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        match records.get(key) {
            Some(existing) if existing.version_number == expected_version => {
                records.remove(key);
                Ok(())
            }
            _ => ConflictSnafu { key }.fail(),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records.get(key).cloned())
    }
}

//! Two workers contending for one lock.
//!
//! Each worker holds the lock longer than its advertised lease; the
//! session's background refresher keeps the record alive while the worker is
//! busy. Runs against the in-memory store, so no AWS credentials are needed;
//! swap in `get_session("table")` for the real thing.
//!
//! ```bash
//! cargo run --example basic
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasehold::{InMemoryLockStore, LockConfig, Session};

async fn busy_worker(name: &'static str, session: Arc<Session>) -> Result<()> {
    // refresh well inside the retry interval (lease / 2), so a waiting
    // worker always sees a rotated token while we are alive
    let lock = session.create_lock_with(
        "shared-resource",
        LockConfig {
            lease_secs: 8,
            refresh_period_secs: 2,
            ..LockConfig::default()
        },
    );
    lock.with(|| async {
        info!(worker = name, "acquired the lock");
        // longer than the lease; only the refresher keeps us the holder
        tokio::time::sleep(Duration::from_secs(12)).await;
        info!(worker = name, "done working");
    })
    .await?;
    info!(worker = name, "released the lock");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();

    let store = InMemoryLockStore::new("demo-locks");
    let session = Arc::new(Session::new(store));

    let first = tokio::spawn(busy_worker("first", session.clone()));
    let second = tokio::spawn(busy_worker("second", session.clone()));
    first.await??;
    second.await??;

    match Arc::try_unwrap(session) {
        Ok(session) => session.close().await,
        Err(_) => unreachable!("workers have finished"),
    }
    Ok(())
}

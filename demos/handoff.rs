//! Passing a held lock between sessions as a string.
//!
//! A pipeline of workers operates on one protected resource in turn. Instead
//! of each worker acquiring the lock from scratch, the current holder
//! serializes its lock and hands the blob to the next worker, which redeems
//! it without the resource ever becoming stealable in between.
//!
//! ```bash
//! cargo run --example handoff
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasehold::{InMemoryLockStore, Session};

const WORKERS: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();

    let store = InMemoryLockStore::new("demo-locks");

    // each stage gets its own session, as if it lived in its own process
    let mut stages = Vec::new();
    let (feed, mut relay) = mpsc::channel::<String>(1);
    for stage in 0..WORKERS {
        let store = store.clone();
        let (next_feed, next_relay) = mpsc::channel::<String>(1);
        let mut input = relay;
        stages.push(tokio::spawn(async move {
            let session = Session::new(store);
            let blob = input.recv().await.expect("pipeline feed closed");
            let lock = session.deserialize_lock(&blob).await?;
            info!(stage, "adopted the lock, working");

            let blob = lock.serialize().await?;
            info!(stage, "passed the lock on");
            next_feed.send(blob).await.ok();
            session.close().await;
            anyhow::Ok(())
        }));
        relay = next_relay;
    }

    // seed the pipeline with a freshly acquired lock
    let session = Arc::new(Session::new(store));
    let lock = session.create_lock("pipeline");
    lock.acquire().await?;
    info!("acquired the lock, seeding the pipeline");
    feed.send(lock.serialize().await?).await.ok();

    // collect it at the far end and release for real
    let blob = relay.recv().await.expect("pipeline output closed");
    let lock = session.deserialize_lock(&blob).await?;
    lock.release().await?;
    info!("lock came back through {WORKERS} stages and was released");

    for stage in stages {
        stage.await??;
    }
    match Arc::try_unwrap(session) {
        Ok(session) => session.close().await,
        Err(_) => unreachable!("stages have finished"),
    }
    Ok(())
}

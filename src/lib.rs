//! Cooperative distributed locks leased out of a conditional-write document
//! store.
//!
//! `leasehold` issues named, leased, fencing-tokenised locks to cooperating
//! clients across processes, hosts, and short-lived invocations. Lock state
//! is a single record per lock name in one table of a strongly consistent
//! store (DynamoDB in production, an in-memory table for tests). Every write
//! to a record is conditional on the record's current fencing token, so a
//! holder that missed its lease can never clobber the agent that stole from
//! it, and concurrent stealers linearise down to one winner.
//!
//! A [`Session`] binds handles to a table and runs one background worker
//! that refreshes every held lock ahead of its lease. [`LockHandle`]s
//! acquire, release, run scoped bodies, and serialize for handoff to another
//! process; [`Session::deserialize_lock`] proves a transferred token is still
//! current before adopting it.
//!
//! ```ignore
//! use leasehold::get_session;
//!
//! let session = get_session("my-lock-table").await;
//! let lock = session.create_lock("nightly-rollup");
//! lock.with(|| async {
//!     // the record stays refreshed for as long as this body runs
//! })
//! .await?;
//! session.close().await;
//! ```
//!
//! Locking is cooperative: correctness relies on every participant following
//! the lease protocol. There is no enforcement against a client that ignores
//! an expired lease, and no mitigation of cross-host clock drift beyond
//! choosing leases comfortably larger than skew plus latency.

#![warn(missing_docs)]

mod error;
mod handle;
mod identity;
mod refresher;
mod session;
mod store;
mod technique;

pub use error::{LockError, StoreError};
pub use handle::{LockConfig, LockHandle};
pub use identity::{Clock, HostIdentity, ProcessIdentity, TokioClock};
pub use session::{get_session, Session};
pub use store::{DynamoLockStore, InMemoryLockStore, LockRecord, LockStore, TableControl};

//! Error types for lock operations.
//!
//! Two layers, mirroring the adapter/protocol split: [`StoreError`] is what a
//! [`LockStore`](crate::store::LockStore) adapter reports, and [`LockError`]
//! is what callers of a [`LockHandle`](crate::LockHandle) or
//! [`Session`](crate::Session) see. A `Conflict` from the adapter is a
//! protocol signal, not a failure; the protocol layer converts it into a
//! state transition, an `AcquireTimeout`, or an `AlreadyInUse`.

use snafu::Snafu;

/// Errors reported by a lock store adapter.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The conditional predicate of a write did not hold: the record exists
    /// when it must not, is absent when it must exist, or carries a different
    /// version than expected. Never retried by the adapter.
    #[snafu(display("conditional write failed for key '{key}'"))]
    Conflict {
        /// The lock key the write was aimed at.
        key: String,
    },

    /// The store could not be reached, surfaced after the adapter's bounded
    /// transport retry budget is exhausted.
    #[snafu(display("store communication failure: {message}"))]
    Transient {
        /// Description of the underlying transport failure.
        message: String,
    },
}

/// Errors surfaced to lock callers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LockError {
    /// Acquisition exceeded its deadline while the lock stayed continuously
    /// held by another agent.
    #[snafu(display("timed out acquiring lock '{name}' after {waited_secs}s"))]
    AcquireTimeout {
        /// Logical lock name.
        name: String,
        /// Seconds spent waiting before giving up.
        waited_secs: u64,
    },

    /// Deserialization raced with a steal, release, or refresh: the
    /// serialized version is no longer current on the store.
    #[snafu(display("lock '{name}' is already in use"))]
    AlreadyInUse {
        /// Logical lock name.
        name: String,
    },

    /// The serialization blob could not be parsed, is missing required
    /// fields, or carries unknown ones.
    #[snafu(display("serialized lock rejected: {reason}"))]
    MalformedToken {
        /// What the parser objected to.
        reason: String,
    },

    /// A serialized lock was offered to a session bound to a different table.
    #[snafu(display(
        "serialized lock belongs to table '{blob_table}' but this session is bound to '{session_table}'"
    ))]
    WrongTable {
        /// Table named in the blob.
        blob_table: String,
        /// Table this session is bound to.
        session_table: String,
    },

    /// The operation is not valid in the handle's current state, e.g.
    /// acquiring a handle that is already held or serializing one that is
    /// not.
    #[snafu(display("cannot {operation}: {reason}"))]
    IllegalState {
        /// The rejected operation.
        operation: String,
        /// Why the handle's state forbids it.
        reason: String,
    },

    /// Store communication failed after bounded retries.
    #[snafu(context(false), display("store communication failure: {source}"))]
    Transient {
        /// The adapter error.
        source: StoreError,
    },
}

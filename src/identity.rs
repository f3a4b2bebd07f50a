//! Injectable clock and host identity sources.
//!
//! The lock protocol needs three ambient facts: the current time (to pace
//! acquire retries and refresh deadlines), a diagnostic host identifier (to
//! stamp lock records), and a fresh fencing token per write. All three are
//! behind traits so tests can substitute deterministic sources.

use std::time::Duration;

use uuid::Uuid;

/// A monotonic, non-decreasing time source.
///
/// Readings are relative to an arbitrary epoch; only differences between two
/// readings are meaningful. The default implementation is anchored on the
/// tokio clock so paused-time tests stay deterministic.
pub trait Clock: Send + Sync {
    /// Elapsed time since the clock's epoch. Never decreases within a
    /// process.
    fn now(&self) -> Duration;
}

/// Default [`Clock`] anchored at construction time.
#[derive(Debug)]
pub struct TokioClock {
    anchor: tokio::time::Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self {
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Duration {
        self.anchor.elapsed()
    }
}

/// Source of the per-process host identifier and fresh fencing tokens.
pub trait HostIdentity: Send + Sync {
    /// A stable diagnostic string for this process. Stored on lock records
    /// so an operator can see who holds what; correctness never depends on
    /// it, nor on its uniqueness.
    fn host_id(&self) -> String;

    /// A fresh globally-unique fencing token. Every write to a lock record
    /// carries a new one.
    fn new_version(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Default [`HostIdentity`] using the machine hostname.
#[derive(Debug)]
pub struct ProcessIdentity {
    host: String,
}

impl ProcessIdentity {
    /// Resolve the hostname once; fall back to a fixed marker when the
    /// platform cannot report one.
    pub fn new() -> Self {
        let host = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self { host }
    }
}

impl Default for ProcessIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIdentity for ProcessIdentity {
    fn host_id(&self) -> String {
        self.host.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clock_is_non_decreasing() {
        let clock = TokioClock::default();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn versions_are_unique() {
        let identity = ProcessIdentity::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(identity.new_version()));
        }
    }

    #[test]
    fn host_id_is_stable() {
        let identity = ProcessIdentity::new();
        assert_eq!(identity.host_id(), identity.host_id());
        assert!(!identity.host_id().is_empty());
    }
}

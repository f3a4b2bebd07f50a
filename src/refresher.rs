//! Background refresh worker.
//!
//! One task per session keeps every held lock alive: each registered entry is
//! refreshed on its own cadence, strictly shorter than the advertised lease.
//! The task owns its entry list exclusively; handles reach it through a
//! command channel, so there is no shared queue lock and no ownership cycle
//! between session and worker. Entries hold only a weak reference to handle
//! state: a dropped handle stops being refreshed on its next due date, and
//! its record is left to expire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::handle::LockState;
use crate::technique::{RefreshOutcome, VersionLease};

enum Command {
    Register {
        id: u64,
        state: Weak<LockState>,
        lease_secs: u64,
        period: Duration,
    },
    Deregister {
        id: u64,
        ack: Option<oneshot::Sender<()>>,
    },
}

struct RefreshEntry {
    id: u64,
    state: Weak<LockState>,
    lease_secs: u64,
    period: Duration,
    next_at: Instant,
}

/// Handle to a session's background refresh task.
pub(crate) struct Refresher {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Refresher {
    /// Spawn the worker. Must be called within a tokio runtime.
    pub(crate) fn spawn(technique: Arc<VersionLease>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_refresh_loop(technique, receiver, cancel.clone()));
        Self {
            commands,
            cancel,
            task: Mutex::new(Some(task)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a registration id for a new handle.
    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start refreshing a held lock every `period` until deregistered.
    pub(crate) fn register(
        &self,
        id: u64,
        state: Weak<LockState>,
        lease_secs: u64,
        period: Duration,
    ) {
        // a send can only fail once the worker is gone, at which point the
        // record is already on its way to expiry
        let _ = self.commands.send(Command::Register {
            id,
            state,
            lease_secs,
            period,
        });
    }

    /// Stop refreshing the entry registered under `id`.
    pub(crate) fn deregister(&self, id: u64) {
        let _ = self.commands.send(Command::Deregister { id, ack: None });
    }

    /// Stop refreshing the entry registered under `id` and wait until the
    /// worker has dropped it.
    ///
    /// Commands are only processed between refresh passes, so once the ack
    /// arrives no refresh of this entry can still be in flight. A worker
    /// that is already gone counts as done.
    pub(crate) async fn deregister_awaited(&self, id: u64) {
        let (ack, done) = oneshot::channel();
        if self
            .commands
            .send(Command::Deregister { id, ack: Some(ack) })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Cancel the worker without waiting for it.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the worker and wait for it to wind down.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Refresher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_refresh_loop(
    technique: Arc<VersionLease>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    let mut entries: Vec<RefreshEntry> = Vec::new();
    debug!("refresher started");

    loop {
        let next_deadline = entries.iter().map(|entry| entry.next_at).min();
        tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Register { id, state, lease_secs, period }) => {
                    entries.push(RefreshEntry {
                        id,
                        state,
                        lease_secs,
                        period,
                        next_at: Instant::now() + period,
                    });
                }
                Some(Command::Deregister { id, ack }) => {
                    entries.retain(|entry| entry.id != id);
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                if next_deadline.is_some() =>
            {
                refresh_due(&technique, &mut entries).await;
            }
        }
    }

    debug!("refresher stopped");
}

async fn refresh_due(technique: &VersionLease, entries: &mut Vec<RefreshEntry>) {
    let due = Instant::now();
    let mut index = 0;
    while index < entries.len() {
        if entries[index].next_at > due {
            index += 1;
            continue;
        }
        let Some(state) = entries[index].state.upgrade() else {
            entries.remove(index);
            continue;
        };
        let lease_secs = entries[index].lease_secs;
        match technique.refresh(&state, lease_secs).await {
            RefreshOutcome::Refreshed => {
                let period = entries[index].period;
                entries[index].next_at = Instant::now() + period;
                index += 1;
            }
            RefreshOutcome::Lost => {
                entries.remove(index);
            }
        }
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::model::RunId;
use crate::subscription::CancelSignal;

/// Lifecycle of one push connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Opening,
    Streaming,
    Closed,
}

/// Registry entry for the single live push connection of a run.
pub(crate) struct StreamConnection {
    pub(crate) generation: u64,
    pub(crate) cancel: CancelSignal,
    pub(crate) state: watch::Receiver<ConnectionState>,
}

/// State of the newest connection task of a run, kept until that task has
/// closed its stream, even after the run was unsubscribed or closed.
struct LatestConnection {
    generation: u64,
    state: watch::Receiver<ConnectionState>,
}

/// Map of run id to its active push connection.
///
/// Holds at most one connection per run. Entries carry a generation number so
/// a connection that was already replaced can never deregister its successor.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    slots: Arc<DashMap<RunId, StreamConnection>>,
    latest: Arc<DashMap<RunId, LatestConnection>>,
    generations: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers `connection`, closing whatever was registered for the run.
    ///
    /// Returns the state of the run's previous connection task, whether it was
    /// displaced here or already unsubscribed, until that task reports
    /// [`ConnectionState::Closed`]. The new task must not open before then.
    pub(crate) fn replace(
        &self,
        run_id: RunId,
        connection: StreamConnection,
    ) -> Option<watch::Receiver<ConnectionState>> {
        let latest = LatestConnection {
            generation: connection.generation,
            state: connection.state.clone(),
        };
        let previous = match self.latest.entry(run_id.clone()) {
            Entry::Occupied(mut entry) => Some(std::mem::replace(entry.get_mut(), latest)),
            Entry::Vacant(entry) => {
                entry.insert(latest);
                None
            }
        };
        if let Some(displaced) = self.slots.insert(run_id, connection) {
            displaced.cancel.cancel();
        }
        previous
            .map(|previous| previous.state)
            .filter(|state| *state.borrow() != ConnectionState::Closed)
    }

    /// Forgets the connection task of `generation` once it has closed.
    pub(crate) fn retire(&self, run_id: &RunId, generation: u64) {
        self.latest
            .remove_if(run_id, |_, latest| latest.generation == generation);
    }

    /// Removes the entry for `run_id` only if it still belongs to `generation`.
    pub(crate) fn deregister(&self, run_id: &RunId, generation: u64) -> bool {
        self.slots
            .remove_if(run_id, |_, connection| connection.generation == generation)
            .is_some()
    }

    /// Closes and removes the connection for `run_id`, if any.
    pub fn close(&self, run_id: &RunId) -> bool {
        match self.slots.remove(run_id) {
            Some((_, connection)) => {
                connection.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Closes every registered connection and returns how many there were.
    pub fn close_all(&self) -> usize {
        let run_ids: Vec<RunId> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        run_ids.iter().filter(|run_id| self.close(run_id)).count()
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.slots.contains_key(run_id)
    }

    pub fn state(&self, run_id: &RunId) -> Option<ConnectionState> {
        self.slots.get(run_id).map(|connection| *connection.state.borrow())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

use std::sync::Arc;

use dashmap::DashSet;

use crate::model::RunId;

/// Run ids known to have reached a terminal state.
///
/// Append-only; ids are never removed. Clones share the same set.
#[derive(Clone, Debug, Default)]
pub struct TerminalRunCache {
    ids: Arc<DashSet<RunId>>,
}

impl TerminalRunCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `run_id` as terminal. Returns false if it already was.
    pub fn mark_terminal(&self, run_id: &RunId) -> bool {
        let inserted = self.ids.insert(run_id.clone());
        if inserted {
            tracing::debug!(run_id = %run_id, event = "run.marked_terminal", "run marked terminal");
        }
        inserted
    }

    pub fn is_terminal(&self, run_id: &RunId) -> bool {
        self.ids.contains(run_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

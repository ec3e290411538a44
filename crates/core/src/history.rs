//! Bounded per-source snapshot history.

use monitor_api::Snapshot;
use std::collections::VecDeque;
use std::sync::Arc;

/// Rolling window of the most recent snapshots, oldest first.
#[derive(Debug, Clone)]
pub struct SnapshotHistory {
    capacity: usize,
    entries: VecDeque<Arc<Snapshot>>,
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append, evicting the oldest entry once full.
    pub fn push(&mut self, snapshot: Arc<Snapshot>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&Arc<Snapshot>> {
        self.entries.back()
    }

    /// Cheap copy of the window, oldest first.
    pub fn snapshots(&self) -> Vec<Arc<Snapshot>> {
        self.entries.iter().cloned().collect()
    }
}

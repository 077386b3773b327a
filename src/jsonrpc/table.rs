use std::collections::HashMap;

use super::error::{RpcError, RpcResult};
use super::id::CorrelationId;
use super::work::WorkItem;

/// Open work items keyed by correlation id.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<CorrelationId, WorkItem>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `work` under `id`. An id can only be open once.
    pub fn open(&mut self, id: CorrelationId, work: WorkItem) -> RpcResult<()> {
        if self.entries.contains_key(&id) {
            return Err(RpcError::DuplicateId(id));
        }
        self.entries.insert(id, work);
        Ok(())
    }

    pub fn get_mut(&mut self, id: CorrelationId) -> Option<&mut WorkItem> {
        self.entries.get_mut(&id)
    }

    /// Remove and return the entry for `id`.
    pub fn close_and_get(&mut self, id: CorrelationId) -> Option<WorkItem> {
        self.entries.remove(&id)
    }

    /// Remove every entry. The caller must `finish()` each returned item.
    pub fn drain_all(&mut self) -> Vec<WorkItem> {
        self.entries.drain().map(|(_, work)| work).collect()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open ids in ascending order.
    pub fn ids(&self) -> Vec<CorrelationId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }
}

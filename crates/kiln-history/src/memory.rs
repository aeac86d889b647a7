use crate::store::{HistoryResult, HistoryStore, HistoryStoreError};
use crate::types::{GENESIS_HASH, HistoryEntry, HistoryRecord, now_ms};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
pub(crate) struct MemoryState {
    pub records: Vec<HistoryRecord>,
}

impl MemoryState {
    fn next_record(&self, turn: u32, entry: HistoryEntry) -> HistoryResult<HistoryRecord> {
        let prev_hash = self
            .records
            .last()
            .map(|record| record.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let sequence_no = self.records.len() as u64 + 1;
        // Timestamps never go backwards even if the wall clock does.
        let timestamp_ms = self
            .records
            .last()
            .map_or_else(now_ms, |last| now_ms().max(last.timestamp_ms));
        Ok(HistoryRecord::new(
            sequence_no,
            turn,
            timestamp_ms,
            entry,
            prev_hash,
        )?)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryHistoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append_sync(&self, turn: u32, entry: HistoryEntry) -> HistoryResult<HistoryRecord> {
        self.append_with(turn, entry, |_| Ok(()))
    }

    /// Builds the next record and commits it only if `persist` succeeds, all
    /// under one lock, so a failed write never advances the chain.
    pub(crate) fn append_with<F>(&self, turn: u32, entry: HistoryEntry, persist: F) -> HistoryResult<HistoryRecord>
    where
        F: FnOnce(&HistoryRecord) -> HistoryResult<()>,
    {
        let mut state = self.lock()?;
        let record = state.next_record(turn, entry)?;
        persist(&record)?;
        state.records.push(record.clone());
        Ok(record)
    }

    pub(crate) fn snapshot(&self) -> HistoryResult<Vec<HistoryRecord>> {
        Ok(self.lock()?.records.clone())
    }

    fn lock(&self) -> HistoryResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.inner
            .lock()
            .map_err(|_| HistoryStoreError::Backend("history mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, turn: u32, entry: HistoryEntry) -> HistoryResult<HistoryRecord> {
        self.append_sync(turn, entry)
    }

    async fn records(&self) -> HistoryResult<Vec<HistoryRecord>> {
        self.snapshot()
    }

    async fn len(&self) -> HistoryResult<usize> {
        Ok(self.lock()?.records.len())
    }

    async fn flush(&self) -> HistoryResult<()> {
        Ok(())
    }
}

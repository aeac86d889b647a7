use crate::types::{HistoryEntry, HistoryRecord};

#[derive(Debug, thiserror::Error)]
pub enum HistoryStoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("integrity check failed at record {sequence_no}: {reason}")]
    Integrity { sequence_no: u64, reason: String },

    #[error("backend failure: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for HistoryStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type HistoryResult<T> = Result<T, HistoryStoreError>;

/// Append-only, totally ordered session history.
///
/// Records are never removed or rewritten; the sequence after any append is a
/// prefix-extension of the sequence before it.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, turn: u32, entry: HistoryEntry) -> HistoryResult<HistoryRecord>;

    async fn records(&self) -> HistoryResult<Vec<HistoryRecord>>;

    async fn len(&self) -> HistoryResult<usize>;

    /// Makes every appended record durable.
    async fn flush(&self) -> HistoryResult<()>;
}

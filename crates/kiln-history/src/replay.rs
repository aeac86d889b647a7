use crate::store::{HistoryResult, HistoryStoreError};
use crate::types::{GENESIS_HASH, HistoryRecord};
use std::fs;
use std::path::Path;

/// Reads a JSONL history file and verifies it before returning the records.
pub fn load_history<P: AsRef<Path>>(path: P) -> HistoryResult<Vec<HistoryRecord>> {
    let raw = fs::read_to_string(path.as_ref())
        .map_err(|err| HistoryStoreError::Backend(format!("read history file failed: {err}")))?;

    let mut records = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<HistoryRecord>(line).map_err(|err| {
            HistoryStoreError::Serialization(format!("line {}: {err}", line_no + 1))
        })?;
        records.push(record);
    }

    verify_chain(&records)?;
    Ok(records)
}

/// Checks sequence contiguity and the hash chain.
pub fn verify_chain(records: &[HistoryRecord]) -> HistoryResult<()> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for (index, record) in records.iter().enumerate() {
        let expected_seq = index as u64 + 1;
        if record.sequence_no != expected_seq {
            return Err(HistoryStoreError::Integrity {
                sequence_no: record.sequence_no,
                reason: format!("expected sequence number {expected_seq}"),
            });
        }
        if record.prev_hash != expected_prev {
            return Err(HistoryStoreError::Integrity {
                sequence_no: record.sequence_no,
                reason: "previous hash does not match".to_string(),
            });
        }
        if record.computed_hash()? != record.hash {
            return Err(HistoryStoreError::Integrity {
                sequence_no: record.sequence_no,
                reason: "content hash does not match".to_string(),
            });
        }
        expected_prev = record.hash.clone();
    }
    Ok(())
}

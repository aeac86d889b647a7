use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// `prev_hash` of the first record in a history.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Outcome of one tool call, recorded verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    SystemPrompt {
        content: String,
    },
    UserInstruction {
        content: String,
    },
    ModelResponse {
        content: String,
    },
    ToolCallResult {
        call_index: usize,
        tool: String,
        arguments: Value,
        result: ToolResult,
    },
    /// Closes a session; `status` is the terminal status label.
    SessionMarker {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl HistoryEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SystemPrompt { .. } => "system_prompt",
            Self::UserInstruction { .. } => "user_instruction",
            Self::ModelResponse { .. } => "model_response",
            Self::ToolCallResult { .. } => "tool_call_result",
            Self::SessionMarker { .. } => "session_marker",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub sequence_no: u64,
    pub turn: u32,
    pub timestamp_ms: u64,
    pub entry: HistoryEntry,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Serialize)]
struct RecordBody<'a> {
    sequence_no: u64,
    turn: u32,
    timestamp_ms: u64,
    entry: &'a HistoryEntry,
    prev_hash: &'a str,
}

impl HistoryRecord {
    pub fn new(
        sequence_no: u64,
        turn: u32,
        timestamp_ms: u64,
        entry: HistoryEntry,
        prev_hash: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let prev_hash = prev_hash.into();
        let hash = content_hash(sequence_no, turn, timestamp_ms, &entry, &prev_hash)?;
        Ok(Self {
            sequence_no,
            turn,
            timestamp_ms,
            entry,
            prev_hash,
            hash,
        })
    }

    /// Recomputes the hash over the record body.
    pub fn computed_hash(&self) -> Result<String, serde_json::Error> {
        content_hash(
            self.sequence_no,
            self.turn,
            self.timestamp_ms,
            &self.entry,
            &self.prev_hash,
        )
    }
}

fn content_hash(
    sequence_no: u64,
    turn: u32,
    timestamp_ms: u64,
    entry: &HistoryEntry,
    prev_hash: &str,
) -> Result<String, serde_json::Error> {
    let body = serde_json::to_vec(&RecordBody {
        sequence_no,
        turn,
        timestamp_ms,
        entry,
        prev_hash,
    })?;
    Ok(blake3::hash(&body).to_hex().to_string())
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#![allow(dead_code)]

use async_trait::async_trait;
use kiln_agent::{SessionConfig, Session, STATE_DIR};
use kiln_history::{HistoryEntry, HistoryRecord, MemoryHistoryStore};
use kiln_llm::{Client, ModelError, ModelRequest, ModelResponse, ProviderAdapter, RetryPolicy};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const MODEL: &str = "test-model";

/// Replays queued responses in order and records every request.
#[derive(Clone, Default)]
pub struct SequenceAdapter {
    pub responses: Arc<Mutex<VecDeque<Result<String, ModelError>>>>,
    pub requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl SequenceAdapter {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_results(responses.into_iter().map(|text| Ok(text.into())))
    }

    pub fn with_results(results: impl IntoIterator<Item = Result<String, ModelError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(results.into_iter().collect())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests mutex").len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests mutex").clone()
    }
}

#[async_trait]
impl ProviderAdapter for SequenceAdapter {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests
            .lock()
            .expect("requests mutex")
            .push(request.clone());
        let next = self
            .responses
            .lock()
            .expect("responses mutex")
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::InvalidRequest("no response queued".to_string())));
        next.map(|text| ModelResponse::new("sequence", request.model.clone(), text))
    }
}

pub fn client(adapter: &SequenceAdapter) -> Client {
    let mut client = Client::new(RetryPolicy::no_retry(), Duration::from_secs(5));
    client.register_provider(Arc::new(adapter.clone()));
    client
}

pub fn workspace() -> TempDir {
    let tmp = tempfile::tempdir().expect("tempdir should be created");
    std::fs::create_dir_all(tmp.path().join(STATE_DIR)).expect("state dir");
    std::fs::write(tmp.path().join(".kiln/config.json"), "{}").expect("config file");
    std::fs::write(tmp.path().join(".kiln/instruction.md"), "Build a todo app").expect("instruction");
    tmp
}

pub fn config(tmp: &TempDir) -> SessionConfig {
    SessionConfig {
        working_dir: tmp.path().to_path_buf(),
        model: MODEL.to_string(),
        ..SessionConfig::default()
    }
}

pub fn session(config: SessionConfig, adapter: &SequenceAdapter) -> Session {
    Session::new(config, client(adapter), Arc::new(MemoryHistoryStore::new()))
        .expect("session should build")
}

pub fn tool_call(tool: &str, arguments: serde_json::Value) -> String {
    format!(
        "<tool_call>{}</tool_call>",
        serde_json::json!({ "tool": tool, "arguments": arguments })
    )
}

pub fn tool_results(history: &[HistoryRecord]) -> Vec<(String, bool, Option<String>)> {
    history
        .iter()
        .filter_map(|record| match &record.entry {
            HistoryEntry::ToolCallResult { tool, result, .. } => {
                Some((tool.clone(), result.ok, result.error.clone()))
            }
            _ => None,
        })
        .collect()
}

pub fn kinds(history: &[HistoryRecord]) -> Vec<&'static str> {
    history.iter().map(|record| record.entry.kind()).collect()
}

use crate::AgentError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type EventData = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    TurnStart,
    ModelResponse,
    ToolCallStart,
    ToolCallEnd,
    ProtocolError,
    NoOp,
    TurnLimit,
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub timestamp_ms: u64,
    pub session_id: String,
    pub turn: u32,
    pub data: EventData,
}

impl SessionEvent {
    pub fn new(kind: EventKind, session_id: impl Into<String>, turn: u32, data: EventData) -> Self {
        Self {
            kind,
            timestamp_ms: kiln_history::now_ms(),
            session_id: session_id.into(),
            turn,
            data,
        }
    }
}

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: SessionEvent) -> Result<(), AgentError>;
}

#[derive(Default)]
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: SessionEvent) -> Result<(), AgentError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct BufferedEventEmitter {
    inner: Arc<Mutex<Vec<SessionEvent>>>,
}

impl BufferedEventEmitter {
    pub fn snapshot(&self) -> Vec<SessionEvent> {
        self.inner
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.snapshot().into_iter().map(|event| event.kind).collect()
    }
}

impl EventEmitter for BufferedEventEmitter {
    fn emit(&self, event: SessionEvent) -> Result<(), AgentError> {
        let mut events = self
            .inner
            .lock()
            .map_err(|_| AgentError::Events("buffered emitter mutex poisoned".to_string()))?;
        events.push(event);
        Ok(())
    }
}

/// Forwards events to an unbounded channel, e.g. for streaming to stdout.
pub struct ChannelEventEmitter {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelEventEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventEmitter for ChannelEventEmitter {
    fn emit(&self, event: SessionEvent) -> Result<(), AgentError> {
        self.sender
            .send(event)
            .map_err(|_| AgentError::Events("event receiver dropped".to_string()))
    }
}

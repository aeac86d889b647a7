use kiln_history::{HistoryEntry, HistoryRecord};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// How a finished session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Terminated,
    MaxTurnsReached,
    FatalHalt,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminated => "TERMINATED",
            Self::MaxTurnsReached => "MAX_TURNS_REACHED",
            Self::FatalHalt => "FATAL_HALT",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// `Terminated` and `MaxTurnsReached` both count as a clean end.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Terminated | Self::MaxTurnsReached)
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    Running,
    Ended(SessionStatus),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Running => "RUNNING",
            Self::Ended(status) => status.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended(_))
    }

    /// Terminal states are absorbing.
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        match (self, next) {
            (Self::Init, Self::Running) => true,
            (Self::Running, Self::Ended(_)) => true,
            (Self::Init, Self::Ended(_)) => true,
            _ => false,
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionResult {
    pub session_id: String,
    pub status: SessionStatus,
    /// Model queries that counted toward the turn budget.
    pub turn_count: u32,
    pub history: Vec<HistoryRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionResult {
    pub fn tool_results(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.history
            .iter()
            .filter(|record| matches!(record.entry, HistoryEntry::ToolCallResult { .. }))
    }
}

use thiserror::Error;

use crate::schema::ArgType;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required argument '{0}'")]
    MissingArgument(String),

    #[error("argument '{name}' must be of type {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: ArgType,
        actual: &'static str,
    },

    #[error("unknown argument '{0}'")]
    UnknownArgument(String),

    #[error("tool arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SafetyError {
    #[error("path '{0}' escapes the working directory")]
    PathTraversal(String),

    #[error("path '{0}' is protected and cannot be modified")]
    ProtectedFile(String),

    #[error("invalid path '{0}'")]
    InvalidPath(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("failed to spawn process '{name}': {reason}")]
    SpawnError { name: String, reason: String },

    #[error("process '{name}' did not become ready within {timeout_ms} ms")]
    StartTimeout { name: String, timeout_ms: u64 },

    #[error("no process named '{0}' has been started")]
    UnknownProcess(String),

    #[error("command failed: {0}")]
    Command(String),
}

/// Malformed tool-call envelopes in a model response.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("tool call #{index}: payload is not valid JSON: {reason}")]
    MalformedPayload { index: usize, reason: String },

    #[error("tool call #{index}: missing closing </tool_call> tag")]
    UnterminatedEnvelope { index: usize },

    #[error("tool call #{index}: missing \"tool\" name")]
    MissingToolName { index: usize },

    #[error("tool call #{index}: \"arguments\" must be a JSON object")]
    InvalidArguments { index: usize },
}

/// Everything that can go wrong between resolving a tool call and recording
/// its result. Always recoverable from the loop's point of view unless the
/// session configuration marks the condition as fatal.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("tool '{tool}' timed out after {timeout_ms} ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error("{0}")]
    Execution(String),

    #[error("tool panicked: {0}")]
    Panicked(String),
}

impl ToolError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        Self::Execution(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("session is not in a runnable state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Model(#[from] kiln_llm::ModelError),

    #[error(transparent)]
    History(#[from] kiln_history::HistoryStoreError),

    #[error("event emitter failed: {0}")]
    Events(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tool_message_names_the_tool() {
        let error = ToolError::from(RegistryError::UnknownTool("fs.explode".to_string()));
        assert_eq!(error.to_string(), "unknown tool: fs.explode");
    }

    #[test]
    fn protected_file_message_is_readable() {
        let error = ToolError::from(SafetyError::ProtectedFile(".kiln/config.json".to_string()));
        assert_eq!(
            error.to_string(),
            "path '.kiln/config.json' is protected and cannot be modified"
        );
    }
}

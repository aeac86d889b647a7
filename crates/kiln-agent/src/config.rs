use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_llm::{Client, GeminiAdapter, RetryPolicy, ScriptedAdapter};

use crate::errors::{AgentError, RegistryError, SafetyError, ToolError, ValidationError};
use crate::process::CommandLine;

pub const STATE_DIR: &str = ".kiln";
pub const CONFIG_FILE: &str = ".kiln/config.json";
pub const INSTRUCTION_FILE: &str = ".kiln/instruction.md";
pub const HISTORY_FILE: &str = ".kiln/history.jsonl";
pub const TODO_FILE: &str = ".kiln/todo.json";
pub const PROCESS_LOG_DIR: &str = ".kiln/logs";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Call-time failures that can be promoted to session-fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalCondition {
    UnknownTool,
    MissingArgument,
    TypeMismatch,
    UnknownArgument,
    PathTraversal,
    ProtectedFile,
}

impl FatalCondition {
    pub fn matches(self, error: &ToolError) -> bool {
        matches!(
            (self, error),
            (Self::UnknownTool, ToolError::Registry(RegistryError::UnknownTool(_)))
                | (Self::MissingArgument, ToolError::Validation(ValidationError::MissingArgument(_)))
                | (Self::TypeMismatch, ToolError::Validation(ValidationError::TypeMismatch { .. }))
                | (Self::UnknownArgument, ToolError::Validation(ValidationError::UnknownArgument(_)))
                | (Self::PathTraversal, ToolError::Safety(SafetyError::PathTraversal(_)))
                | (Self::ProtectedFile, ToolError::Safety(SafetyError::ProtectedFile(_)))
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessConfig {
    Http(String),
    Tcp(String),
    Log(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub command: CommandLine,
    pub readiness: Option<ReadinessConfig>,
    pub start_timeout_ms: u64,
    pub health_interval_ms: u64,
    pub log_lines: usize,
    pub env: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "server".to_string(),
            command: CommandLine::new("npm", ["start"]),
            readiness: None,
            start_timeout_ms: 30_000,
            health_interval_ms: 2_000,
            log_lines: 500,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestsConfig {
    pub suites: BTreeMap<String, CommandLine>,
    pub timeout_ms: u64,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            suites: BTreeMap::from([
                ("jest".to_string(), CommandLine::new("npx", ["jest"])),
                (
                    "playwright".to_string(),
                    CommandLine::new("npx", ["playwright", "test"]),
                ),
            ]),
            timeout_ms: 300_000,
        }
    }
}

/// Settings for the `npm.init`, `supertest.init` and `playwright.init`
/// scaffolding tools.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaffoldConfig {
    pub package_name: String,
    pub install_command: CommandLine,
    pub browser_install_command: CommandLine,
    pub timeout_ms: u64,
}

impl Default for ScaffoldConfig {
    fn default() -> Self {
        Self {
            package_name: "kiln-workspace".to_string(),
            install_command: CommandLine::new("npm", ["install"]),
            browser_install_command: CommandLine::new("npx", ["playwright", "install", "chromium"]),
            timeout_ms: 300_000,
        }
    }
}

/// Runtime configuration for one session. Built once, then shared
/// read-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(skip)]
    pub working_dir: PathBuf,
    pub max_turns: u32,
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub scripted_responses: Vec<String>,
    /// `None` registers every built-in tool.
    pub allowed_tools: Option<Vec<String>>,
    pub protected_files: Vec<String>,
    pub model_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub history_window: Option<usize>,
    pub protocol_errors_consume_turn: bool,
    pub max_consecutive_protocol_errors: u32,
    pub fatal_errors: Vec<FatalCondition>,
    pub parallel_tool_calls: bool,
    pub tool_timeout_ms: u64,
    pub tool_output_limit: usize,
    pub server: ServerConfig,
    pub tests: TestsConfig,
    pub scaffold: ScaffoldConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            max_turns: 50,
            provider: "gemini".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key: None,
            base_url: None,
            scripted_responses: Vec::new(),
            allowed_tools: None,
            protected_files: Vec::new(),
            model_timeout_ms: 120_000,
            retry: RetryPolicy::default(),
            history_window: None,
            protocol_errors_consume_turn: true,
            max_consecutive_protocol_errors: 5,
            fatal_errors: Vec::new(),
            parallel_tool_calls: false,
            tool_timeout_ms: 120_000,
            tool_output_limit: 20_000,
            server: ServerConfig::default(),
            tests: TestsConfig::default(),
            scaffold: ScaffoldConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Reads `.kiln/config.json` under `working_dir`; a missing file yields
    /// the defaults.
    pub fn load<P: AsRef<Path>>(working_dir: P) -> Result<Self, AgentError> {
        let working_dir = working_dir.as_ref();
        let path = working_dir.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<SessionConfig>(&raw).map_err(|err| {
                AgentError::InvalidConfiguration(format!("{}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => SessionConfig::default(),
            Err(err) => return Err(err.into()),
        };
        config.working_dir = working_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_turns == 0 {
            return Err(AgentError::InvalidConfiguration(
                "max_turns must be at least 1".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(AgentError::InvalidConfiguration(
                "model must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn is_fatal(&self, error: &ToolError) -> bool {
        self.fatal_errors.iter().any(|condition| condition.matches(error))
    }

    /// Builds the model client for the configured provider.
    pub fn build_client(&self) -> Result<Client, AgentError> {
        let mut client = Client::new(self.retry.clone(), self.model_timeout());
        match self.provider.as_str() {
            "gemini" => {
                let api_key = self
                    .api_key
                    .clone()
                    .or_else(|| std::env::var(API_KEY_ENV).ok())
                    .unwrap_or_default();
                let adapter = match &self.base_url {
                    Some(base_url) => GeminiAdapter::with_base_url(api_key, base_url),
                    None => GeminiAdapter::new(api_key),
                };
                client.register_provider(Arc::new(adapter));
            }
            "scripted" => {
                if self.scripted_responses.is_empty() {
                    return Err(AgentError::InvalidConfiguration(
                        "scripted provider requires scripted_responses".to_string(),
                    ));
                }
                client.register_provider(Arc::new(ScriptedAdapter::new(
                    self.scripted_responses.clone(),
                )));
            }
            other => {
                return Err(AgentError::InvalidConfiguration(format!(
                    "unknown provider '{other}'"
                )));
            }
        }
        Ok(client)
    }
}

/// Reads the natural-language instruction from `.kiln/instruction.md`.
pub fn load_instruction<P: AsRef<Path>>(working_dir: P) -> Result<String, AgentError> {
    let path = working_dir.as_ref().join(INSTRUCTION_FILE);
    let instruction = std::fs::read_to_string(&path).map_err(|err| {
        AgentError::InvalidConfiguration(format!("cannot read {}: {err}", path.display()))
    })?;
    if instruction.trim().is_empty() {
        return Err(AgentError::InvalidConfiguration(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(instruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_config_defaults_are_conservative() {
        let config = SessionConfig::default();
        assert_eq!(config.max_turns, 50);
        assert!(config.protocol_errors_consume_turn);
        assert!(config.fatal_errors.is_empty());
        assert!(!config.parallel_tool_calls);
        assert_eq!(config.history_window, None);
        assert_eq!(config.server.name, "server");
    }

    #[test]
    fn load_reads_partial_config_and_keeps_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        std::fs::create_dir_all(tmp.path().join(STATE_DIR)).expect("state dir");
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            json!({
                "max_turns": 7,
                "provider": "scripted",
                "scripted_responses": ["<terminate/>"],
                "fatal_errors": ["unknown_tool"],
                "server": {"command": "node server.js", "readiness": {"tcp": "127.0.0.1:3000"}},
                "tests": {"suites": {"api": ["npx", "jest", "--runInBand"]}},
                "scaffold": {"install_command": "pnpm install"}
            })
            .to_string(),
        )
        .expect("write config");

        let config = SessionConfig::load(tmp.path()).expect("config should load");
        assert_eq!(config.max_turns, 7);
        assert_eq!(config.fatal_errors, vec![FatalCondition::UnknownTool]);
        assert_eq!(config.server.command, CommandLine::new("node", ["server.js"]));
        assert_eq!(
            config.server.readiness,
            Some(ReadinessConfig::Tcp("127.0.0.1:3000".to_string()))
        );
        assert_eq!(config.server.start_timeout_ms, 30_000);
        assert_eq!(
            config.tests.suites.get("api"),
            Some(&CommandLine::new("npx", ["jest", "--runInBand"]))
        );
        assert_eq!(config.scaffold.install_command, CommandLine::new("pnpm", ["install"]));
        assert_eq!(config.scaffold.package_name, "kiln-workspace");
        assert_eq!(config.working_dir, tmp.path());
        assert!(config.build_client().is_ok());
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let config = SessionConfig::load(tmp.path()).expect("defaults");
        assert_eq!(config.max_turns, 50);
    }

    #[test]
    fn zero_turn_budget_is_rejected() {
        let config = SessionConfig {
            max_turns: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(AgentError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = SessionConfig {
            provider: "carrier-pigeon".to_string(),
            ..SessionConfig::default()
        };
        assert!(config.build_client().is_err());
    }

    #[test]
    fn fatal_condition_matches_only_its_error() {
        let unknown = ToolError::from(RegistryError::UnknownTool("x".to_string()));
        let missing = ToolError::from(ValidationError::MissingArgument("path".to_string()));
        assert!(FatalCondition::UnknownTool.matches(&unknown));
        assert!(!FatalCondition::UnknownTool.matches(&missing));
        assert!(FatalCondition::MissingArgument.matches(&missing));
    }

    #[test]
    fn load_instruction_rejects_empty_file() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        std::fs::create_dir_all(tmp.path().join(STATE_DIR)).expect("state dir");
        std::fs::write(tmp.path().join(INSTRUCTION_FILE), "  \n").expect("write");
        assert!(load_instruction(tmp.path()).is_err());

        std::fs::write(tmp.path().join(INSTRUCTION_FILE), "Build a todo API").expect("write");
        assert_eq!(load_instruction(tmp.path()).expect("instruction"), "Build a todo API");
    }
}

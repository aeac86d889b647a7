use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PROCESS_LOG_DIR, ReadinessConfig, SessionConfig};
use crate::errors::{ProcessError, ToolError};
use crate::process::{ProcessSpec, ReadinessProbe};
use crate::schema::{ArgType, ArgumentSchema};

use super::{
    RegisteredTool, SERVER_LOGS_TOOL, SERVER_START_TOOL, SERVER_STATUS_TOOL, SERVER_STOP_TOOL,
    ToolContext, ToolDefinition,
};

/// Extra time `server.start` gets beyond the readiness deadline, so the
/// supervisor reports the start timeout before the tool timeout fires.
const START_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

pub(super) fn start_tool(config: &SessionConfig) -> RegisteredTool {
    let timeout = Duration::from_millis(config.server.start_timeout_ms) + START_TIMEOUT_MARGIN;
    RegisteredTool {
        definition: ToolDefinition::new(
            SERVER_START_TOOL,
            "Start the configured development server in the background and wait until it is ready.",
            ArgumentSchema::new(),
        )
        .with_timeout(timeout),
        executor: Arc::new(|_input, context| {
            Box::pin(async move {
                let spec = server_spec(&context)?;
                let handle = context.processes.start(&context.config.server.name, spec).await?;
                serde_json::to_value(handle).map_err(|err| ToolError::execution(err.to_string()))
            })
        }),
    }
}

pub(super) fn stop_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            SERVER_STOP_TOOL,
            "Stop the development server. Stopping a server that is not running is a no-op.",
            ArgumentSchema::new(),
        ),
        executor: Arc::new(|_input, context| {
            Box::pin(async move {
                let name = &context.config.server.name;
                let was_running = context.processes.running().await.contains(name);
                context.processes.stop(name).await?;
                Ok(json!({ "name": name, "stopped": was_running }))
            })
        }),
    }
}

pub(super) fn status_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            SERVER_STATUS_TOOL,
            "Report whether the development server is running, its health and recent output.",
            ArgumentSchema::new(),
        ),
        executor: Arc::new(|_input, context| {
            Box::pin(async move {
                let name = &context.config.server.name;
                match context.processes.status(name).await {
                    Ok(status) => Ok(json!({
                        "name": status.name,
                        "running": status.running,
                        "pid": status.pid,
                        "exit_code": status.exit_code,
                        "started_at_ms": status.started_at_ms,
                        "health": status.last_health,
                        "recent_log": status.recent_log,
                    })),
                    Err(ProcessError::UnknownProcess(_)) => Ok(json!({
                        "name": name,
                        "running": false,
                        "started": false,
                    })),
                    Err(err) => Err(err.into()),
                }
            })
        }),
    }
}

pub(super) fn logs_tool() -> RegisteredTool {
    RegisteredTool {
        definition: ToolDefinition::new(
            SERVER_LOGS_TOOL,
            "Return the most recent lines of development server output.",
            ArgumentSchema::new().optional_with_default(
                "lines",
                ArgType::Integer,
                json!(20),
                "Number of trailing lines.",
            ),
        ),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let name = &context.config.server.name;
                let lines = input.optional_u64("lines").unwrap_or(20) as usize;
                let lines: Vec<Value> = context
                    .processes
                    .logs(name, lines)
                    .await?
                    .into_iter()
                    .map(Value::String)
                    .collect();
                Ok(json!({ "name": name, "lines": lines }))
            })
        }),
    }
}

fn server_spec(context: &ToolContext) -> Result<ProcessSpec, ToolError> {
    let server = &context.config.server;
    let root = context.workspace.root();
    let mut spec = ProcessSpec::new(server.command.clone(), root);
    spec.env = server.env.clone();
    spec.readiness = readiness_probe(server.readiness.as_ref())?;
    spec.start_timeout = Duration::from_millis(server.start_timeout_ms);
    spec.health_interval = Duration::from_millis(server.health_interval_ms);
    spec.log_capacity = server.log_lines;
    spec.log_file = Some(root.join(PROCESS_LOG_DIR).join(format!("{}.log", server.name)));
    Ok(spec)
}

pub(crate) fn readiness_probe(config: Option<&ReadinessConfig>) -> Result<ReadinessProbe, ToolError> {
    Ok(match config {
        None => ReadinessProbe::None,
        Some(ReadinessConfig::Http(url)) => ReadinessProbe::Http { url: url.clone() },
        Some(ReadinessConfig::Tcp(addr)) => ReadinessProbe::Tcp { addr: addr.clone() },
        Some(ReadinessConfig::Log(pattern)) => ReadinessProbe::LogLine {
            pattern: regex::Regex::new(pattern).map_err(|err| {
                ToolError::execution(format!("invalid readiness pattern '{pattern}': {err}"))
            })?,
        },
    })
}

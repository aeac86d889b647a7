use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::errors::{RegistryError, ToolError, ValidationError};
use crate::parser::ToolCall;
use crate::process::ProcessSupervisor;
use crate::schema::{ArgumentSchema, Arguments};
use crate::workspace::WorkspaceGuard;
use crate::{SessionConfig, ToolResult};

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;
pub type ToolExecutor = Arc<dyn Fn(ToolInput, ToolContext) -> ToolFuture + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathAccess {
    Read,
    Write,
}

/// An argument that names a filesystem path and how the tool uses it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathParam {
    pub name: &'static str,
    pub access: PathAccess,
}

#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub schema: ArgumentSchema,
    pub paths: Vec<PathParam>,
    pub timeout: Option<Duration>,
}

impl ToolDefinition {
    pub fn new(name: &str, description: &str, schema: ArgumentSchema) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            paths: Vec::new(),
            timeout: None,
        }
    }

    pub fn reads_path(mut self, name: &'static str) -> Self {
        self.paths.push(PathParam {
            name,
            access: PathAccess::Read,
        });
        self
    }

    pub fn writes_path(mut self, name: &'static str) -> Self {
        self.paths.push(PathParam {
            name,
            access: PathAccess::Write,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub executor: ToolExecutor,
}

/// What the model sees about a tool.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Validated arguments plus every declared path argument, already resolved
/// and checked by the workspace guard.
#[derive(Clone, Debug, Default)]
pub struct ToolInput {
    pub arguments: Arguments,
    pub paths: BTreeMap<String, PathBuf>,
}

impl ToolInput {
    pub fn path(&self, name: &str) -> Result<&Path, ToolError> {
        self.paths
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| ValidationError::MissingArgument(name.to_string()).into())
    }

    pub fn string(&self, name: &str) -> Result<&str, ToolError> {
        self.optional_string(name)
            .ok_or_else(|| ValidationError::MissingArgument(name.to_string()).into())
    }

    pub fn optional_string(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(Value::as_str)
    }

    pub fn optional_u64(&self, name: &str) -> Option<u64> {
        self.arguments.get(name).and_then(Value::as_u64)
    }

    pub fn optional_bool(&self, name: &str) -> Option<bool> {
        self.arguments.get(name).and_then(Value::as_bool)
    }
}

/// Shared collaborators handed to every executor.
#[derive(Clone)]
pub struct ToolContext {
    pub workspace: Arc<WorkspaceGuard>,
    pub processes: Arc<ProcessSupervisor>,
    pub config: Arc<SessionConfig>,
}

impl ToolContext {
    pub fn new(
        workspace: Arc<WorkspaceGuard>,
        processes: Arc<ProcessSupervisor>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            workspace,
            processes,
            config,
        }
    }
}

/// Outcome of one dispatched call, in the order the calls were proposed.
#[derive(Clone, Debug)]
pub struct ToolCallReport {
    pub call: ToolCall,
    pub result: ToolResult,
    pub error: Option<ToolError>,
    /// Not executed because an earlier call in the batch was fatal.
    pub skipped: bool,
    pub duration_ms: u64,
}

/// Reports of the calls in a batch that have finished so far, keyed by
/// position in the batch. Survives the dispatch future being dropped.
#[derive(Debug, Default)]
pub struct BatchProgress {
    finished: StdMutex<BTreeMap<usize, ToolCallReport>>,
}

impl BatchProgress {
    fn record(&self, position: usize, report: &ToolCallReport) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.insert(position, report.clone());
        }
    }

    pub fn take(&self) -> BTreeMap<usize, ToolCallReport> {
        self.finished
            .lock()
            .map(|mut finished| std::mem::take(&mut *finished))
            .unwrap_or_default()
    }
}

/// Registered tools in registration order. Holds no session state.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: RegisteredTool) -> Result<(), RegistryError> {
        let name = tool.definition.name.clone();
        if self.index.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&RegisteredTool, RegistryError> {
        self.index
            .get(name)
            .map(|&position| &self.tools[position])
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.definition.name.clone(),
                description: tool.definition.description.clone(),
                parameters: tool.definition.schema.to_json_schema(),
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|tool| tool.definition.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Runs a turn's calls and returns one report per call, in call order.
    ///
    /// Sequential dispatch stops executing after the first error for which
    /// `is_fatal` holds; the remaining calls are reported as skipped.
    /// Parallel dispatch always runs every call.
    pub async fn dispatch(
        &self,
        calls: Vec<ToolCall>,
        context: &ToolContext,
        parallel: bool,
        is_fatal: &(dyn Fn(&ToolError) -> bool + Sync),
    ) -> Vec<ToolCallReport> {
        self.dispatch_tracked(calls, context, parallel, is_fatal, &BatchProgress::default())
            .await
    }

    /// Like [`ToolRegistry::dispatch`], also copying each report into
    /// `progress` as soon as its call finishes.
    pub async fn dispatch_tracked(
        &self,
        calls: Vec<ToolCall>,
        context: &ToolContext,
        parallel: bool,
        is_fatal: &(dyn Fn(&ToolError) -> bool + Sync),
        progress: &BatchProgress,
    ) -> Vec<ToolCallReport> {
        if parallel && calls.len() > 1 {
            let futures = calls.into_iter().enumerate().map(move |(position, call)| async move {
                let report = self.dispatch_single(call, context.clone()).await;
                progress.record(position, &report);
                report
            });
            return join_all(futures).await;
        }

        let mut reports = Vec::with_capacity(calls.len());
        let mut halted = false;
        for (position, call) in calls.into_iter().enumerate() {
            let report = if halted {
                skipped_report(call)
            } else {
                let report = self.dispatch_single(call, context.clone()).await;
                halted = report.error.as_ref().is_some_and(is_fatal);
                report
            };
            progress.record(position, &report);
            reports.push(report);
        }
        reports
    }

    #[instrument(skip_all, fields(tool = %call.name, index = call.index, turn = call.turn))]
    pub async fn dispatch_single(&self, call: ToolCall, context: ToolContext) -> ToolCallReport {
        let started = Instant::now();
        let outcome = self.execute_call(&call, context).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(data) => {
                debug!(duration_ms, "tool call succeeded");
                ToolCallReport {
                    call,
                    result: ToolResult::success(data),
                    error: None,
                    skipped: false,
                    duration_ms,
                }
            }
            Err(error) => {
                warn!(duration_ms, error = %error, "tool call failed");
                ToolCallReport {
                    call,
                    result: ToolResult::failure(error.to_string()),
                    error: Some(error),
                    skipped: false,
                    duration_ms,
                }
            }
        }
    }

    async fn execute_call(&self, call: &ToolCall, context: ToolContext) -> Result<Value, ToolError> {
        let tool = self.resolve(&call.name)?;
        let arguments = tool.definition.schema.validate(&call.arguments)?;

        let mut paths = BTreeMap::new();
        for param in &tool.definition.paths {
            let Some(raw) = arguments.get(param.name).and_then(Value::as_str) else {
                continue;
            };
            let resolved = context.workspace.resolve(raw)?;
            if param.access == PathAccess::Write {
                context.workspace.check_protected(&resolved)?;
            }
            paths.insert(param.name.to_string(), resolved);
        }

        let timeout = tool
            .definition
            .timeout
            .unwrap_or_else(|| context.config.tool_timeout());
        let input = ToolInput { arguments, paths };
        let future = AssertUnwindSafe((tool.executor)(input, context)).catch_unwind();

        match tokio::time::timeout(timeout, future).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ToolError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(ToolError::Timeout {
                tool: call.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn skipped_report(call: ToolCall) -> ToolCallReport {
    ToolCallReport {
        call,
        result: ToolResult::failure("skipped: an earlier call in this turn halted the session"),
        error: None,
        skipped: true,
        duration_ms: 0,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

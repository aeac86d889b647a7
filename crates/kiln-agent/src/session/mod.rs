use crate::{
    AgentError, BatchProgress, EventData, EventEmitter, EventKind, NoopEventEmitter, ProcessSupervisor,
    SessionConfig, SessionEvent, ToolCall, ToolCallReport, ToolContext, ToolError, ToolRegistry,
    ToolResult, WorkspaceGuard, build_registry, build_system_prompt, history_to_messages,
    parse_response,
};
use kiln_history::{HistoryEntry, HistoryRecord, HistoryStore};
use kiln_llm::{Client, ModelRequest};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

mod types;
pub use types::{SessionResult, SessionState, SessionStatus};

/// Tool name recorded for results synthesized from unparseable responses.
pub const PROTOCOL_TOOL_NAME: &str = "protocol";

/// One agent run: the turn loop plus the collaborators it drives.
pub struct Session {
    id: String,
    config: Arc<SessionConfig>,
    client: Arc<Client>,
    registry: Arc<ToolRegistry>,
    history: Arc<dyn HistoryStore>,
    processes: Arc<ProcessSupervisor>,
    workspace: Arc<WorkspaceGuard>,
    event_emitter: Arc<dyn EventEmitter>,
    state: SessionState,
    turn: u32,
    abort_requested: Arc<AtomicBool>,
    abort_notify: Arc<Notify>,
}

/// Cancels a running session from another task, e.g. a Ctrl-C handler.
#[derive(Clone)]
pub struct SessionAbortHandle {
    abort_requested: Arc<AtomicBool>,
    abort_notify: Arc<Notify>,
}

impl SessionAbortHandle {
    pub fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.abort_notify.notify_waiters();
    }
}

/// Where the turn loop stopped and why.
struct Outcome {
    status: SessionStatus,
    error: Option<String>,
}

impl Outcome {
    fn new(status: SessionStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    fn fatal(error: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::FatalHalt,
            error: Some(error.into()),
        }
    }
}

enum TurnStep {
    Continue { counted: bool },
    Finished(Outcome),
}

impl Session {
    /// Builds a session with the built-in tools allowed by `config`, a fresh
    /// process supervisor and no event sink.
    pub fn new(
        config: SessionConfig,
        client: Client,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, AgentError> {
        config.validate()?;
        let registry = build_registry(&config)?;
        let workspace = WorkspaceGuard::new(&config.working_dir, &config.protected_files)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            config: Arc::new(config),
            client: Arc::new(client),
            registry: Arc::new(registry),
            history,
            processes: Arc::new(ProcessSupervisor::new()),
            workspace: Arc::new(workspace),
            event_emitter: Arc::new(NoopEventEmitter),
            state: SessionState::Init,
            turn: 0,
            abort_requested: Arc::new(AtomicBool::new(false)),
            abort_notify: Arc::new(Notify::new()),
        })
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_event_emitter(mut self, event_emitter: Arc<dyn EventEmitter>) -> Self {
        self.event_emitter = event_emitter;
        self
    }

    pub fn with_process_supervisor(mut self, processes: Arc<ProcessSupervisor>) -> Self {
        self.processes = processes;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn turn_count(&self) -> u32 {
        self.turn
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn abort_handle(&self) -> SessionAbortHandle {
        SessionAbortHandle {
            abort_requested: self.abort_requested.clone(),
            abort_notify: self.abort_notify.clone(),
        }
    }

    pub fn request_abort(&self) {
        self.abort_handle().request_abort();
    }

    /// Runs the session to a terminal status. Only a second call on the same
    /// session is an error; every failure during the run ends up in the
    /// returned [`SessionResult`].
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn run(&mut self, instruction: &str) -> Result<SessionResult, AgentError> {
        if self.state != SessionState::Init {
            return Err(AgentError::InvalidState(format!(
                "session {} already ran ({})",
                self.id, self.state
            )));
        }
        self.transition_to(SessionState::Running)?;
        info!(model = %self.config.model, max_turns = self.config.max_turns, "session started");
        self.emit(
            EventKind::SessionStart,
            event_data(json!({
                "model": self.config.model,
                "max_turns": self.config.max_turns,
                "tools": self.registry.names(),
            })),
        );

        let outcome = match self.record_preamble(instruction).await {
            Ok(()) => self.drive().await,
            Err(error) => Outcome::fatal(error.to_string()),
        };
        self.finish(outcome).await
    }

    async fn record_preamble(&self, instruction: &str) -> Result<(), AgentError> {
        let system_prompt = build_system_prompt(&self.registry.list(), &self.config.protected_files);
        self.history
            .append(0, HistoryEntry::SystemPrompt {
                content: system_prompt,
            })
            .await?;
        self.history
            .append(0, HistoryEntry::UserInstruction {
                content: instruction.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn drive(&mut self) -> Outcome {
        let mut counted = true;
        let mut consecutive_protocol_errors = 0u32;
        loop {
            if self.is_abort_requested() {
                return Outcome::new(SessionStatus::Cancelled);
            }
            if counted {
                if self.turn >= self.config.max_turns {
                    info!(turns = self.turn, "turn budget exhausted");
                    self.emit(
                        EventKind::TurnLimit,
                        event_data(json!({ "max_turns": self.config.max_turns })),
                    );
                    return Outcome::new(SessionStatus::MaxTurnsReached);
                }
                self.turn += 1;
            }

            match self.run_turn(&mut consecutive_protocol_errors).await {
                Ok(TurnStep::Continue { counted: next }) => counted = next,
                Ok(TurnStep::Finished(outcome)) => return outcome,
                Err(error) => return Outcome::fatal(error.to_string()),
            }
        }
    }

    async fn run_turn(&self, consecutive_protocol_errors: &mut u32) -> Result<TurnStep, AgentError> {
        let turn = self.turn;
        debug!(turn, "turn started");
        self.emit(EventKind::TurnStart, EventData::new());

        let records = self.history.records().await?;
        let messages = history_to_messages(
            &records,
            self.config.history_window,
            self.config.tool_output_limit,
        );
        let request = ModelRequest::new(self.config.model.clone(), messages);

        let response = tokio::select! {
            result = self.client.query(request) => Some(result),
            _ = self.abort_signal() => None,
        };
        let response = match response {
            None => return Ok(TurnStep::Finished(Outcome::new(SessionStatus::Cancelled))),
            Some(Err(error)) => {
                warn!(turn, error = %error, "model query failed");
                self.emit(
                    EventKind::Error,
                    event_data(json!({ "source": "model", "error": error.to_string() })),
                );
                return Ok(TurnStep::Finished(Outcome::fatal(format!("model error: {error}"))));
            }
            Some(Ok(response)) => response,
        };

        self.history
            .append(turn, HistoryEntry::ModelResponse {
                content: response.text.clone(),
            })
            .await?;
        self.emit(
            EventKind::ModelResponse,
            event_data(json!({ "provider": response.provider, "chars": response.text.chars().count() })),
        );

        let parsed = match parse_response(&response.text, turn) {
            Ok(parsed) => parsed,
            Err(error) => {
                *consecutive_protocol_errors += 1;
                warn!(turn, error = %error, "unparseable model response");
                self.history
                    .append(turn, HistoryEntry::ToolCallResult {
                        call_index: 0,
                        tool: PROTOCOL_TOOL_NAME.to_string(),
                        arguments: Value::Null,
                        result: ToolResult::failure(error.to_string()),
                    })
                    .await?;
                self.emit(
                    EventKind::ProtocolError,
                    event_data(json!({
                        "error": error.to_string(),
                        "consecutive": *consecutive_protocol_errors,
                    })),
                );

                if self.config.protocol_errors_consume_turn {
                    return Ok(TurnStep::Continue { counted: true });
                }
                if *consecutive_protocol_errors > self.config.max_consecutive_protocol_errors {
                    return Ok(TurnStep::Finished(Outcome::fatal(format!(
                        "{} consecutive protocol errors; last: {error}",
                        *consecutive_protocol_errors
                    ))));
                }
                return Ok(TurnStep::Continue { counted: false });
            }
        };
        *consecutive_protocol_errors = 0;

        if parsed.terminate {
            if !parsed.calls.is_empty() {
                warn!(
                    turn,
                    discarded = parsed.calls.len(),
                    "termination tag alongside tool calls; calls discarded"
                );
                self.emit(
                    EventKind::Warning,
                    event_data(json!({
                        "message": "termination tag alongside tool calls; calls discarded",
                        "discarded": parsed.calls.len(),
                    })),
                );
            }
            return Ok(TurnStep::Finished(Outcome::new(SessionStatus::Terminated)));
        }

        if parsed.is_noop() {
            info!(turn, "model response contained no tool calls");
            self.emit(EventKind::NoOp, EventData::new());
            return Ok(TurnStep::Continue { counted: true });
        }

        self.execute_calls(parsed.calls).await
    }

    async fn execute_calls(&self, calls: Vec<ToolCall>) -> Result<TurnStep, AgentError> {
        for call in &calls {
            self.emit(
                EventKind::ToolCallStart,
                event_data(json!({
                    "index": call.index,
                    "tool": call.name,
                    "arguments": call.arguments,
                })),
            );
        }

        let context = ToolContext::new(
            self.workspace.clone(),
            self.processes.clone(),
            self.config.clone(),
        );
        let config = self.config.clone();
        let is_fatal = move |error: &ToolError| config.is_fatal(error);
        let pending = calls.clone();
        let progress = BatchProgress::default();

        let reports = tokio::select! {
            reports = self.registry.dispatch_tracked(
                calls,
                &context,
                self.config.parallel_tool_calls,
                &is_fatal,
                &progress,
            ) => Some(reports),
            _ = self.abort_signal() => None,
        };
        let Some(reports) = reports else {
            // Every proposed call still gets a result before the session ends.
            let mut finished = progress.take();
            for (position, call) in pending.into_iter().enumerate() {
                match finished.remove(&position) {
                    Some(report) => {
                        self.record_tool_result(&report.call, report.result.clone())
                            .await?;
                        self.emit_tool_call_end(&report);
                    }
                    None => {
                        self.record_tool_result(
                            &call,
                            ToolResult::failure("cancelled before completion"),
                        )
                        .await?;
                    }
                }
            }
            return Ok(TurnStep::Finished(Outcome::new(SessionStatus::Cancelled)));
        };

        let mut fatal = None;
        for report in &reports {
            self.record_tool_result(&report.call, report.result.clone())
                .await?;
            self.emit_tool_call_end(report);
            if fatal.is_none() {
                fatal = report
                    .error
                    .as_ref()
                    .filter(|error| self.config.is_fatal(error))
                    .map(|error| format!("fatal tool error in {}: {error}", report.call.name));
            }
        }

        Ok(match fatal {
            Some(error) => TurnStep::Finished(Outcome::fatal(error)),
            None => TurnStep::Continue { counted: true },
        })
    }

    async fn record_tool_result(
        &self,
        call: &ToolCall,
        result: ToolResult,
    ) -> Result<HistoryRecord, AgentError> {
        Ok(self
            .history
            .append(call.turn, HistoryEntry::ToolCallResult {
                call_index: call.index,
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
                result,
            })
            .await?)
    }

    fn emit_tool_call_end(&self, report: &ToolCallReport) {
        self.emit(
            EventKind::ToolCallEnd,
            event_data(json!({
                "index": report.call.index,
                "tool": report.call.name,
                "ok": report.result.ok,
                "error": report.result.error,
                "skipped": report.skipped,
                "duration_ms": report.duration_ms,
            })),
        );
    }

    async fn finish(&mut self, outcome: Outcome) -> Result<SessionResult, AgentError> {
        let Outcome { mut status, mut error } = outcome;
        self.processes.stop_all().await;

        let marker = HistoryEntry::SessionMarker {
            status: status.as_str().to_string(),
            detail: error.clone(),
        };
        let persisted = match self.history.append(self.turn, marker).await {
            Ok(_) => self.history.flush().await,
            Err(history_error) => Err(history_error),
        };
        if let Err(history_error) = persisted {
            warn!(error = %history_error, "history could not be finalized");
            status = SessionStatus::FatalHalt;
            error = Some(format!("history error: {history_error}"));
        }
        let history = match self.history.records().await {
            Ok(records) => records,
            Err(history_error) => {
                status = SessionStatus::FatalHalt;
                error.get_or_insert_with(|| format!("history error: {history_error}"));
                Vec::new()
            }
        };

        self.transition_to(SessionState::Ended(status))?;
        info!(
            status = %status,
            turns = self.turn,
            history_entries = history.len(),
            error = error.as_deref().unwrap_or(""),
            "session ended"
        );
        self.emit(
            EventKind::SessionEnd,
            event_data(json!({
                "status": status.as_str(),
                "turn_count": self.turn,
                "history_entries": history.len(),
                "error": error,
            })),
        );

        Ok(SessionResult {
            session_id: self.id.clone(),
            status,
            turn_count: self.turn,
            history,
            error,
        })
    }

    fn transition_to(&mut self, next: SessionState) -> Result<(), AgentError> {
        if !self.state.can_transition_to(&next) {
            return Err(AgentError::InvalidState(format!(
                "cannot move from {} to {}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Resolves once an abort has been requested, including one requested
    /// before this future was first polled.
    async fn abort_signal(&self) {
        let notified = self.abort_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_abort_requested() {
            return;
        }
        notified.await;
    }

    fn emit(&self, kind: EventKind, data: EventData) {
        let event = SessionEvent::new(kind, self.id.clone(), self.turn, data);
        if let Err(error) = self.event_emitter.emit(event) {
            warn!(error = %error, "dropping session event");
        }
    }
}

fn event_data(value: Value) -> EventData {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        other => EventData::from([("value".to_string(), other)]),
    }
}

#[cfg(test)]
mod tests;

use super::*;
use crate::{BufferedEventEmitter, CommandLine, STATE_DIR};
use async_trait::async_trait;
use kiln_history::{HistoryResult, HistoryStoreError, MemoryHistoryStore};
use kiln_llm::{ModelError, ModelResponse, ProviderAdapter, RetryPolicy};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

#[derive(Clone)]
struct SequenceAdapter {
    responses: Arc<Mutex<VecDeque<String>>>,
    delay: Duration,
}

impl SequenceAdapter {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Arc::new(Mutex::new(
                responses.iter().map(|text| text.to_string()).collect(),
            )),
            delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new(&["<terminate/>"])
        }
    }
}

#[async_trait]
impl ProviderAdapter for SequenceAdapter {
    fn name(&self) -> &str {
        "sequence"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<kiln_llm::ModelResponse, ModelError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let text = self
            .responses
            .lock()
            .expect("responses mutex")
            .pop_front()
            .ok_or_else(|| ModelError::InvalidRequest("no response queued".to_string()))?;
        Ok(ModelResponse::new("sequence", request.model.clone(), text))
    }
}

/// Accepts appends but fails to flush.
#[derive(Default)]
struct UnflushableHistory {
    inner: MemoryHistoryStore,
}

#[async_trait]
impl HistoryStore for UnflushableHistory {
    async fn append(&self, turn: u32, entry: HistoryEntry) -> HistoryResult<HistoryRecord> {
        self.inner.append(turn, entry).await
    }

    async fn records(&self) -> HistoryResult<Vec<HistoryRecord>> {
        self.inner.records().await
    }

    async fn len(&self) -> HistoryResult<usize> {
        self.inner.len().await
    }

    async fn flush(&self) -> HistoryResult<()> {
        Err(HistoryStoreError::Backend("disk full".to_string()))
    }
}

fn workspace() -> TempDir {
    let tmp = tempdir().expect("tempdir should be created");
    std::fs::create_dir_all(tmp.path().join(STATE_DIR)).expect("state dir");
    tmp
}

fn session_with(
    tmp: &TempDir,
    config: SessionConfig,
    adapter: SequenceAdapter,
    history: Arc<dyn HistoryStore>,
) -> Session {
    let mut client = Client::new(RetryPolicy::no_retry(), Duration::from_secs(30));
    client.register_provider(Arc::new(adapter));
    let config = SessionConfig {
        working_dir: tmp.path().to_path_buf(),
        ..config
    };
    Session::new(config, client, history).expect("session should build")
}

fn session(tmp: &TempDir, config: SessionConfig, responses: &[&str]) -> Session {
    session_with(
        tmp,
        config,
        SequenceAdapter::new(responses),
        Arc::new(MemoryHistoryStore::new()),
    )
}

#[test]
fn terminal_states_are_absorbing() {
    let ended = SessionState::Ended(SessionStatus::Terminated);
    assert!(SessionState::Init.can_transition_to(&SessionState::Running));
    assert!(SessionState::Running.can_transition_to(&ended));
    assert!(!ended.can_transition_to(&SessionState::Running));
    assert!(!ended.can_transition_to(&SessionState::Ended(SessionStatus::FatalHalt)));
    assert_eq!(ended.to_string(), "TERMINATED");
}

#[tokio::test(flavor = "current_thread")]
async fn session_cannot_run_twice() {
    let tmp = workspace();
    let mut session = session(&tmp, SessionConfig::default(), &["<terminate/>"]);
    let first = session.run("go").await.expect("first run");
    assert_eq!(first.status, SessionStatus::Terminated);
    assert_eq!(session.state(), SessionState::Ended(SessionStatus::Terminated));
    assert!(matches!(
        session.run("again").await,
        Err(AgentError::InvalidState(_))
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn events_follow_the_turn_lifecycle() {
    let tmp = workspace();
    let events = BufferedEventEmitter::default();
    let mut session = session(
        &tmp,
        SessionConfig::default(),
        &[
            "<tool_call>{\"tool\": \"fs.mkdir\", \"arguments\": {\"path\": \"src\"}}</tool_call>",
            "<terminate/>",
        ],
    )
    .with_event_emitter(Arc::new(events.clone()));

    session.run("go").await.expect("run");

    assert_eq!(
        events.kinds(),
        vec![
            EventKind::SessionStart,
            EventKind::TurnStart,
            EventKind::ModelResponse,
            EventKind::ToolCallStart,
            EventKind::ToolCallEnd,
            EventKind::TurnStart,
            EventKind::ModelResponse,
            EventKind::SessionEnd,
        ]
    );
    assert!(events.snapshot().iter().all(|event| event.session_id == session.id()));
}

#[tokio::test(flavor = "current_thread")]
async fn terminate_with_calls_discards_the_calls() {
    let tmp = workspace();
    let events = BufferedEventEmitter::default();
    let mut session = session(
        &tmp,
        SessionConfig::default(),
        &["<tool_call>{\"tool\": \"fs.mkdir\", \"arguments\": {\"path\": \"src\"}}</tool_call><terminate/>"],
    )
    .with_event_emitter(Arc::new(events.clone()));

    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::Terminated);
    assert_eq!(result.tool_results().count(), 0);
    assert!(!tmp.path().join("src").exists());
    assert!(events.kinds().contains(&EventKind::Warning));
}

#[tokio::test(flavor = "current_thread")]
async fn uncounted_protocol_errors_do_not_spend_the_turn_budget() {
    let tmp = workspace();
    let mut session = session(
        &tmp,
        SessionConfig {
            max_turns: 1,
            protocol_errors_consume_turn: false,
            ..SessionConfig::default()
        },
        &["<tool_call>not json</tool_call>", "<tool_call>{", "<terminate/>"],
    );

    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::Terminated);
    assert_eq!(result.turn_count, 1);
    assert_eq!(result.tool_results().count(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn consecutive_protocol_errors_are_capped() {
    let tmp = workspace();
    let mut session = session(
        &tmp,
        SessionConfig {
            protocol_errors_consume_turn: false,
            max_consecutive_protocol_errors: 2,
            ..SessionConfig::default()
        },
        &["<tool_call>x</tool_call>"; 5],
    );

    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::FatalHalt);
    assert_eq!(result.tool_results().count(), 3);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|error| error.contains("3 consecutive protocol errors"))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn abort_before_run_cancels_without_querying() {
    let tmp = workspace();
    let mut session = session(&tmp, SessionConfig::default(), &[]);
    session.request_abort();

    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::Cancelled);
    assert_eq!(result.turn_count, 0);
    assert_eq!(result.history.len(), 3);
}

#[tokio::test(flavor = "current_thread")]
async fn abort_interrupts_an_in_flight_model_call() {
    let tmp = workspace();
    let mut session = session_with(
        &tmp,
        SessionConfig::default(),
        SequenceAdapter::slow(Duration::from_secs(20)),
        Arc::new(MemoryHistoryStore::new()),
    );
    let abort = session.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        abort.request_abort();
    });

    let started = std::time::Instant::now();
    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        &result.history.last().expect("marker").entry,
        HistoryEntry::SessionMarker { status, .. } if status == "CANCELLED"
    ));
}

#[cfg(unix)]
#[tokio::test(flavor = "current_thread")]
async fn abort_mid_batch_stops_servers_and_keeps_finished_results() {
    let tmp = workspace();
    let mut config = SessionConfig::default();
    config.server.command = CommandLine::new("sh", ["-c", "echo booted; sleep 30"]);
    config.server.readiness = Some(crate::ReadinessConfig::Log("booted".to_string()));
    config.server.start_timeout_ms = 5_000;
    config.tests.suites.insert(
        "slow".to_string(),
        CommandLine::new("sh", ["-c", "touch suite.started; sleep 30"]),
    );
    let response = [
        r#"<tool_call>{"tool": "server.start", "arguments": {}}</tool_call>"#,
        r#"<tool_call>{"tool": "tests.run", "arguments": {"suite": "slow"}}</tool_call>"#,
    ]
    .join("\n");
    let processes = Arc::new(ProcessSupervisor::new());
    let mut session = session_with(
        &tmp,
        config,
        SequenceAdapter::new(&[response.as_str()]),
        Arc::new(MemoryHistoryStore::new()),
    )
    .with_process_supervisor(processes.clone());

    // The suite only starts once server.start has returned.
    let marker = tmp.path().join("suite.started");
    let abort = session.abort_handle();
    tokio::spawn(async move {
        while !marker.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        abort.request_abort();
    });

    let started = std::time::Instant::now();
    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(processes.running().await.is_empty());

    let results: Vec<(String, bool, Option<String>)> = result
        .tool_results()
        .filter_map(|record| match &record.entry {
            HistoryEntry::ToolCallResult { tool, result, .. } => {
                Some((tool.clone(), result.ok, result.error.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        results,
        vec![
            ("server.start".to_string(), true, None),
            (
                "tests.run".to_string(),
                false,
                Some("cancelled before completion".to_string())
            ),
        ]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn history_flush_failure_is_fatal() {
    let tmp = workspace();
    let mut session = session_with(
        &tmp,
        SessionConfig::default(),
        SequenceAdapter::new(&["<terminate/>"]),
        Arc::new(UnflushableHistory::default()),
    );

    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::FatalHalt);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|error| error.contains("disk full"))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn history_window_bounds_the_conversation() {
    let tmp = workspace();
    let adapter = SequenceAdapter::new(&["one", "two", "three"]);
    let mut session = session_with(
        &tmp,
        SessionConfig {
            max_turns: 3,
            history_window: Some(1),
            ..SessionConfig::default()
        },
        adapter,
        Arc::new(MemoryHistoryStore::new()),
    );

    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::MaxTurnsReached);
    let messages = history_to_messages(&result.history, Some(1), 1_000);
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2].content, "three");
}

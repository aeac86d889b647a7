mod support;

use kiln_agent::{CommandLine, FatalCondition, SessionConfig, SessionStatus};
use kiln_history::{HistoryEntry, verify_chain};
use kiln_llm::ModelError;
use serde_json::json;
use support::*;

#[tokio::test(flavor = "current_thread")]
async fn never_terminating_model_stops_after_exactly_max_turns() {
    let tmp = workspace();
    let adapter = SequenceAdapter::new(vec!["thinking..."; 10]);
    let mut session = session(
        SessionConfig {
            max_turns: 3,
            ..config(&tmp)
        },
        &adapter,
    );

    let result = session.run("Build a todo app").await.expect("run");

    assert_eq!(result.status, SessionStatus::MaxTurnsReached);
    assert_eq!(result.turn_count, 3);
    assert_eq!(adapter.request_count(), 3);
    assert_eq!(
        kinds(&result.history),
        vec![
            "system_prompt",
            "user_instruction",
            "model_response",
            "model_response",
            "model_response",
            "session_marker",
        ]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn terminate_only_response_ends_without_another_query() {
    let tmp = workspace();
    let adapter = SequenceAdapter::new(["<terminate/>", "unreachable"]);
    let mut session = session(config(&tmp), &adapter);

    let result = session.run("Nothing to do").await.expect("run");

    assert_eq!(result.status, SessionStatus::Terminated);
    assert_eq!(result.turn_count, 1);
    assert_eq!(adapter.request_count(), 1);
    assert!(matches!(
        &result.history.last().expect("marker").entry,
        HistoryEntry::SessionMarker { status, .. } if status == "TERMINATED"
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_tool_is_recorded_and_the_loop_continues() {
    let tmp = workspace();
    let adapter = SequenceAdapter::new(vec![
        format!(
            "{}{}",
            tool_call("fs.explode", json!({})),
            tool_call("fs.mkdir", json!({"path": "src"}))
        ),
        "<terminate/>".to_string(),
    ]);
    let mut session = session(config(&tmp), &adapter);

    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::Terminated);
    assert_eq!(
        tool_results(&result.history),
        vec![
            (
                "fs.explode".to_string(),
                false,
                Some("unknown tool: fs.explode".to_string())
            ),
            ("fs.mkdir".to_string(), true, None),
        ]
    );
    assert!(tmp.path().join("src").is_dir());
}

#[tokio::test(flavor = "current_thread")]
async fn deleting_the_protected_config_fails_and_the_file_survives() {
    let tmp = workspace();
    let adapter = SequenceAdapter::new(vec![
        tool_call("fs.delete", json!({"path": ".kiln/config.json"})),
        "<terminate/>".to_string(),
    ]);
    let mut session = session(config(&tmp), &adapter);

    let result = session.run("clean up").await.expect("run");

    let results = tool_results(&result.history);
    assert_eq!(results.len(), 1);
    assert!(!results[0].1);
    assert!(
        results[0]
            .2
            .as_deref()
            .is_some_and(|error| error.contains("protected"))
    );
    assert!(tmp.path().join(".kiln/config.json").exists());
}

#[cfg(unix)]
#[tokio::test(flavor = "current_thread")]
async fn successful_run_writes_code_runs_tests_and_terminates() {
    let tmp = workspace();
    let mut config = config(&tmp);
    config.tests.suites.insert(
        "unit".to_string(),
        CommandLine::new(
            "sh",
            ["-c", "test -f src/index.js && echo 'Tests: 2 passed, 2 total'"],
        ),
    );
    let adapter = SequenceAdapter::new(vec![
        format!(
            "{}\n{}",
            tool_call("fs.mkdir", json!({"path": "src"})),
            tool_call(
                "fs.write",
                json!({"path": "src/index.js", "content": "module.exports = 1;\n"})
            )
        ),
        tool_call("tests.run", json!({"suite": "unit"})),
        "<terminate/>".to_string(),
    ]);
    let mut session = session(config, &adapter);

    let result = session.run("Build it").await.expect("run");

    assert_eq!(result.status, SessionStatus::Terminated);
    assert_eq!(result.turn_count, 3);
    assert_eq!(result.tool_results().count(), 3);
    let test_run = result
        .history
        .iter()
        .find_map(|record| match &record.entry {
            HistoryEntry::ToolCallResult { tool, result, .. } if tool == "tests.run" => {
                result.data.clone()
            }
            _ => None,
        })
        .expect("tests.run result");
    assert_eq!(test_run["passed"], json!(true));
    assert_eq!(test_run["summary"]["passed"], json!(2));
    verify_chain(&result.history).expect("history chain should verify");
}

#[cfg(unix)]
#[tokio::test(flavor = "current_thread")]
async fn model_text_never_reaches_a_shell() {
    let tmp = workspace();
    let mut config = config(&tmp);
    config
        .tests
        .suites
        .insert("unit".to_string(), CommandLine::new("echo", ["ran"]));
    let adapter = SequenceAdapter::new(vec![
        tool_call(
            "tests.run",
            json!({"suite": "unit", "test_file": "x; rm -f .kiln/config.json"}),
        ),
        tool_call(
            "server.start",
            json!({"command": "rm -f .kiln/config.json"}),
        ),
        "<terminate/>".to_string(),
    ]);
    let mut session = session(config, &adapter);

    let result = session.run("Run the tests").await.expect("run");

    assert_eq!(result.status, SessionStatus::Terminated);
    let results = tool_results(&result.history);
    assert_eq!(results.len(), 2);
    assert!(results[0].1, "{:?}", results[0]);
    let test_run = result
        .history
        .iter()
        .find_map(|record| match &record.entry {
            HistoryEntry::ToolCallResult { tool, result, .. } if tool == "tests.run" => {
                result.data.clone()
            }
            _ => None,
        })
        .expect("tests.run result");
    assert_eq!(
        test_run["output"].as_str().map(str::trim),
        Some("ran ./x; rm -f .kiln/config.json")
    );
    assert!(!results[1].1);
    assert!(
        results[1]
            .2
            .as_deref()
            .is_some_and(|error| error.contains("command"))
    );
    assert!(tmp.path().join(".kiln/config.json").exists());
}

#[tokio::test(flavor = "current_thread")]
async fn traversal_is_rejected_without_touching_the_filesystem() {
    let tmp = workspace();
    let outside = tmp.path().parent().expect("parent").join("kiln-escape.txt");
    let adapter = SequenceAdapter::new(vec![
        tool_call("fs.write", json!({"path": "../kiln-escape.txt", "content": "x"})),
        tool_call("fs.write", json!({"path": outside.to_string_lossy(), "content": "x"})),
        "<terminate/>".to_string(),
    ]);
    let mut session = session(config(&tmp), &adapter);

    let result = session.run("escape").await.expect("run");

    let results = tool_results(&result.history);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, ok, error)| {
        !ok && error
            .as_deref()
            .is_some_and(|error| error.contains("escapes the working directory"))
    }));
    assert!(!outside.exists());
}

#[tokio::test(flavor = "current_thread")]
async fn missing_argument_never_reaches_the_tool() {
    let tmp = workspace();
    let adapter = SequenceAdapter::new(vec![
        tool_call("fs.write", json!({"path": "notes.txt"})),
        "<terminate/>".to_string(),
    ]);
    let mut session = session(config(&tmp), &adapter);

    let result = session.run("write").await.expect("run");

    assert_eq!(
        tool_results(&result.history),
        vec![(
            "fs.write".to_string(),
            false,
            Some("missing required argument 'content'".to_string())
        )]
    );
    assert!(!tmp.path().join("notes.txt").exists());
}

#[tokio::test(flavor = "current_thread")]
async fn protocol_error_is_fed_back_and_the_model_recovers() {
    let tmp = workspace();
    let adapter = SequenceAdapter::new(vec![
        "<tool_call>{\"tool\": \"fs.ls\", \"arguments\": {</tool_call>".to_string(),
        tool_call("fs.ls", json!({})),
        "<terminate/>".to_string(),
    ]);
    let mut session = session(config(&tmp), &adapter);

    let result = session.run("look around").await.expect("run");

    assert_eq!(result.status, SessionStatus::Terminated);
    let results = tool_results(&result.history);
    assert_eq!(results[0].0, "protocol");
    assert!(!results[0].1);
    assert_eq!(results[1], ("fs.ls".to_string(), true, None));

    let second_request = &adapter.requests()[1];
    let feedback = &second_request
        .messages
        .last()
        .expect("feedback message")
        .content;
    assert!(feedback.starts_with("[tool protocol #0]"));
}

#[tokio::test(flavor = "current_thread")]
async fn auth_failure_halts_the_session() {
    let tmp = workspace();
    let adapter = SequenceAdapter::with_results([Err(ModelError::Auth("bad key".to_string()))]);
    let mut session = session(config(&tmp), &adapter);

    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::FatalHalt);
    assert!(
        result
            .error
            .as_deref()
            .is_some_and(|error| error.contains("bad key"))
    );
    assert!(matches!(
        &result.history.last().expect("marker").entry,
        HistoryEntry::SessionMarker { status, detail: Some(_) } if status == "FATAL_HALT"
    ));
}

#[tokio::test(flavor = "current_thread")]
async fn configured_fatal_condition_halts_and_resolves_remaining_calls() {
    let tmp = workspace();
    let adapter = SequenceAdapter::new(vec![format!(
        "{}{}",
        tool_call("fs.explode", json!({})),
        tool_call("fs.mkdir", json!({"path": "late"}))
    )]);
    let mut session = session(
        SessionConfig {
            fatal_errors: vec![FatalCondition::UnknownTool],
            ..config(&tmp)
        },
        &adapter,
    );

    let result = session.run("go").await.expect("run");

    assert_eq!(result.status, SessionStatus::FatalHalt);
    let results = tool_results(&result.history);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, ok, _)| !ok));
    assert!(!tmp.path().join("late").exists());
}

#[tokio::test(flavor = "current_thread")]
async fn history_only_ever_grows_by_appending() {
    let tmp = workspace();
    let adapter = SequenceAdapter::new(vec![
        tool_call("fs.mkdir", json!({"path": "a"})),
        tool_call("fs.mkdir", json!({"path": "b"})),
        "<terminate/>".to_string(),
    ]);
    let mut session = session(config(&tmp), &adapter);

    let result = session.run("grow").await.expect("run");

    // Each request carries the conversation so far; every later one must
    // extend the earlier one.
    let requests = adapter.requests();
    for pair in requests.windows(2) {
        let (earlier, later) = (&pair[0].messages, &pair[1].messages);
        assert!(later.len() > earlier.len());
        assert_eq!(&later[..earlier.len()], &earlier[..]);
    }
    let sequence: Vec<u64> = result.history.iter().map(|record| record.sequence_no).collect();
    let expected: Vec<u64> = (1..=result.history.len() as u64).collect();
    assert_eq!(sequence, expected);
}

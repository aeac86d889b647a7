use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::config::SessionConfig;
use crate::errors::ToolError;
use crate::process::run_command;
use crate::schema::{ArgType, ArgumentSchema};
use crate::truncation::{TruncationMode, truncate_chars};

use super::{RegisteredTool, TESTS_RUN_TOOL, ToolDefinition};

const RUN_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("ansi escape regex is valid"));
static JEST_TESTS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Tests:\s+(.*)$").expect("jest summary regex is valid"));
static COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s+(passed|failed|skipped|flaky|total)\b").expect("count regex is valid")
});

/// Pass/fail counts scraped from a Jest or Playwright run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TestSummary {
    pub passed: u64,
    pub failed: u64,
    pub total: u64,
}

/// Extracts counts from runner output. Jest's `Tests:` line wins when
/// present; otherwise the last count of each kind is used, which matches
/// Playwright's trailing summary.
pub fn parse_test_summary(output: &str) -> TestSummary {
    let clean = ANSI_ESCAPE.replace_all(output, "");
    let source = JEST_TESTS_LINE
        .captures_iter(&clean)
        .last()
        .and_then(|captures| captures.get(1))
        .map(|line| line.as_str().to_string())
        .unwrap_or_else(|| clean.to_string());

    let mut summary = TestSummary::default();
    let mut skipped = 0;
    let mut total = None;
    for captures in COUNT.captures_iter(&source) {
        let count: u64 = captures[1].parse().unwrap_or(0);
        match &captures[2] {
            "passed" => summary.passed = count,
            "failed" => summary.failed = count,
            "total" => total = Some(count),
            _ => skipped += count,
        }
    }
    summary.total = total.unwrap_or(summary.passed + summary.failed + skipped);
    summary
}

pub(super) fn run_tool(config: &SessionConfig) -> RegisteredTool {
    let timeout = Duration::from_millis(config.tests.timeout_ms) + RUN_TIMEOUT_MARGIN;
    let suites: Vec<String> = config.tests.suites.keys().cloned().collect();
    RegisteredTool {
        definition: ToolDefinition::new(
            TESTS_RUN_TOOL,
            &format!(
                "Run a test suite and report pass/fail counts. Failing tests are not a tool error. Suites: {}.",
                suites.join(", ")
            ),
            ArgumentSchema::new()
                .required("suite", ArgType::String, "Name of a configured test suite.")
                .optional("test_file", ArgType::String, "Run only this test file.")
                .optional_with_default("verbose", ArgType::Boolean, json!(false), "Pass --verbose.")
                .optional_with_default(
                    "headed",
                    ArgType::Boolean,
                    json!(false),
                    "Pass --headed (browser suites).",
                ),
        )
        .reads_path("test_file")
        .with_timeout(timeout),
        executor: Arc::new(|input, context| {
            Box::pin(async move {
                let suite = input.string("suite")?;
                let tests = &context.config.tests;
                let Some(base) = tests.suites.get(suite) else {
                    return Err(ToolError::execution(format!(
                        "unknown test suite '{suite}'; configured: {}",
                        tests.suites.keys().cloned().collect::<Vec<_>>().join(", ")
                    )));
                };

                let mut command = base.clone();
                if input.optional_string("test_file").is_some() {
                    let path = input.path("test_file")?;
                    // Root-relative and dot-prefixed so it can never read as an option.
                    command = command.arg(format!("./{}", context.workspace.display(path)));
                }
                if input.optional_bool("verbose").unwrap_or(false) {
                    command = command.arg("--verbose");
                }
                if input.optional_bool("headed").unwrap_or(false) {
                    command = command.arg("--headed");
                }

                let result = run_command(
                    &command,
                    context.workspace.root(),
                    Duration::from_millis(tests.timeout_ms),
                )
                .await?;
                if result.timed_out {
                    return Err(ToolError::Timeout {
                        tool: TESTS_RUN_TOOL.to_string(),
                        timeout_ms: tests.timeout_ms,
                    });
                }

                let output = format!("{}{}", result.stdout, result.stderr);
                let summary = parse_test_summary(&output);
                Ok(json!({
                    "suite": suite,
                    "command": command.to_string(),
                    "passed": result.succeeded(),
                    "exit_code": result.exit_code,
                    "summary": summary,
                    "output": truncate_chars(&output, context.config.tool_output_limit, TruncationMode::Tail),
                }))
            })
        }),
    }
}

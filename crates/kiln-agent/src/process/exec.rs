use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::kill_process_group;
use crate::errors::ProcessError;

/// A program and its arguments, executed directly without a shell.
///
/// Configuration accepts either an argv array or a plain string, which is
/// split on whitespace. Quotes and shell operators have no meaning in the
/// string form; use the array form for arguments containing spaces.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CommandRepr", into = "Vec<String>")]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommandRepr {
    Line(String),
    Argv(Vec<String>),
}

impl CommandLine {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits `line` on whitespace.
    pub fn parse(line: &str) -> Result<Self, String> {
        Self::from_argv(line.split_whitespace().map(str::to_string).collect())
    }

    fn from_argv(argv: Vec<String>) -> Result<Self, String> {
        let mut argv = argv.into_iter();
        match argv.next() {
            Some(program) if !program.trim().is_empty() => Ok(Self {
                program,
                args: argv.collect(),
            }),
            _ => Err("command must name a program".to_string()),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub(super) fn to_command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

impl TryFrom<CommandRepr> for CommandLine {
    type Error = String;

    fn try_from(repr: CommandRepr) -> Result<Self, Self::Error> {
        match repr {
            CommandRepr::Line(line) => Self::parse(&line),
            CommandRepr::Argv(argv) => Self::from_argv(argv),
        }
    }
}

impl From<CommandLine> for Vec<String> {
    fn from(command: CommandLine) -> Self {
        std::iter::once(command.program).chain(command.args).collect()
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u128,
}

impl ExecResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs `command` to completion or until `timeout` elapses, in which case
/// the whole process group is killed.
#[instrument(skip_all, fields(command = %command, timeout_ms = timeout.as_millis() as u64))]
pub async fn run_command(
    command: &CommandLine,
    cwd: &Path,
    timeout: Duration,
) -> Result<ExecResult, ProcessError> {
    let started = Instant::now();
    let mut child = command
        .to_command(cwd)
        .spawn()
        .map_err(|err| ProcessError::SpawnError {
            name: command.to_string(),
            reason: err.to_string(),
        })?;
    let pid = child.id();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_all(stdout));
    let stderr_task = tokio::spawn(read_all(stderr));

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status, false),
        Err(_) => {
            warn!("command timed out, killing process group");
            kill_process_group(pid, true);
            let _ = child.start_kill();
            (child.wait().await, true)
        }
    };
    let status = status.map_err(|err| ProcessError::Command(format!("wait failed: {err}")))?;

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ExecResult {
        stdout,
        stderr,
        exit_code: status.code(),
        timed_out,
        duration_ms: started.elapsed().as_millis(),
    })
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandLine {
        CommandLine::new("sh", ["-c", script])
    }

    #[test]
    fn command_line_accepts_string_or_argv() {
        let line: CommandLine = serde_json::from_str(r#""npx  jest --runInBand""#).expect("string form");
        assert_eq!(line.program(), "npx");
        assert_eq!(line.args(), ["jest", "--runInBand"]);
        assert_eq!(line.to_string(), "npx jest --runInBand");

        let argv: CommandLine =
            serde_json::from_str(r#"["node", "my server.js"]"#).expect("argv form");
        assert_eq!(argv.args(), ["my server.js"]);
        assert_eq!(
            serde_json::to_value(&argv).expect("serializes"),
            serde_json::json!(["node", "my server.js"])
        );

        assert!(serde_json::from_str::<CommandLine>(r#""   ""#).is_err());
        assert!(serde_json::from_str::<CommandLine>("[]").is_err());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "current_thread")]
    async fn arguments_reach_the_program_without_a_shell() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        std::fs::write(tmp.path().join("keep.txt"), "kept").expect("write");
        let command = CommandLine::new("echo", ["a; rm keep.txt", "$(whoami)"]);
        let result = run_command(&command, tmp.path(), Duration::from_secs(5))
            .await
            .expect("command should run");
        assert_eq!(result.stdout.trim(), "a; rm keep.txt $(whoami)");
        assert!(tmp.path().join("keep.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "current_thread")]
    async fn run_command_captures_output_and_exit_code() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let result = run_command(&sh("echo out; echo err >&2; exit 3"), tmp.path(), Duration::from_secs(5))
            .await
            .expect("command should run");
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.succeeded());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "current_thread")]
    async fn run_command_kills_on_timeout() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let result = run_command(
            &CommandLine::new("sleep", ["30"]),
            tmp.path(),
            Duration::from_millis(100),
        )
        .await
        .expect("command should run");
        assert!(result.timed_out);
        assert!(result.duration_ms < 10_000);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_program_is_a_spawn_error() {
        let tmp = tempfile::tempdir().expect("tempdir should be created");
        let command = CommandLine::new("kiln-no-such-program", Vec::<String>::new());
        let error = run_command(&command, tmp.path(), Duration::from_secs(5))
            .await
            .expect_err("spawn should fail");
        assert!(matches!(error, ProcessError::SpawnError { .. }));
    }
}

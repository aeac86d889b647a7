//! Supervision of named background processes.
//!
//! Each process gets a monitor task that owns the child, reader tasks that
//! copy its output into a bounded [`LogBuffer`], and an optional health task.
//! Callers only ever see snapshots through [`ProcessSupervisor::status`] and
//! [`ProcessSupervisor::logs`].

mod exec;
mod log;

pub use exec::{CommandLine, ExecResult, run_command};
pub use log::LogBuffer;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use kiln_history::now_ms;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::errors::ProcessError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const STATUS_LOG_LINES: usize = 20;

/// How a started process proves it is ready to serve.
#[derive(Clone, Debug)]
pub enum ReadinessProbe {
    /// Ready as soon as it has been spawned.
    None,
    /// Any HTTP response below 500.
    Http { url: String },
    /// A successful TCP connect.
    Tcp { addr: String },
    /// A captured output line matching the pattern.
    LogLine { pattern: regex::Regex },
}

#[derive(Clone, Debug)]
pub struct ProcessSpec {
    pub command: CommandLine,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub readiness: ReadinessProbe,
    pub start_timeout: Duration,
    pub health_interval: Duration,
    pub log_capacity: usize,
    pub log_file: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(command: CommandLine, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
            env: BTreeMap::new(),
            readiness: ReadinessProbe::None,
            start_timeout: Duration::from_secs(30),
            health_interval: Duration::from_secs(2),
            log_capacity: 500,
            log_file: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub name: String,
    pub command: String,
    pub pid: Option<u32>,
    pub started_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub ok: bool,
    pub checked_at_ms: u64,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub running: bool,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at_ms: u64,
    pub last_health: Option<HealthCheck>,
    pub recent_log: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Liveness {
    Running,
    Exited { code: Option<i32> },
}

struct ManagedProcess {
    handle: ProcessHandle,
    liveness: watch::Receiver<Liveness>,
    log: Arc<LogBuffer>,
    health: Arc<StdMutex<Option<HealthCheck>>>,
    stop_tx: Option<oneshot::Sender<()>>,
    health_task: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    fn is_running(&self) -> bool {
        *self.liveness.borrow() == Liveness::Running
    }
}

pub struct ProcessSupervisor {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    poll_interval: Duration,
    stop_grace: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Starts `spec` under `name` and waits until its readiness probe passes.
    ///
    /// A process that exits early fails with `SpawnError`; one that is still
    /// not ready when `start_timeout` elapses is killed and fails with
    /// `StartTimeout`.
    #[instrument(skip(self, spec), fields(command = %spec.command))]
    pub async fn start(&self, name: &str, spec: ProcessSpec) -> Result<ProcessHandle, ProcessError> {
        let (handle, liveness, log, health) = {
            let mut processes = self.processes.lock().await;
            if processes.get(name).is_some_and(ManagedProcess::is_running) {
                return Err(ProcessError::AlreadyRunning(name.to_string()));
            }
            let managed = spawn_managed(name, &spec, self.stop_grace)?;
            let parts = (
                managed.handle.clone(),
                managed.liveness.clone(),
                managed.log.clone(),
                managed.health.clone(),
            );
            processes.insert(name.to_string(), managed);
            parts
        };
        info!(pid = ?handle.pid, "process spawned");

        match self.wait_until_ready(name, &spec, liveness.clone(), &log).await {
            Ok(check) => {
                set_health(&health, check);
                if !matches!(spec.readiness, ReadinessProbe::None) {
                    let task = tokio::spawn(health_loop(
                        name.to_string(),
                        spec.readiness.clone(),
                        spec.health_interval,
                        liveness,
                        log,
                        health,
                    ));
                    if let Some(process) = self.processes.lock().await.get_mut(name) {
                        process.health_task = Some(task);
                    }
                }
                info!("process ready");
                Ok(handle)
            }
            Err(error) => {
                warn!(error = %error, "process failed to become ready");
                self.stop(name).await?;
                Err(error)
            }
        }
    }

    async fn wait_until_ready(
        &self,
        name: &str,
        spec: &ProcessSpec,
        liveness: watch::Receiver<Liveness>,
        log: &LogBuffer,
    ) -> Result<HealthCheck, ProcessError> {
        let deadline = Instant::now() + spec.start_timeout;
        loop {
            if let Liveness::Exited { code } = *liveness.borrow() {
                return Err(ProcessError::SpawnError {
                    name: name.to_string(),
                    reason: format!(
                        "exited with code {} before becoming ready; last output: {}",
                        code.map_or_else(|| "none".to_string(), |code| code.to_string()),
                        log.tail(5).join(" | ")
                    ),
                });
            }

            let check = probe(&spec.readiness, log).await;
            if check.ok {
                return Ok(check);
            }
            debug!(detail = %check.detail, "readiness probe not yet passing");

            let now = Instant::now();
            if now >= deadline {
                return Err(ProcessError::StartTimeout {
                    name: name.to_string(),
                    timeout_ms: spec.start_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Stops `name`. Stopping an unknown or already stopped process is a
    /// no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<(), ProcessError> {
        let (stop_tx, health_task, mut liveness) = {
            let mut processes = self.processes.lock().await;
            let Some(process) = processes.get_mut(name) else {
                return Ok(());
            };
            (
                process.stop_tx.take(),
                process.health_task.take(),
                process.liveness.clone(),
            )
        };

        if let Some(task) = health_task {
            task.abort();
        }
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }

        let wait = liveness.wait_for(|state| matches!(state, Liveness::Exited { .. }));
        if tokio::time::timeout(self.stop_grace * 2, wait).await.is_err() {
            warn!("process did not report exit after stop");
        } else {
            info!("process stopped");
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(error) = self.stop(&name).await {
                warn!(process = %name, error = %error, "failed to stop process");
            }
        }
    }

    pub async fn status(&self, name: &str) -> Result<ProcessStatus, ProcessError> {
        let processes = self.processes.lock().await;
        let process = processes
            .get(name)
            .ok_or_else(|| ProcessError::UnknownProcess(name.to_string()))?;
        let liveness = *process.liveness.borrow();
        Ok(ProcessStatus {
            name: name.to_string(),
            running: liveness == Liveness::Running,
            pid: process.handle.pid,
            exit_code: match liveness {
                Liveness::Exited { code } => code,
                Liveness::Running => None,
            },
            started_at_ms: process.handle.started_at_ms,
            last_health: process.health.lock().ok().and_then(|health| health.clone()),
            recent_log: process.log.tail(STATUS_LOG_LINES),
        })
    }

    pub async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>, ProcessError> {
        let processes = self.processes.lock().await;
        let process = processes
            .get(name)
            .ok_or_else(|| ProcessError::UnknownProcess(name.to_string()))?;
        Ok(process.log.tail(tail))
    }

    pub async fn running(&self) -> Vec<String> {
        let processes = self.processes.lock().await;
        let mut names: Vec<String> = processes
            .iter()
            .filter(|(_, process)| process.is_running())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

fn spawn_managed(name: &str, spec: &ProcessSpec, stop_grace: Duration) -> Result<ManagedProcess, ProcessError> {
    let mut command = spec.command.to_command(&spec.cwd);
    command.envs(&spec.env);
    let mut child = command.spawn().map_err(|err| ProcessError::SpawnError {
        name: name.to_string(),
        reason: err.to_string(),
    })?;
    let pid = child.id();

    let log = Arc::new(LogBuffer::new(spec.log_capacity));
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(capture_lines(stdout, "", log.clone(), spec.log_file.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(capture_lines(stderr, "[stderr] ", log.clone(), spec.log_file.clone()));
    }

    let (liveness_tx, liveness_rx) = watch::channel(Liveness::Running);
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(monitor(name.to_string(), child, pid, stop_rx, liveness_tx, stop_grace));

    Ok(ManagedProcess {
        handle: ProcessHandle {
            name: name.to_string(),
            command: spec.command.to_string(),
            pid,
            started_at_ms: now_ms(),
        },
        liveness: liveness_rx,
        log,
        health: Arc::new(StdMutex::new(None)),
        stop_tx: Some(stop_tx),
        health_task: None,
    })
}

// Owns the child. A stop request (or the supervisor dropping the sender)
// terminates the process group.
async fn monitor(
    name: String,
    mut child: Child,
    pid: Option<u32>,
    stop_rx: oneshot::Receiver<()>,
    liveness_tx: watch::Sender<Liveness>,
    grace: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => {
            kill_process_group(pid, false);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(process = %name, "process ignored SIGTERM, killing");
                    kill_process_group(pid, true);
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };
    // Reap anything the leader left behind in its group.
    kill_process_group(pid, true);

    let code = status.ok().and_then(|status| status.code());
    info!(process = %name, exit_code = ?code, "process exited");
    let _ = liveness_tx.send(Liveness::Exited { code });
}

async fn capture_lines<R: AsyncRead + Unpin>(
    reader: R,
    prefix: &'static str,
    log: Arc<LogBuffer>,
    log_file: Option<PathBuf>,
) {
    let mut file = match log_file {
        Some(path) => open_log_file(path).await,
        None => None,
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = format!("{prefix}{line}");
                if let Some(out) = file.as_mut() {
                    if out.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                        file = None;
                    }
                }
                log.push(line);
            }
            Ok(None) => break,
            Err(error) => {
                debug!(error = %error, "stopped reading process output");
                break;
            }
        }
    }
}

async fn open_log_file(path: PathBuf) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => Some(file),
        Err(error) => {
            warn!(path = %path.display(), error = %error, "cannot open process log file");
            None
        }
    }
}

async fn health_loop(
    name: String,
    readiness: ReadinessProbe,
    interval: Duration,
    mut liveness: watch::Receiver<Liveness>,
    log: Arc<LogBuffer>,
    health: Arc<StdMutex<Option<HealthCheck>>>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let check = probe(&readiness, &log).await;
                if !check.ok {
                    warn!(process = %name, detail = %check.detail, "health probe failed");
                }
                set_health(&health, check);
            }
            changed = liveness.changed() => {
                if changed.is_err() || *liveness.borrow() != Liveness::Running {
                    break;
                }
            }
        }
    }
}

fn set_health(health: &StdMutex<Option<HealthCheck>>, check: HealthCheck) {
    if let Ok(mut slot) = health.lock() {
        *slot = Some(check);
    }
}

async fn probe(readiness: &ReadinessProbe, log: &LogBuffer) -> HealthCheck {
    let (ok, detail) = match readiness {
        ReadinessProbe::None => (true, "no probe configured".to_string()),
        ReadinessProbe::Http { url } => {
            let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build();
            match client {
                Ok(client) => match client.get(url).send().await {
                    Ok(response) if response.status().as_u16() < 500 => {
                        (true, format!("GET {url} -> {}", response.status()))
                    }
                    Ok(response) => (false, format!("GET {url} -> {}", response.status())),
                    Err(error) => (false, format!("GET {url} failed: {error}")),
                },
                Err(error) => (false, format!("http client unavailable: {error}")),
            }
        }
        ReadinessProbe::Tcp { addr } => {
            match tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(addr.as_str())).await {
                Ok(Ok(_)) => (true, format!("connected to {addr}")),
                Ok(Err(error)) => (false, format!("connect {addr} failed: {error}")),
                Err(_) => (false, format!("connect {addr} timed out")),
            }
        }
        ReadinessProbe::LogLine { pattern } => {
            if log.any_line(|line| pattern.is_match(line)) {
                (true, format!("output matched /{pattern}/"))
            } else {
                (false, format!("waiting for output matching /{pattern}/"))
            }
        }
    };
    HealthCheck {
        ok,
        checked_at_ms: now_ms(),
        detail,
    }
}

/// Signals the process group led by `pid`: SIGTERM, or SIGKILL when `force`.
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: Option<u32>, force: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let _ = killpg(Pid::from_raw(pid), signal);
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: Option<u32>, _force: bool) {}

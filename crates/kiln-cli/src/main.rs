use clap::{ArgAction, Parser, Subcommand};
use kiln_agent::{
    ChannelEventEmitter, EventKind, HISTORY_FILE, STATE_DIR, Session, SessionConfig,
    SessionEvent, SessionResult, SessionStatus, load_instruction,
};
use kiln_history::{HistoryEntry, HistoryRecord, JsonlHistoryStore, load_history, now_ms};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const AGENT_LOG_FILE: &str = "agent.log";

#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(about = "Autonomous web-app agent: plans, edits, runs and tests inside one directory")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Run(RunArgs),
    Replay(ReplayArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(short = 'w', long, default_value = ".")]
    working_dir: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    debug: bool,
    /// Overrides .kiln/instruction.md.
    #[arg(long)]
    instruction: Option<String>,
    #[arg(long)]
    max_turns: Option<u32>,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
    /// Defaults to .kiln/history.jsonl under the working directory.
    #[arg(long)]
    history: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct ReplayArgs {
    #[arg(long)]
    history: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Replay(args) => replay_command(args),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let working_dir = args.working_dir.canonicalize().map_err(|error| {
        format!(
            "working directory '{}' is not accessible: {error}",
            args.working_dir.display()
        )
    })?;
    let _ = dotenvy::from_path(working_dir.join(".env"));
    let _ = dotenvy::dotenv();

    let _log_guard = init_logging(&working_dir, args.debug)?;

    let mut config = SessionConfig::load(&working_dir).map_err(|error| error.to_string())?;
    if let Some(max_turns) = args.max_turns {
        config.max_turns = max_turns;
        config.validate().map_err(|error| error.to_string())?;
    }
    let instruction = match args.instruction {
        Some(instruction) if !instruction.trim().is_empty() => instruction,
        Some(_) => return Err("--instruction must not be empty".to_string()),
        None => load_instruction(&working_dir).map_err(|error| error.to_string())?,
    };

    let history_path = match args.history {
        Some(path) => path,
        None => {
            let path = working_dir.join(HISTORY_FILE);
            rotate_previous_history(&path)?;
            path
        }
    };
    let history = JsonlHistoryStore::create(&history_path).map_err(|error| {
        format!("cannot open history '{}': {error}", history_path.display())
    })?;

    let client = config.build_client().map_err(|error| error.to_string())?;
    let (emitter, mut events) = ChannelEventEmitter::new();
    let mut session = Session::new(config, client, Arc::new(history))
        .map_err(|error| error.to_string())?
        .with_event_emitter(Arc::new(emitter));

    let event_json = args.event_json;
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event, event_json);
        }
    });

    let abort = session.abort_handle();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling session");
            abort.request_abort();
        }
    });

    let result = session.run(&instruction).await;
    drop(session);
    signal_task.abort();
    event_task.await.map_err(|error| error.to_string())?;
    let result = result.map_err(|error| error.to_string())?;

    print_run_summary(&result);
    Ok(exit_code_for_status(result.status))
}

fn replay_command(args: ReplayArgs) -> Result<ExitCode, String> {
    let records = load_history(&args.history)
        .map_err(|error| format!("cannot replay '{}': {error}", args.history.display()))?;
    if args.json {
        for record in &records {
            let line = serde_json::to_string(record).map_err(|error| error.to_string())?;
            println!("{line}");
        }
    } else {
        println!("history: {}", args.history.display());
        println!("entries: {}", records.len());
        for record in &records {
            println!("{}", describe_record(record));
        }
        if let Some(last) = records.last() {
            println!("head_hash: {}", last.hash);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Stderr gets the compact human log; `.kiln/agent.log` gets everything the
/// filter lets through.
fn init_logging(working_dir: &Path, debug: bool) -> Result<WorkerGuard, String> {
    let default_level = if debug { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let state_dir = working_dir.join(STATE_DIR);
    std::fs::create_dir_all(&state_dir)
        .map_err(|error| format!("cannot create '{}': {error}", state_dir.display()))?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&state_dir, AGENT_LOG_FILE));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()
        .map_err(|error| format!("cannot initialise logging: {error}"))?;
    Ok(guard)
}

/// Moves a non-empty history from an earlier run aside so the default path
/// always starts a fresh chain.
fn rotate_previous_history(path: &Path) -> Result<(), String> {
    let in_use = std::fs::metadata(path)
        .map(|metadata| metadata.len() > 0)
        .unwrap_or(false);
    if !in_use {
        return Ok(());
    }
    let rotated = path.with_file_name(format!("history-{}.jsonl", now_ms()));
    std::fs::rename(path, &rotated).map_err(|error| {
        format!(
            "cannot move previous history '{}' aside: {error}",
            path.display()
        )
    })
}

fn print_event(event: &SessionEvent, event_json: bool) {
    if event_json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(_) => print_event_text(event),
        }
    } else {
        print_event_text(event);
    }
}

fn print_event_text(event: &SessionEvent) {
    let detail = match event.kind {
        EventKind::ToolCallStart => event.data.get("tool").map(|tool| tool.to_string()),
        EventKind::ToolCallEnd => Some(format!(
            "{} ok={}",
            event.data.get("tool").map(|tool| tool.to_string()).unwrap_or_default(),
            event.data.get("ok").map(|ok| ok.to_string()).unwrap_or_default()
        )),
        EventKind::ProtocolError | EventKind::Error => {
            event.data.get("error").map(|error| error.to_string())
        }
        EventKind::SessionEnd => event.data.get("status").map(|status| status.to_string()),
        _ => None,
    };
    let kind = serde_json::to_value(&event.kind)
        .ok()
        .and_then(|kind| kind.as_str().map(str::to_string))
        .unwrap_or_default();
    match detail {
        Some(detail) => println!("[turn {}] {kind} {detail}", event.turn),
        None => println!("[turn {}] {kind}", event.turn),
    }
}

fn describe_record(record: &HistoryRecord) -> String {
    let detail = match &record.entry {
        HistoryEntry::SystemPrompt { content }
        | HistoryEntry::UserInstruction { content }
        | HistoryEntry::ModelResponse { content } => first_line(content),
        HistoryEntry::ToolCallResult {
            call_index,
            tool,
            result,
            ..
        } => match &result.error {
            Some(error) => format!("{tool} #{call_index} failed: {}", first_line(error)),
            None => format!("{tool} #{call_index} ok"),
        },
        HistoryEntry::SessionMarker { status, detail } => match detail {
            Some(detail) => format!("{status}: {detail}"),
            None => status.clone(),
        },
    };
    format!(
        "#{} turn={} {} {}",
        record.sequence_no,
        record.turn,
        record.entry.kind(),
        detail
    )
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut shortened: String = line.chars().take(80).collect();
    if shortened.len() < line.len() || text.lines().nth(1).is_some() {
        shortened.push_str(" ...");
    }
    shortened
}

fn print_run_summary(result: &SessionResult) {
    println!(
        "status={} turns={} history_entries={}",
        result.status,
        result.turn_count,
        result.history.len()
    );
    if let Some(error) = result.error.as_deref() {
        eprintln!("error: {error}");
    }
}

fn exit_code_for_status(status: SessionStatus) -> ExitCode {
    match status {
        SessionStatus::Terminated | SessionStatus::MaxTurnsReached => ExitCode::SUCCESS,
        SessionStatus::FatalHalt => ExitCode::from(2),
        SessionStatus::Cancelled => ExitCode::from(130),
    }
}

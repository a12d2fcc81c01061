use crate::model::{
    ClientConfig, PushStatus, ReconnectPolicy, RosterStatus, RunConfig, UiEvent, UploadOutcome,
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_FAILURE_COUNT, DEFAULT_MAX_TRANSACTION_COUNT,
};
use crate::orchestrator::{CycleOutcome, Session, UiCommand, WorkflowState};
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Output line routing for stdout/stderr writer.
#[derive(Debug, PartialEq, Eq)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "sonic-batch",
    version,
    about = "Upload mnemonics, configure and trigger batch runs, and follow the live execution log"
)]
pub struct Cli {
    /// Base URL of the batch backend
    #[arg(long, default_value = "http://localhost:3000")]
    pub base_url: String,

    /// WebSocket URL of the execution log push channel
    #[arg(long, default_value = "ws://localhost:3000")]
    pub push_url: String,

    /// Mnemonic spreadsheet to upload (required with --text)
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Accounts per batch; 0 is sent as 2
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: u32,

    /// Maximum transactions per run; 0 is sent as 3
    #[arg(long, default_value_t = DEFAULT_MAX_TRANSACTION_COUNT)]
    pub max_transaction_count: u32,

    /// Maximum failures before the run stops; 0 is sent as 1
    #[arg(long, default_value_t = DEFAULT_MAX_FAILURE_COUNT)]
    pub max_failure_count: u32,

    /// Run non-interactively: upload, execute, then stream the log to stdout (no TUI)
    #[arg(long)]
    pub text: bool,

    /// In text mode, stop after the upload and roster preview
    #[arg(long, requires = "text")]
    pub upload_only: bool,

    /// In text mode, exit once no log line has arrived for this long after the run starts
    #[arg(long)]
    pub idle_exit: Option<humantime::Duration>,

    /// Timeout applied to each HTTP request (default: none)
    #[arg(long)]
    pub http_timeout: Option<humantime::Duration>,

    /// Treat the push channel as lost after this long without a frame (default: none)
    #[arg(long)]
    pub push_idle_timeout: Option<humantime::Duration>,

    /// Reconnect the push channel with exponential backoff when it drops
    #[arg(long)]
    pub reconnect: bool,

    /// First reconnect delay
    #[arg(long, default_value = "1s")]
    pub reconnect_initial_backoff: humantime::Duration,

    /// Upper bound for the reconnect delay
    #[arg(long, default_value = "30s")]
    pub reconnect_max_backoff: humantime::Duration,

    /// Give up reconnecting after this many consecutive failures
    #[arg(long, default_value_t = 100)]
    pub reconnect_max_attempts: u32,

    /// Keep only the newest N transcript lines, at least 1 (default: unbounded)
    #[arg(long)]
    pub transcript_limit: Option<NonZeroUsize>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file (TUI default: the platform data directory; text mode default: stderr)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn is_text_mode(&self) -> bool {
        self.text || cfg!(not(feature = "tui"))
    }
}

pub async fn run(args: Cli) -> Result<()> {
    if !args.is_text_mode() {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(args).await;
        }
    }

    run_text(args).await
}

/// Build the connection settings from CLI arguments.
pub fn build_client_config(args: &Cli) -> ClientConfig {
    ClientConfig {
        base_url: args.base_url.clone(),
        push_url: args.push_url.clone(),
        http_timeout: args.http_timeout.map(Duration::from),
        push_idle_timeout: args.push_idle_timeout.map(Duration::from),
        reconnect: ReconnectPolicy {
            enabled: args.reconnect,
            initial_backoff: Duration::from(args.reconnect_initial_backoff),
            max_backoff: Duration::from(args.reconnect_max_backoff),
            max_attempts: args.reconnect_max_attempts,
            ..ReconnectPolicy::default()
        },
        transcript_limit: args.transcript_limit.map(NonZeroUsize::get),
        ..ClientConfig::default()
    }
}

/// Initial run parameters from CLI arguments. Floors are applied at submission, not here.
pub fn build_run_config(args: &Cli) -> RunConfig {
    RunConfig {
        batch_size: args.batch_size,
        max_transaction_count: args.max_transaction_count,
        max_failure_count: args.max_failure_count,
    }
}

/// Mirrors state snapshots onto stdout/stderr, printing only what is new.
struct TextFollower {
    out: mpsc::UnboundedSender<OutputLine>,
    seen: u64,
    progress: Option<u8>,
    push_closed: bool,
}

impl TextFollower {
    fn new(out: mpsc::UnboundedSender<OutputLine>) -> Self {
        Self {
            out,
            seen: 0,
            progress: None,
            push_closed: false,
        }
    }

    fn observe(&mut self, state: &WorkflowState) {
        if state.upload_outcome == UploadOutcome::InProgress
            && self.progress != Some(state.upload_progress)
        {
            self.progress = Some(state.upload_progress);
            self.stderr(format!("Uploading: {}%", state.upload_progress));
        }
        for line in state.transcript.since(self.seen) {
            let _ = self.out.send(OutputLine::Stdout(line.to_string()));
        }
        self.seen = state.transcript.appended();
    }

    fn roster(&self, state: &WorkflowState) {
        if state.roster_status != RosterStatus::Loaded {
            return;
        }
        let preview = state.roster_preview();
        self.stderr(preview.header());
        for line in preview.lines() {
            self.stderr(format!("  {line}"));
        }
    }

    fn push_status(&mut self, status: &PushStatus) {
        self.push_closed = matches!(status, PushStatus::Closed { .. });
        self.stderr(format!("Push channel {}", status.label()));
    }

    fn stderr(&self, msg: String) {
        let _ = self.out.send(OutputLine::Stderr(msg));
    }
}

/// Mirror state until `done` holds. Alerts and Ctrl-C end the wait with an error.
async fn follow_until(
    session: &mut Session,
    follower: &mut TextFollower,
    done: impl Fn(&WorkflowState) -> bool,
) -> Result<WorkflowState> {
    loop {
        {
            let state = session.state_rx.borrow_and_update();
            follower.observe(&state);
            if done(&state) {
                return Ok(state.clone());
            }
        }
        tokio::select! {
            changed = session.state_rx.changed() => changed.context("controller stopped")?,
            ev = session.ui_rx.recv() => match ev {
                Some(UiEvent::Alert(msg)) => bail!(msg),
                Some(UiEvent::Push(status)) => follower.push_status(&status),
                None => bail!("controller stopped"),
            },
            _ = tokio::signal::ctrl_c() => bail!("interrupted"),
        }
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

/// Stream push lines after the cycle until Ctrl-C, the idle deadline, or a final close.
async fn stream_log(
    session: &mut Session,
    follower: &mut TextFollower,
    idle_exit: Option<Duration>,
) -> Result<()> {
    if follower.push_closed {
        // Nothing more can arrive.
        return Ok(());
    }
    let mut deadline = idle_exit.map(|d| tokio::time::Instant::now() + d);
    let mut appended = session.state_rx.borrow().transcript.appended();

    loop {
        tokio::select! {
            changed = session.state_rx.changed() => {
                changed.context("controller stopped")?;
                let state = session.state_rx.borrow_and_update().clone();
                follower.observe(&state);
                if state.transcript.appended() != appended {
                    appended = state.transcript.appended();
                    deadline = idle_exit.map(|d| tokio::time::Instant::now() + d);
                }
            }
            ev = session.ui_rx.recv() => match ev {
                Some(UiEvent::Push(status)) => {
                    follower.push_status(&status);
                    if follower.push_closed {
                        return Ok(());
                    }
                }
                Some(UiEvent::Alert(msg)) => follower.stderr(msg),
                None => return Ok(()),
            },
            _ = sleep_until_opt(deadline) => {
                follower.stderr("No log output for a while; exiting.".into());
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn drive_text(args: &Cli, session: &mut Session, follower: &mut TextFollower) -> Result<()> {
    let file = args
        .file
        .clone()
        .context("--file is required in text mode")?;
    session.cmd_tx.send(UiCommand::SelectFile(file))?;
    session.cmd_tx.send(UiCommand::Upload)?;

    let state = follow_until(session, follower, |s| {
        matches!(
            s.upload_outcome,
            UploadOutcome::Succeeded | UploadOutcome::Failed
        ) && s.roster_status != RosterStatus::Pending
    })
    .await?;
    if state.upload_outcome == UploadOutcome::Failed {
        bail!("upload failed");
    }
    follower.roster(&state);
    if args.upload_only {
        return Ok(());
    }

    let cycles = state.completed_cycles;
    session
        .cmd_tx
        .send(UiCommand::Execute(build_run_config(args)))?;
    let state = follow_until(session, follower, |s| s.completed_cycles > cycles).await?;
    if state.last_cycle == Some(CycleOutcome::Failed) {
        bail!("run cycle failed");
    }

    stream_log(session, follower, args.idle_exit.map(Duration::from)).await
}

async fn run_text(args: Cli) -> Result<()> {
    let cfg = build_client_config(&args);
    let (out_tx, out_handle) = spawn_output_writer();
    let mut session = crate::orchestrator::start_session(&cfg)?;
    let mut follower = TextFollower::new(out_tx.clone());

    let res = drive_text(&args, &mut session, &mut follower).await;

    let _ = session.cmd_tx.send(UiCommand::Quit);
    match session.task.await {
        Ok(Err(e)) => warn!(error = %e, "controller ended with error"),
        Err(e) => warn!(error = %e, "controller task failed"),
        Ok(Ok(())) => {}
    }
    info!("text session finished");

    drop(follower);
    drop(out_tx);
    let _ = out_handle.await;
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileHandle;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_backend_defaults() {
        let args = Cli::try_parse_from(["sonic-batch"]).unwrap();
        assert_eq!(build_run_config(&args), RunConfig::default());
        let cfg = build_client_config(&args);
        assert_eq!(cfg.base_url, "http://localhost:3000");
        assert_eq!(cfg.push_url, "ws://localhost:3000");
        assert!(cfg.http_timeout.is_none());
        assert!(!cfg.reconnect.enabled);
        assert!(cfg.transcript_limit.is_none());
    }

    #[test]
    fn flags_flow_into_configs() {
        let args = Cli::try_parse_from([
            "sonic-batch",
            "--text",
            "--file",
            "accounts.xlsx",
            "--batch-size",
            "0",
            "--http-timeout",
            "15s",
            "--reconnect",
            "--reconnect-max-backoff",
            "1m",
            "--transcript-limit",
            "500",
        ])
        .unwrap();
        assert!(args.is_text_mode());
        assert_eq!(build_run_config(&args).batch_size, 0);
        let cfg = build_client_config(&args);
        assert_eq!(cfg.http_timeout, Some(Duration::from_secs(15)));
        assert!(cfg.reconnect.enabled);
        assert_eq!(cfg.reconnect.max_backoff, Duration::from_secs(60));
        assert_eq!(cfg.transcript_limit, Some(500));
    }

    #[test]
    fn zero_transcript_limit_is_rejected() {
        let err = Cli::try_parse_from(["sonic-batch", "--transcript-limit", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        let args = Cli::try_parse_from(["sonic-batch", "--transcript-limit", "1"]).unwrap();
        assert_eq!(build_client_config(&args).transcript_limit, Some(1));
    }

    #[test]
    fn upload_only_requires_text_mode() {
        assert!(Cli::try_parse_from(["sonic-batch", "--upload-only"]).is_err());
    }

    #[test]
    fn follower_prints_each_line_once_across_a_cycle_clear() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut follower = TextFollower::new(tx);
        let mut state = WorkflowState::new(None);
        state.select_file(FileHandle::from_path("a.xlsx")).unwrap();
        let (attempt, _) = state.begin_upload().unwrap();
        state.apply_progress(attempt, 40);
        follower.observe(&state);
        follower.observe(&state);
        state.finish_upload(attempt, Ok("uploaded".into()));
        follower.observe(&state);
        state.begin_cycle(RunConfig::default()).unwrap();
        state.config_acknowledged("config ok".into());
        follower.observe(&state);

        let mut got = Vec::new();
        while let Ok(line) = rx.try_recv() {
            got.push(line);
        }
        assert_eq!(
            got,
            vec![
                OutputLine::Stderr("Uploading: 40%".into()),
                OutputLine::Stdout("uploaded".into()),
                OutputLine::Stdout("config ok".into()),
            ]
        );
    }
}

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Plain-text status line returned by the backend (`/upload`, `/set-config`, `/execute`).
pub type ServerMessage = String;

/// One mnemonic as parsed by the backend. Never interpreted client-side.
pub type AccountSecret = String;

pub const DEFAULT_BATCH_SIZE: u32 = 20;
pub const DEFAULT_MAX_TRANSACTION_COUNT: u32 = 100;
pub const DEFAULT_MAX_FAILURE_COUNT: u32 = 30;

pub const FLOOR_BATCH_SIZE: u32 = 2;
pub const FLOOR_MAX_TRANSACTION_COUNT: u32 = 3;
pub const FLOOR_MAX_FAILURE_COUNT: u32 = 1;

/// Run parameters sent to `/set-config`.
///
/// Values are stored as entered; zero means "not supplied" and is only
/// replaced by the floor when the config is submitted (see [`RunConfig::with_floors`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub batch_size: u32,
    pub max_transaction_count: u32,
    pub max_failure_count: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_transaction_count: DEFAULT_MAX_TRANSACTION_COUNT,
            max_failure_count: DEFAULT_MAX_FAILURE_COUNT,
        }
    }
}

impl RunConfig {
    /// Replace zero fields with their submission floors. Non-zero values pass through untouched.
    pub fn with_floors(self) -> Self {
        fn floor(v: u32, min: u32) -> u32 {
            if v == 0 {
                min
            } else {
                v
            }
        }
        Self {
            batch_size: floor(self.batch_size, FLOOR_BATCH_SIZE),
            max_transaction_count: floor(self.max_transaction_count, FLOOR_MAX_TRANSACTION_COUNT),
            max_failure_count: floor(self.max_failure_count, FLOOR_MAX_FAILURE_COUNT),
        }
    }
}

/// A spreadsheet chosen by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub path: PathBuf,
    pub name: String,
}

impl FileHandle {
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, name }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UploadOutcome {
    #[default]
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

/// What is known about the roster of the current upload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RosterStatus {
    #[default]
    Idle,
    Pending,
    Loaded,
    /// Upload succeeded but the roster could not be fetched.
    Unavailable(String),
}

/// Reconnect behaviour for the push channel. Disabled by default.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 100,
        }
    }
}

/// Connection-level settings shared by the HTTP backend and the push channel.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub push_url: String,
    pub http_timeout: Option<Duration>,
    pub push_idle_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    pub transcript_limit: Option<usize>,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            push_url: "ws://localhost:3000".into(),
            http_timeout: None,
            push_idle_timeout: None,
            reconnect: ReconnectPolicy::default(),
            transcript_limit: None,
            user_agent: format!("sonic-batch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Connection state of the push channel, reported to presentation layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    Connecting,
    Open,
    Reconnecting { attempt: u32, delay_ms: u64 },
    Closed { reason: String },
}

impl PushStatus {
    pub fn label(&self) -> String {
        match self {
            PushStatus::Connecting => "connecting".into(),
            PushStatus::Open => "open".into(),
            PushStatus::Reconnecting { attempt, delay_ms } => {
                format!("reconnecting (attempt {attempt}, in {delay_ms} ms)")
            }
            PushStatus::Closed { reason } => format!("closed: {reason}"),
        }
    }
}

/// Notices emitted by the controller and consumed by UI/CLI layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// A user action was rejected locally; nothing was sent to the backend.
    Alert(String),
    Push(PushStatus),
}

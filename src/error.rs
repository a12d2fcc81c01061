/// Failures talking to the batch backend over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {path} failed: {source}")]
    Transport {
        path: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{path} returned HTTP {status}: {body}")]
    Status {
        path: &'static str,
        status: u16,
        body: String,
    },
    #[error("{path} returned an unreadable body: {source}")]
    Decode {
        path: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} task ended unexpectedly")]
    TaskAborted(&'static str),
}

/// A user action rejected locally, before anything reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    #[error("Please select a mnemonic spreadsheet first.")]
    NoFileSelected,
    #[error("Please upload a valid file first.")]
    UploadNotSucceeded,
    #[error("An upload is already in progress.")]
    UploadInProgress,
    #[error("A run is in progress; please wait for it to finish.")]
    Busy,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("failed to connect to push channel {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("push channel closed: {0}")]
    Closed(String),
    #[error("no push message for {0:?}")]
    IdleTimeout(std::time::Duration),
}

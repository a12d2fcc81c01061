mod http;
mod push;
mod upload;

pub(crate) use http::HttpBackend;
pub(crate) use push::{PushChannel, PushEvent, PushSettings};
pub(crate) use upload::{ProgressReporter, ProgressTick};

use crate::error::BackendError;
use crate::model::{AccountSecret, FileHandle, RunConfig, ServerMessage};
use std::future::Future;
use std::pin::Pin;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// The four request/response operations the batch backend exposes.
///
/// Every call is independent; ordering between them is the controller's job.
pub trait Backend: Send + Sync + 'static {
    /// Send the spreadsheet as multipart field `file`, reporting progress as bytes go out.
    fn upload(&self, file: FileHandle, progress: ProgressReporter)
        -> BackendFuture<'_, ServerMessage>;

    /// Mnemonics parsed from the most recent upload.
    fn fetch_roster(&self) -> BackendFuture<'_, Vec<AccountSecret>>;

    fn submit_config(&self, config: RunConfig) -> BackendFuture<'_, ServerMessage>;

    /// Start a run with the stored config. The reply is an acknowledgement only.
    fn trigger_execution(&self) -> BackendFuture<'_, ServerMessage>;
}

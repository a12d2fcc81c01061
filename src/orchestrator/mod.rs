//! Application-level orchestration.
//!
//! The controller owns workflow state and sequencing; UI/CLI layers start a
//! [`Session`] and talk to it through commands and state snapshots only.

mod controller;
mod workflow;

pub(crate) use controller::{Controller, UiCommand};
#[cfg(feature = "tui")]
pub(crate) use workflow::Transcript;
pub(crate) use workflow::{CycleOutcome, WorkflowState};

use crate::engine::{Backend, HttpBackend, PushChannel, PushSettings};
use crate::model::{ClientConfig, UiEvent};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handles a presentation layer needs to drive one running controller.
pub(crate) struct Session {
    pub(crate) cmd_tx: UnboundedSender<UiCommand>,
    pub(crate) state_rx: watch::Receiver<WorkflowState>,
    pub(crate) ui_rx: UnboundedReceiver<UiEvent>,
    pub(crate) task: JoinHandle<Result<()>>,
}

/// Build the HTTP backend and spawn the controller with its push channel.
pub(crate) fn start_session(cfg: &ClientConfig) -> Result<Session> {
    let backend = HttpBackend::new(cfg).context("failed to build backend client")?;
    Ok(spawn_controller(Arc::new(backend), cfg))
}

pub(crate) fn spawn_controller<B: Backend>(backend: Arc<B>, cfg: &ClientConfig) -> Session {
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (controller, state_rx) = Controller::new(backend, cfg.transcript_limit, ui_tx);
    let task = tokio::spawn(run_controller(PushSettings::from(cfg), controller, cmd_rx));
    Session {
        cmd_tx,
        state_rx,
        ui_rx,
        task,
    }
}

/// Hold the push channel open for as long as the controller runs.
async fn run_controller<B: Backend>(
    settings: PushSettings,
    controller: Controller<B>,
    cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let channel = PushChannel::open(settings, push_tx);
    let res = controller.run(cmd_rx, push_rx).await;
    channel.close().await;
    res
}

//! Workflow controller.
//!
//! Owns the [`WorkflowState`], sequences backend calls and folds push events into the
//! transcript. Presentation layers send [`UiCommand`]s and watch state snapshots.

use super::workflow::WorkflowState;
use crate::engine::{Backend, ProgressReporter, ProgressTick, PushEvent};
use crate::error::{BackendError, GuardError};
use crate::model::{AccountSecret, FileHandle, RunConfig, ServerMessage, UiEvent};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Commands emitted by UI layers.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    SelectFile(PathBuf),
    Upload,
    /// Submit the config, then trigger execution.
    Execute(RunConfig),
    Quit,
}

/// Upload sequence stage, tagged with the attempt it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadStep {
    Transfer(u64),
    Roster(u64),
}

impl UploadStep {
    fn attempt(self) -> u64 {
        match self {
            UploadStep::Transfer(attempt) | UploadStep::Roster(attempt) => attempt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleStep {
    Config,
    Trigger,
}

enum UploadOutput {
    Acknowledged(Result<ServerMessage, BackendError>),
    Roster(Result<Vec<AccountSecret>, BackendError>),
}

/// The one task currently running for a sequence, tagged with where it is.
struct InFlight<S, T> {
    step: S,
    handle: JoinHandle<T>,
}

pub(crate) struct Controller<B: Backend> {
    backend: Arc<B>,
    state: watch::Sender<WorkflowState>,
    ui_tx: UnboundedSender<UiEvent>,
    progress_tx: UnboundedSender<ProgressTick>,
    progress_rx: UnboundedReceiver<ProgressTick>,
    upload: Option<InFlight<UploadStep, UploadOutput>>,
    cycle: Option<InFlight<CycleStep, Result<ServerMessage, BackendError>>>,
}

/// Wait on the slot's task without taking it; an empty slot never resolves.
async fn join_in_flight<S, T>(
    slot: &mut Option<InFlight<S, T>>,
) -> Result<T, tokio::task::JoinError> {
    match slot.as_mut() {
        Some(in_flight) => (&mut in_flight.handle).await,
        None => futures::future::pending().await,
    }
}

impl<B: Backend> Controller<B> {
    pub(crate) fn new(
        backend: Arc<B>,
        transcript_limit: Option<usize>,
        ui_tx: UnboundedSender<UiEvent>,
    ) -> (Self, watch::Receiver<WorkflowState>) {
        let (state, state_rx) = watch::channel(WorkflowState::new(transcript_limit));
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        (
            Self {
                backend,
                state,
                ui_tx,
                progress_tx,
                progress_rx,
                upload: None,
                cycle: None,
            },
            state_rx,
        )
    }

    /// Process commands and events until `Quit` or the command channel closes.
    pub(crate) async fn run(
        mut self,
        mut cmd_rx: UnboundedReceiver<UiCommand>,
        mut push_rx: UnboundedReceiver<PushEvent>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(UiCommand::Quit) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                Some(tick) = self.progress_rx.recv() => self.apply_tick(tick),
                Some(ev) = push_rx.recv() => self.handle_push(ev),
                // The handle stays in its slot until this branch wins.
                joined = join_in_flight(&mut self.upload) => {
                    if let Some(done) = self.upload.take() {
                        self.upload_step_done(done.step, joined);
                    }
                }
                joined = join_in_flight(&mut self.cycle) => {
                    if let Some(done) = self.cycle.take() {
                        let result = joined.unwrap_or_else(|e| {
                            warn!(error = %e, "cycle task ended abnormally");
                            Err(BackendError::TaskAborted("run cycle"))
                        });
                        self.cycle_step_done(done.step, result);
                    }
                }
            }
        }

        if let Some(pending) = self.upload.take() {
            debug!(step = ?pending.step, "leaving upload task detached on shutdown");
        }
        if let Some(pending) = self.cycle.take() {
            debug!(step = ?pending.step, "leaving cycle task detached on shutdown");
        }
        info!("controller stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: UiCommand) {
        match cmd {
            UiCommand::SelectFile(path) => {
                let file = FileHandle::from_path(path);
                if self.guarded(|s| s.select_file(file)).is_some() && self.upload.take().is_some() {
                    // Continuations of the old attempt are discarded by attempt number.
                    info!("detached in-flight upload for previous file");
                }
            }
            UiCommand::Upload => {
                if let Some((attempt, file)) = self.guarded(WorkflowState::begin_upload) {
                    let backend = Arc::clone(&self.backend);
                    let reporter = ProgressReporter::new(attempt, self.progress_tx.clone());
                    let handle = tokio::spawn(async move {
                        UploadOutput::Acknowledged(backend.upload(file, reporter).await)
                    });
                    self.upload = Some(InFlight {
                        step: UploadStep::Transfer(attempt),
                        handle,
                    });
                }
            }
            UiCommand::Execute(config) => {
                if let Some(to_send) = self.guarded(|s| s.begin_cycle(config)) {
                    let backend = Arc::clone(&self.backend);
                    let handle =
                        tokio::spawn(async move { backend.submit_config(to_send).await });
                    self.cycle = Some(InFlight {
                        step: CycleStep::Config,
                        handle,
                    });
                }
            }
            UiCommand::Quit => {}
        }
    }

    /// Apply a guarded transition. Rejections become alerts and leave state untouched.
    fn guarded<T>(
        &mut self,
        f: impl FnOnce(&mut WorkflowState) -> Result<T, GuardError>,
    ) -> Option<T> {
        let mut out = None;
        self.state.send_if_modified(|s| match f(s) {
            Ok(v) => {
                out = Some(Ok(v));
                true
            }
            Err(e) => {
                out = Some(Err(e));
                false
            }
        });
        match out? {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(reason = %e, "action rejected");
                let _ = self.ui_tx.send(UiEvent::Alert(e.to_string()));
                None
            }
        }
    }

    fn apply_tick(&mut self, tick: ProgressTick) {
        self.state
            .send_if_modified(|s| s.apply_progress(tick.attempt, tick.percent));
    }

    fn handle_push(&mut self, ev: PushEvent) {
        match ev {
            PushEvent::Line(line) => self.state.send_modify(|s| s.append_push_line(line)),
            PushEvent::Status(status) => {
                info!(status = %status.label(), "push channel status");
                let _ = self.ui_tx.send(UiEvent::Push(status));
            }
        }
    }

    fn upload_step_done(
        &mut self,
        step: UploadStep,
        joined: Result<UploadOutput, tokio::task::JoinError>,
    ) {
        let attempt = step.attempt();
        // Progress emitted before completion lands first.
        while let Ok(tick) = self.progress_rx.try_recv() {
            self.apply_tick(tick);
        }

        let output = match joined {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, ?step, "upload task ended abnormally");
                let err = BackendError::TaskAborted("upload");
                match step {
                    UploadStep::Transfer(_) => UploadOutput::Acknowledged(Err(err)),
                    UploadStep::Roster(_) => UploadOutput::Roster(Err(err)),
                }
            }
        };

        match output {
            UploadOutput::Acknowledged(result) => {
                let mut fetch_roster = false;
                self.state.send_modify(|s| fetch_roster = s.finish_upload(attempt, result));
                if fetch_roster {
                    let backend = Arc::clone(&self.backend);
                    let handle = tokio::spawn(async move {
                        UploadOutput::Roster(backend.fetch_roster().await)
                    });
                    self.upload = Some(InFlight {
                        step: UploadStep::Roster(attempt),
                        handle,
                    });
                }
            }
            UploadOutput::Roster(result) => {
                self.state.send_modify(|s| s.finish_roster(attempt, result));
            }
        }
    }

    fn cycle_step_done(&mut self, step: CycleStep, result: Result<ServerMessage, BackendError>) {
        match (step, result) {
            (CycleStep::Config, Ok(ack)) => {
                self.state.send_modify(|s| s.config_acknowledged(ack));
                let backend = Arc::clone(&self.backend);
                let handle = tokio::spawn(async move { backend.trigger_execution().await });
                self.cycle = Some(InFlight {
                    step: CycleStep::Trigger,
                    handle,
                });
            }
            (CycleStep::Trigger, Ok(ack)) => {
                self.state.send_modify(|s| s.execution_acknowledged(ack));
            }
            (_, Err(err)) => {
                self.state.send_modify(|s| s.cycle_failed(&err));
            }
        }
    }
}

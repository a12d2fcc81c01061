//! Workflow state and its transitions.
//!
//! Everything here is synchronous. The controller owns the only mutable copy and
//! publishes snapshots; presentation layers never mutate it.

use crate::error::{BackendError, GuardError};
use crate::model::{
    AccountSecret, FileHandle, RosterStatus, RunConfig, ServerMessage, UploadOutcome,
};
use std::collections::VecDeque;
use tracing::{info, warn};

pub const UPLOAD_FAILED_LINE: &str = "File upload failed.";
pub const EXECUTION_FAILED_LINE: &str = "Execution failed.";

/// Number of roster entries shown before the `...` marker.
pub const ROSTER_PREVIEW_LIMIT: usize = 15;

/// Append-only log shown to the operator. Only cleared when a run cycle starts.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    lines: VecDeque<String>,
    limit: Option<usize>,
    appended: u64,
}

impl Transcript {
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            limit: limit.filter(|n| *n > 0),
            ..Self::default()
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
        self.appended += 1;
        if let Some(limit) = self.limit {
            while self.lines.len() > limit {
                self.lines.pop_front();
            }
        }
    }

    /// Empty the visible lines. `appended` keeps counting so followers can tell what is new.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Total lines ever appended.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Lines whose global index is at least `seen` and that are still held.
    pub fn since(&self, seen: u64) -> impl Iterator<Item = &str> {
        let skip = seen.saturating_sub(self.first_held()) as usize;
        self.lines.iter().skip(skip).map(String::as_str)
    }

    /// Global index of the oldest line still held.
    fn first_held(&self) -> u64 {
        self.appended - self.lines.len() as u64
    }
}

// Whole-log views used by the interactive UI; text mode follows lines through `since`.
#[cfg(any(feature = "tui", test))]
impl Transcript {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines evicted by the limit or by a cycle start.
    pub fn dropped(&self) -> u64 {
        self.first_held()
    }

    pub fn to_text(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Acknowledged,
    Failed,
}

/// Single source of truth for the operator workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowState {
    pub selected_file: Option<FileHandle>,
    pub upload_progress: u8,
    pub upload_outcome: UploadOutcome,
    /// Generation of the current upload; bumped by every selection and upload start.
    pub upload_attempt: u64,
    pub roster: Vec<AccountSecret>,
    pub roster_status: RosterStatus,
    pub config: RunConfig,
    pub transcript: Transcript,
    pub is_executing: bool,
    pub completed_cycles: u64,
    pub last_cycle: Option<CycleOutcome>,
}

impl WorkflowState {
    pub fn new(transcript_limit: Option<usize>) -> Self {
        Self {
            transcript: Transcript::with_limit(transcript_limit),
            ..Self::default()
        }
    }

    pub fn select_file(&mut self, file: FileHandle) -> Result<(), GuardError> {
        if self.is_executing {
            return Err(GuardError::Busy);
        }
        info!(file = %file.name, "file selected");
        self.selected_file = Some(file);
        self.upload_progress = 0;
        self.upload_outcome = UploadOutcome::NotStarted;
        self.roster.clear();
        self.roster_status = RosterStatus::Idle;
        self.upload_attempt += 1;
        Ok(())
    }

    /// Returns the attempt number the transfer must report under.
    pub fn begin_upload(&mut self) -> Result<(u64, FileHandle), GuardError> {
        let file = self
            .selected_file
            .clone()
            .ok_or(GuardError::NoFileSelected)?;
        if self.is_executing {
            return Err(GuardError::Busy);
        }
        if self.upload_outcome == UploadOutcome::InProgress {
            return Err(GuardError::UploadInProgress);
        }
        self.upload_attempt += 1;
        self.upload_progress = 0;
        self.upload_outcome = UploadOutcome::InProgress;
        self.roster.clear();
        self.roster_status = RosterStatus::Idle;
        info!(file = %file.name, attempt = self.upload_attempt, "upload started");
        Ok((self.upload_attempt, file))
    }

    /// Returns whether the state changed.
    pub fn apply_progress(&mut self, attempt: u64, percent: u8) -> bool {
        if attempt != self.upload_attempt || self.upload_outcome != UploadOutcome::InProgress {
            return false;
        }
        let pct = percent.min(100);
        if pct <= self.upload_progress {
            return false;
        }
        self.upload_progress = pct;
        true
    }

    /// Settle an upload. Returns true when the roster fetch should follow.
    pub fn finish_upload(
        &mut self,
        attempt: u64,
        result: Result<ServerMessage, BackendError>,
    ) -> bool {
        if attempt != self.upload_attempt {
            info!(attempt, current = self.upload_attempt, "discarding stale upload result");
            return false;
        }
        match result {
            Ok(ack) => {
                info!("upload acknowledged");
                self.upload_outcome = UploadOutcome::Succeeded;
                self.upload_progress = 100;
                self.transcript.push(ack);
                self.roster_status = RosterStatus::Pending;
                true
            }
            Err(err) => {
                warn!(error = %err, "upload failed");
                self.upload_outcome = UploadOutcome::Failed;
                self.transcript.push(UPLOAD_FAILED_LINE);
                false
            }
        }
    }

    pub fn finish_roster(
        &mut self,
        attempt: u64,
        result: Result<Vec<AccountSecret>, BackendError>,
    ) {
        if attempt != self.upload_attempt || self.upload_outcome != UploadOutcome::Succeeded {
            info!(attempt, "discarding stale roster");
            return;
        }
        match result {
            Ok(roster) => {
                info!(entries = roster.len(), "roster loaded");
                self.roster = roster;
                self.roster_status = RosterStatus::Loaded;
            }
            Err(err) => {
                warn!(error = %err, "roster fetch failed");
                let reason = err.to_string();
                self.transcript
                    .push(format!("Mnemonic list unavailable: {reason}"));
                self.roster_status = RosterStatus::Unavailable(reason);
            }
        }
    }

    /// Start a config+execute cycle. Returns the config to transmit, floors applied.
    pub fn begin_cycle(&mut self, config: RunConfig) -> Result<RunConfig, GuardError> {
        if self.is_executing {
            return Err(GuardError::Busy);
        }
        if self.upload_outcome != UploadOutcome::Succeeded {
            return Err(GuardError::UploadNotSucceeded);
        }
        self.config = config;
        self.transcript.clear();
        self.is_executing = true;
        self.last_cycle = None;
        info!("run cycle started");
        Ok(config.with_floors())
    }

    pub fn config_acknowledged(&mut self, ack: ServerMessage) {
        self.transcript.push(ack);
    }

    pub fn execution_acknowledged(&mut self, ack: ServerMessage) {
        self.transcript.push(ack);
        self.end_cycle(CycleOutcome::Acknowledged);
    }

    pub fn cycle_failed(&mut self, err: &BackendError) {
        warn!(error = %err, "run cycle failed");
        self.transcript.push(EXECUTION_FAILED_LINE);
        self.end_cycle(CycleOutcome::Failed);
    }

    fn end_cycle(&mut self, outcome: CycleOutcome) {
        self.is_executing = false;
        self.completed_cycles += 1;
        self.last_cycle = Some(outcome);
        info!(?outcome, cycles = self.completed_cycles, "run cycle finished");
    }

    pub fn append_push_line(&mut self, line: String) {
        self.transcript.push(line);
    }

    pub fn roster_preview(&self) -> RosterPreview<'_> {
        RosterPreview::of(&self.roster)
    }
}

/// The capped roster view: first entries, a truncation marker, and the total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterPreview<'a> {
    pub total: usize,
    pub shown: &'a [AccountSecret],
    pub truncated: bool,
}

impl<'a> RosterPreview<'a> {
    pub fn of(roster: &'a [AccountSecret]) -> Self {
        let shown = &roster[..roster.len().min(ROSTER_PREVIEW_LIMIT)];
        Self {
            total: roster.len(),
            shown,
            truncated: roster.len() > ROSTER_PREVIEW_LIMIT,
        }
    }

    pub fn header(&self) -> String {
        format!("Mnemonic list ({} total):", self.total)
    }

    /// Display lines: the shown entries followed by `...` when truncated.
    pub fn lines(&self) -> Vec<String> {
        let mut out: Vec<String> = self.shown.to_vec();
        if self.truncated {
            out.push("...".into());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("mnemonic {i}")).collect()
    }

    fn uploaded() -> WorkflowState {
        let mut s = WorkflowState::new(None);
        s.select_file(FileHandle::from_path("accounts.xlsx")).unwrap();
        let (attempt, _) = s.begin_upload().unwrap();
        assert!(s.finish_upload(attempt, Ok("accounts.xlsx uploaded".into())));
        s.finish_roster(attempt, Ok(roster(3)));
        s
    }

    #[test]
    fn selecting_a_file_resets_progress_and_roster() {
        let mut s = uploaded();
        assert_eq!(s.upload_progress, 100);
        assert_eq!(s.roster.len(), 3);

        s.select_file(FileHandle::from_path("other.xlsx")).unwrap();
        assert_eq!(s.upload_progress, 0);
        assert!(s.roster.is_empty());
        assert_eq!(s.upload_outcome, UploadOutcome::NotStarted);
        assert_eq!(s.roster_status, RosterStatus::Idle);
    }

    #[test]
    fn upload_requires_a_file() {
        let mut s = WorkflowState::new(None);
        assert_eq!(s.begin_upload().unwrap_err(), GuardError::NoFileSelected);
        assert_eq!(s.upload_outcome, UploadOutcome::NotStarted);
    }

    #[test]
    fn second_upload_rejected_while_transfer_runs() {
        let mut s = WorkflowState::new(None);
        s.select_file(FileHandle::from_path("a.xlsx")).unwrap();
        s.begin_upload().unwrap();
        assert_eq!(s.begin_upload().unwrap_err(), GuardError::UploadInProgress);
    }

    #[test]
    fn progress_is_monotonic_and_attempt_scoped() {
        let mut s = WorkflowState::new(None);
        s.select_file(FileHandle::from_path("a.xlsx")).unwrap();
        let (attempt, _) = s.begin_upload().unwrap();

        assert!(s.apply_progress(attempt, 40));
        assert!(!s.apply_progress(attempt, 30));
        assert_eq!(s.upload_progress, 40);
        assert!(!s.apply_progress(attempt - 1, 90));
        assert_eq!(s.upload_progress, 40);
    }

    #[test]
    fn failed_upload_appends_one_line_and_blocks_execution() {
        let mut s = WorkflowState::new(None);
        s.select_file(FileHandle::from_path("a.xlsx")).unwrap();
        let (attempt, _) = s.begin_upload().unwrap();
        let follow = s.finish_upload(attempt, Err(BackendError::TaskAborted("upload")));

        assert!(!follow);
        assert_eq!(s.upload_outcome, UploadOutcome::Failed);
        assert_eq!(s.transcript.lines().collect::<Vec<_>>(), [UPLOAD_FAILED_LINE]);
        assert!(s.roster.is_empty());
        assert_eq!(
            s.begin_cycle(RunConfig::default()).unwrap_err(),
            GuardError::UploadNotSucceeded
        );
        assert!(!s.is_executing);
    }

    #[test]
    fn roster_failure_keeps_upload_succeeded() {
        let mut s = WorkflowState::new(None);
        s.select_file(FileHandle::from_path("a.xlsx")).unwrap();
        let (attempt, _) = s.begin_upload().unwrap();
        s.finish_upload(attempt, Ok("ok".into()));
        s.finish_roster(attempt, Err(BackendError::TaskAborted("roster")));

        assert_eq!(s.upload_outcome, UploadOutcome::Succeeded);
        assert!(matches!(s.roster_status, RosterStatus::Unavailable(_)));
        assert!(s
            .transcript
            .lines()
            .any(|l| l.starts_with("Mnemonic list unavailable:")));
        assert!(s.begin_cycle(RunConfig::default()).is_ok());
    }

    #[test]
    fn cycle_clears_transcript_and_always_resets_executing() {
        let mut s = uploaded();
        s.append_push_line("old line".into());
        let cfg = RunConfig {
            batch_size: 0,
            max_transaction_count: 100,
            max_failure_count: 30,
        };

        let sent = s.begin_cycle(cfg).unwrap();
        assert_eq!(sent.batch_size, 2);
        assert_eq!(s.config.batch_size, 0);
        assert!(s.transcript.is_empty());
        assert!(s.is_executing);
        assert_eq!(s.select_file(FileHandle::from_path("b.xlsx")), Err(GuardError::Busy));

        s.config_acknowledged("config set".into());
        s.cycle_failed(&BackendError::TaskAborted("execute"));
        assert!(!s.is_executing);
        assert_eq!(s.last_cycle, Some(CycleOutcome::Failed));
        assert_eq!(
            s.transcript.lines().collect::<Vec<_>>(),
            ["config set", EXECUTION_FAILED_LINE]
        );

        s.begin_cycle(RunConfig::default()).unwrap();
        s.config_acknowledged("config set".into());
        s.execution_acknowledged("started".into());
        assert!(!s.is_executing);
        assert_eq!(s.completed_cycles, 2);
        assert_eq!(s.last_cycle, Some(CycleOutcome::Acknowledged));
    }

    #[test]
    fn stale_roster_is_ignored() {
        let mut s = WorkflowState::new(None);
        s.select_file(FileHandle::from_path("a.xlsx")).unwrap();
        let (attempt, _) = s.begin_upload().unwrap();
        s.finish_upload(attempt, Ok("ok".into()));
        s.select_file(FileHandle::from_path("b.xlsx")).unwrap();
        s.finish_roster(attempt, Ok(roster(5)));
        assert!(s.roster.is_empty());
        assert_eq!(s.roster_status, RosterStatus::Idle);
    }

    #[test]
    fn preview_caps_at_fifteen_entries() {
        let all = roster(18);
        let preview = RosterPreview::of(&all);
        assert_eq!(preview.total, 18);
        assert_eq!(preview.shown.len(), 15);
        assert_eq!(preview.header(), "Mnemonic list (18 total):");
        let lines = preview.lines();
        assert_eq!(lines.len(), 16);
        assert_eq!(lines.last().map(String::as_str), Some("..."));

        let few = roster(15);
        assert!(!RosterPreview::of(&few).truncated);
    }

    #[test]
    fn transcript_limit_keeps_newest_lines() {
        let mut t = Transcript::with_limit(Some(2));
        for l in ["a", "b", "c"] {
            t.push(l);
        }
        assert_eq!(t.lines().collect::<Vec<_>>(), ["b", "c"]);
        assert_eq!(t.dropped(), 1);
        assert_eq!(t.appended(), 3);
        assert_eq!(t.since(0).collect::<Vec<_>>(), ["b", "c"]);
        assert_eq!(t.since(2).collect::<Vec<_>>(), ["c"]);
        assert_eq!(t.since(3).count(), 0);

        t.clear();
        t.push("d");
        assert_eq!(t.dropped(), 3);
        assert_eq!(t.since(3).collect::<Vec<_>>(), ["d"]);
        assert_eq!(t.to_text(), "d");
    }
}

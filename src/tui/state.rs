use crate::model::{PushStatus, RunConfig};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    File,
    BatchSize,
    MaxTransactionCount,
    MaxFailureCount,
}

impl Field {
    const ORDER: [Field; 4] = [
        Field::File,
        Field::BatchSize,
        Field::MaxTransactionCount,
        Field::MaxFailureCount,
    ];

    pub fn next(self) -> Self {
        let i = Self::ORDER.iter().position(|f| *f == self).unwrap_or(0);
        Self::ORDER[(i + 1) % Self::ORDER.len()]
    }

    pub fn prev(self) -> Self {
        let i = Self::ORDER.iter().position(|f| *f == self).unwrap_or(0);
        Self::ORDER[(i + Self::ORDER.len() - 1) % Self::ORDER.len()]
    }

    pub fn label(self) -> &'static str {
        match self {
            Field::File => "Spreadsheet",
            Field::BatchSize => "Batch size",
            Field::MaxTransactionCount => "Max transactions",
            Field::MaxFailureCount => "Max failures",
        }
    }
}

/// Form and view state owned by the UI thread. Workflow state lives in the controller.
pub struct UiState {
    pub focus: Field,
    pub file_input: String,
    pub batch_size: String,
    pub max_transaction_count: String,
    pub max_failure_count: String,
    pub info: String,
    pub push_status: Option<PushStatus>,
    /// Lines scrolled up from the bottom of the transcript; 0 follows the tail.
    pub transcript_scroll: usize,
    pub show_help: bool,
}

impl UiState {
    pub fn new(file: Option<PathBuf>, config: RunConfig) -> Self {
        Self {
            focus: Field::File,
            file_input: file.map(|p| p.display().to_string()).unwrap_or_default(),
            batch_size: config.batch_size.to_string(),
            max_transaction_count: config.max_transaction_count.to_string(),
            max_failure_count: config.max_failure_count.to_string(),
            info: String::new(),
            push_status: None,
            transcript_scroll: 0,
            show_help: false,
        }
    }

    pub fn input(&self, field: Field) -> &str {
        match field {
            Field::File => &self.file_input,
            Field::BatchSize => &self.batch_size,
            Field::MaxTransactionCount => &self.max_transaction_count,
            Field::MaxFailureCount => &self.max_failure_count,
        }
    }

    fn input_mut(&mut self, field: Field) -> &mut String {
        match field {
            Field::File => &mut self.file_input,
            Field::BatchSize => &mut self.batch_size,
            Field::MaxTransactionCount => &mut self.max_transaction_count,
            Field::MaxFailureCount => &mut self.max_failure_count,
        }
    }

    /// Type into the focused field. Numeric fields take digits only and stay within u32.
    pub fn type_char(&mut self, c: char) {
        let focus = self.focus;
        let buf = self.input_mut(focus);
        if focus == Field::File {
            buf.push(c);
            return;
        }
        if !c.is_ascii_digit() {
            return;
        }
        buf.push(c);
        if buf.parse::<u32>().is_err() {
            buf.pop();
        }
    }

    pub fn backspace(&mut self) {
        let focus = self.focus;
        self.input_mut(focus).pop();
    }

    pub fn selected_path(&self) -> Option<PathBuf> {
        let trimmed = self.file_input.trim();
        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed))
    }

    /// Current form values. An empty field counts as zero, which submission turns into the floor.
    pub fn run_config(&self) -> RunConfig {
        fn parse(s: &str) -> u32 {
            s.trim().parse().unwrap_or(0)
        }
        RunConfig {
            batch_size: parse(&self.batch_size),
            max_transaction_count: parse(&self.max_transaction_count),
            max_failure_count: parse(&self.max_failure_count),
        }
    }

    pub fn scroll_up(&mut self, by: usize, total_lines: usize) {
        self.transcript_scroll = (self.transcript_scroll + by).min(total_lines);
    }

    pub fn scroll_down(&mut self, by: usize) {
        self.transcript_scroll = self.transcript_scroll.saturating_sub(by);
    }
}

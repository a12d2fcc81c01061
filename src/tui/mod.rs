mod export;
mod help;
mod state;

use crate::cli::{build_client_config, build_run_config, Cli};
use crate::model::{PushStatus, RosterStatus, UiEvent, UploadOutcome};
use crate::orchestrator::{self, Session, UiCommand, WorkflowState};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph},
    Terminal,
};
use state::{Field, UiState};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{info, warn};

const SCROLL_STEP: usize = 10;

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_client_config(&args);
    let Session {
        cmd_tx,
        state_rx,
        ui_rx,
        task,
    } = orchestrator::start_session(&cfg)?;

    if let Some(file) = args.file.clone() {
        let _ = cmd_tx.send(UiCommand::SelectFile(file));
    }

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_handle = std::thread::spawn(move || run_threaded(args, state_rx, ui_rx, cmd_tx));
    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;

    // The UI thread sends Quit (or drops the command channel) before it returns.
    let res = task.await.context("controller task failed")?;

    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res
}

/// Run the TUI loop on a dedicated thread.
pub fn run_threaded(
    args: Cli,
    mut state_rx: watch::Receiver<WorkflowState>,
    mut ui_rx: UnboundedReceiver<UiEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    // UiState is owned by the UI thread only; workflow state arrives as snapshots.
    let mut ui = UiState::new(args.file.clone(), build_run_config(&args));
    let mut wf = state_rx.borrow_and_update().clone();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now()
        .checked_sub(tick_rate)
        .unwrap_or_else(Instant::now);

    let res = loop {
        while let Ok(ev) = ui_rx.try_recv() {
            match ev {
                UiEvent::Alert(msg) => ui.info = msg,
                UiEvent::Push(status) => ui.push_status = Some(status),
            }
        }
        if state_rx.has_changed().unwrap_or(false) {
            wf = state_rx.borrow_and_update().clone();
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &ui, &wf)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if !event::poll(Duration::from_millis(10)).unwrap_or(false) {
            continue;
        }
        let Ok(Event::Key(k)) = event::read() else {
            continue;
        };
        if k.kind != KeyEventKind::Press {
            continue;
        }
        let ctrl = k.modifiers.contains(KeyModifiers::CONTROL);
        match k.code {
            KeyCode::Esc => {
                let _ = cmd_tx.send(UiCommand::Quit);
                break Ok(());
            }
            KeyCode::Char('c') if ctrl => {
                let _ = cmd_tx.send(UiCommand::Quit);
                break Ok(());
            }
            KeyCode::F(1) => ui.show_help = !ui.show_help,
            KeyCode::Char('u') if ctrl => request_upload(&mut ui, &wf, &cmd_tx),
            KeyCode::F(2) => request_upload(&mut ui, &wf, &cmd_tx),
            KeyCode::Char('e') if ctrl => request_execute(&mut ui, &wf, &cmd_tx),
            KeyCode::F(5) => request_execute(&mut ui, &wf, &cmd_tx),
            KeyCode::Char('s') if ctrl => match export::save_transcript(&wf.transcript) {
                Ok(path) => {
                    info!(path = %path.display(), "transcript saved");
                    ui.info = format!("Saved: {}", path.display());
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "transcript save failed");
                    ui.info = format!("Save failed: {e:#}");
                }
            },
            KeyCode::Char('y') if ctrl => {
                ui.info = if wf.transcript.is_empty() {
                    "The execution log is empty.".into()
                } else {
                    match export::copy_to_clipboard(&wf.transcript.to_text()) {
                        Ok(()) => format!("Copied {} log lines to clipboard", wf.transcript.len()),
                        Err(e) => format!("Clipboard copy failed: {e:#}"),
                    }
                };
            }
            KeyCode::Tab => ui.focus = ui.focus.next(),
            KeyCode::BackTab => ui.focus = ui.focus.prev(),
            KeyCode::PageUp => ui.scroll_up(SCROLL_STEP, wf.transcript.len()),
            KeyCode::PageDown => ui.scroll_down(SCROLL_STEP),
            KeyCode::End => ui.transcript_scroll = 0,
            KeyCode::Enter => match ui.focus {
                Field::File if !wf.is_executing => match ui.selected_path() {
                    Some(path) => {
                        let _ = cmd_tx.send(UiCommand::SelectFile(path));
                        ui.info.clear();
                    }
                    None => ui.info = "Type the path of a mnemonic spreadsheet first.".into(),
                },
                Field::File => {}
                other => ui.focus = other.next(),
            },
            KeyCode::Backspace if !wf.is_executing => ui.backspace(),
            KeyCode::Char(c) if !ctrl && !wf.is_executing => ui.type_char(c),
            _ => {}
        }
    };

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();
    res
}

/// Select the typed path if it is not the current selection, then upload.
fn request_upload(ui: &mut UiState, wf: &WorkflowState, cmd_tx: &UnboundedSender<UiCommand>) {
    if let Some(path) = ui.selected_path() {
        let already = wf.selected_file.as_ref().map(|f| &f.path) == Some(&path);
        if !already {
            let _ = cmd_tx.send(UiCommand::SelectFile(path));
        }
    }
    ui.info.clear();
    let _ = cmd_tx.send(UiCommand::Upload);
}

fn request_execute(ui: &mut UiState, wf: &WorkflowState, cmd_tx: &UnboundedSender<UiCommand>) {
    ui.info.clear();
    ui.transcript_scroll = 0;
    if !wf.is_executing {
        let _ = cmd_tx.send(UiCommand::Execute(ui.run_config()));
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, ui: &UiState, wf: &WorkflowState) {
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(6), // Form
                Constraint::Length(3), // Upload progress
                Constraint::Min(0),    // Transcript + roster
                Constraint::Length(4), // Status
            ]
            .as_ref(),
        )
        .split(area);

    draw_form(main[0], f, ui, wf);
    draw_progress(main[1], f, wf);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)].as_ref())
        .split(main[2]);
    draw_transcript(body[0], f, ui, wf);
    draw_roster(body[1], f, wf);
    draw_status(main[3], f, ui, wf);

    if ui.show_help {
        help::draw_help(centered(area, 64, 16), f);
    }
}

fn draw_form(area: Rect, f: &mut ratatui::Frame, ui: &UiState, wf: &WorkflowState) {
    let locked = wf.is_executing;
    let lines: Vec<Line> = [
        Field::File,
        Field::BatchSize,
        Field::MaxTransactionCount,
        Field::MaxFailureCount,
    ]
    .into_iter()
    .map(|field| {
        let focused = ui.focus == field;
        let value_style = if locked {
            Style::default().fg(Color::DarkGray)
        } else if focused {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default()
        };
        let mut spans = vec![
            Span::styled(
                format!("{:<18}", format!("{}:", field.label())),
                Style::default().fg(Color::Gray),
            ),
            Span::styled(ui.input(field).to_string(), value_style),
        ];
        if focused && !locked {
            spans.push(Span::styled("_", Style::default().fg(Color::Yellow)));
        }
        if field == Field::File {
            if let Some(sel) = &wf.selected_file {
                spans.push(Span::styled(
                    format!("  (selected: {})", sel.name),
                    Style::default().fg(Color::Cyan),
                ));
            }
        }
        Line::from(spans)
    })
    .collect();

    let p = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title("sonic-batch"),
    );
    f.render_widget(p, area);
}

fn draw_progress(area: Rect, f: &mut ratatui::Frame, wf: &WorkflowState) {
    let (title, color) = match wf.upload_outcome {
        UploadOutcome::NotStarted => ("Upload", Color::Gray),
        UploadOutcome::InProgress => ("Uploading", Color::Yellow),
        UploadOutcome::Succeeded => ("Upload succeeded", Color::Green),
        UploadOutcome::Failed => ("Upload failed", Color::Red),
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(color))
        .percent(u16::from(wf.upload_progress.min(100)))
        .label(format!("{}%", wf.upload_progress));
    f.render_widget(gauge, area);
}

/// Index of the first visible line for a tail-following view scrolled `scroll` lines up.
fn transcript_window(total: usize, height: usize, scroll: usize) -> usize {
    total.saturating_sub(height).saturating_sub(scroll)
}

fn draw_transcript(area: Rect, f: &mut ratatui::Frame, ui: &UiState, wf: &WorkflowState) {
    let height = area.height.saturating_sub(2) as usize;
    let total = wf.transcript.len();
    let start = transcript_window(total, height, ui.transcript_scroll);
    let lines: Vec<Line> = wf
        .transcript
        .lines()
        .skip(start)
        .take(height)
        .map(|l| Line::from(l.to_string()))
        .collect();

    let mut title = format!("Execution log ({total} lines)");
    if wf.transcript.dropped() > 0 {
        title.push_str(&format!(", {} earlier dropped", wf.transcript.dropped()));
    }
    if ui.transcript_scroll > 0 {
        title.push_str(" [scrolled]");
    }
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_roster(area: Rect, f: &mut ratatui::Frame, wf: &WorkflowState) {
    let (title, items): (String, Vec<ListItem>) = match &wf.roster_status {
        RosterStatus::Idle => ("Mnemonic list".into(), Vec::new()),
        RosterStatus::Pending => (
            "Mnemonic list".into(),
            vec![ListItem::new("Loading...")],
        ),
        RosterStatus::Unavailable(reason) => (
            "Mnemonic list unavailable".into(),
            vec![ListItem::new(reason.clone()).style(Style::default().fg(Color::Red))],
        ),
        RosterStatus::Loaded => {
            let preview = wf.roster_preview();
            (
                preview.header(),
                preview.lines().into_iter().map(ListItem::new).collect(),
            )
        }
    };
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(list, area);
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, ui: &UiState, wf: &WorkflowState) {
    let push = match &ui.push_status {
        Some(PushStatus::Open) => Span::styled("open", Style::default().fg(Color::Green)),
        Some(PushStatus::Closed { reason }) => Span::styled(
            format!("closed: {reason}"),
            Style::default().fg(Color::Red),
        ),
        Some(other) => Span::styled(other.label(), Style::default().fg(Color::Yellow)),
        None => Span::raw("-"),
    };
    let mut first = vec![Span::styled("Log channel: ", Style::default().fg(Color::Gray)), push];
    if wf.is_executing {
        first.push(Span::raw("   "));
        first.push(Span::styled(
            "Please wait...",
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ));
    } else if wf.completed_cycles > 0 {
        first.push(Span::raw(format!("   Runs started: {}", wf.completed_cycles)));
    }

    let second = if ui.info.is_empty() {
        Line::from(Span::styled(
            "Ctrl-U read mnemonics  Ctrl-E start execution  Ctrl-S save log  F1 help  Esc quit",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        Line::from(Span::styled(ui.info.clone(), Style::default().fg(Color::Cyan)))
    };

    let p = Paragraph::new(vec![Line::from(first), second])
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(p, area);
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let w = width.min(area.width);
    let h = height.min(area.height);
    Rect {
        x: area.x + (area.width - w) / 2,
        y: area.y + (area.height - h) / 2,
        width: w,
        height: h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_window_follows_tail() {
        assert_eq!(transcript_window(100, 20, 0), 80);
        assert_eq!(transcript_window(100, 20, 30), 50);
        assert_eq!(transcript_window(100, 20, 500), 0);
        assert_eq!(transcript_window(5, 20, 0), 0);
    }

    #[test]
    fn centered_rect_fits_inside() {
        let area = Rect::new(0, 0, 40, 10);
        let r = centered(area, 64, 16);
        assert_eq!(r, area);
        let r = centered(Rect::new(0, 0, 100, 40), 64, 16);
        assert_eq!((r.x, r.y, r.width, r.height), (18, 12, 64, 16));
    }
}

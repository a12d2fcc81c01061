use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

const KEYS: &[(&str, &str)] = &[
    ("Tab / Shift-Tab", "Next / previous field"),
    ("Enter", "Select the typed spreadsheet path (file field)"),
    ("Ctrl-U / F2", "Read mnemonics (upload the spreadsheet)"),
    ("Ctrl-E / F5", "Start execution (send config, then run)"),
    ("PgUp / PgDn", "Scroll the execution log"),
    ("End", "Follow the newest log lines"),
    ("Ctrl-S", "Save the log to a file"),
    ("Ctrl-Y", "Copy the log to the clipboard"),
    ("F1", "Toggle this help"),
    ("Esc / Ctrl-C", "Quit"),
];

pub fn draw_help(area: Rect, f: &mut Frame) {
    let mut lines = vec![Line::from("Keybinds:")];
    for (key, what) in KEYS {
        lines.push(Line::from(vec![
            Span::raw("  "),
            Span::styled(format!("{key:<16}"), Style::default().fg(Color::Magenta)),
            Span::raw(*what),
        ]));
    }
    lines.push(Line::from(""));
    lines.push(Line::from(
        "Zero or empty numbers are sent as the minimums 2 / 3 / 1.",
    ));

    f.render_widget(Clear, area);
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}

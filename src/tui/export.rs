use crate::orchestrator::Transcript;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::OnceLock;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;

// Global clipboard manager channel - initialized once on first use
static CLIPBOARD_SENDER: OnceLock<std_mpsc::Sender<String>> = OnceLock::new();

fn transcript_file_name(at: OffsetDateTime) -> String {
    let stamp = at
        .format(format_description!(
            "[year][month][day]-[hour][minute][second]"
        ))
        .unwrap_or_else(|_| at.unix_timestamp().to_string());
    format!("sonic-batch-log-{stamp}.txt")
}

/// Write the visible transcript to a timestamped file in `dir`.
/// Returns the absolute path of the written file.
pub fn save_transcript_to(dir: &Path, transcript: &Transcript) -> Result<PathBuf> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let path = dir.join(transcript_file_name(now));
    let mut body = transcript.to_text();
    if !body.is_empty() {
        body.push('\n');
    }
    std::fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Save into the current working directory.
pub fn save_transcript(transcript: &Transcript) -> Result<PathBuf> {
    let current_dir = std::env::current_dir().context("get current directory")?;
    save_transcript_to(&current_dir, transcript)
}

/// Initialize the clipboard manager thread if not already initialized.
/// Each copy gets its own clipboard instance, kept alive long enough for
/// clipboard managers on Linux to read it.
fn init_clipboard_manager() -> Result<&'static std_mpsc::Sender<String>> {
    CLIPBOARD_SENDER.get_or_init(|| {
        let (tx, rx) = std_mpsc::channel::<String>();

        std::thread::spawn(move || {
            use arboard::Clipboard;

            for text in rx {
                match Clipboard::new() {
                    Ok(mut clipboard) => {
                        if let Err(e) = clipboard.set_text(&text) {
                            tracing::warn!(error = %e, "clipboard write failed");
                            continue;
                        }
                        std::thread::sleep(Duration::from_secs(2));
                    }
                    Err(e) => tracing::warn!(error = %e, "clipboard unavailable"),
                }
            }
        });

        tx
    });

    CLIPBOARD_SENDER
        .get()
        .ok_or_else(|| anyhow::anyhow!("Failed to initialize clipboard manager"))
}

/// Queue text for the clipboard without blocking the UI thread.
pub fn copy_to_clipboard(text: &str) -> Result<()> {
    let sender = init_clipboard_manager()?;
    sender
        .send(text.to_string())
        .map_err(|_| anyhow::anyhow!("Clipboard manager channel closed"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn file_name_is_sortable_timestamp() {
        let at = datetime!(2026-03-04 05:06:07 UTC);
        assert_eq!(
            transcript_file_name(at),
            "sonic-batch-log-20260304-050607.txt"
        );
    }

    #[test]
    fn saves_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = Transcript::default();
        t.push("Config updated");
        t.push("batch 1 done");

        let path = save_transcript_to(dir.path(), &t).unwrap();
        assert!(path.starts_with(dir.path()));
        let written = std::fs::read_to_string(path).unwrap();
        assert_eq!(written, "Config updated\nbatch 1 done\n");
    }
}

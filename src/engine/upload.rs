use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use tokio::sync::mpsc;

/// Chunk size for upload stream generation (64 KB)
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Latest upload percentage for one upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressTick {
    pub attempt: u64,
    pub percent: u8,
}

/// Sends progress ticks for a single upload attempt back to the controller.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    attempt: u64,
    tx: mpsc::UnboundedSender<ProgressTick>,
}

impl ProgressReporter {
    pub fn new(attempt: u64, tx: mpsc::UnboundedSender<ProgressTick>) -> Self {
        Self { attempt, tx }
    }

    pub fn report(&self, percent: u8) {
        let _ = self.tx.send(ProgressTick {
            attempt: self.attempt,
            percent,
        });
    }
}

/// `round(sent * 100 / total)`, clamped to 0..=100. An empty body counts as complete.
pub fn progress_percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = ((sent as f64) * 100.0 / (total as f64)).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Turn the file contents into a chunked body stream that reports progress as it goes.
///
/// Bytes are counted as chunks are *produced* for reqwest, which tracks what has been
/// handed to the transport closely enough for a progress bar.
pub fn progress_stream(
    data: Bytes,
    reporter: ProgressReporter,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let total = data.len() as u64;
    if total == 0 {
        reporter.report(100);
    }

    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| data.slice(start..(start + UPLOAD_CHUNK_SIZE).min(data.len())))
        .collect();

    let mut sent = 0u64;
    let mut last_reported: Option<u8> = None;
    stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        let pct = progress_percent(sent, total);
        if last_reported != Some(pct) {
            reporter.report(pct);
            last_reported = Some(pct);
        }
        Ok::<Bytes, std::io::Error>(chunk)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_to_nearest() {
        assert_eq!(progress_percent(0, 200), 0);
        assert_eq!(progress_percent(1, 200), 1); // 0.5 rounds up
        assert_eq!(progress_percent(133, 400), 33);
        assert_eq!(progress_percent(200, 200), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[tokio::test]
    async fn stream_reports_monotonic_progress_ending_at_100() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data = Bytes::from(vec![7u8; 200 * 1024]);
        let body: Vec<Bytes> = progress_stream(data.clone(), ProgressReporter::new(3, tx))
            .map(|c| c.unwrap())
            .collect()
            .await;

        let rebuilt: Vec<u8> = body.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(rebuilt, data.to_vec());
        assert_eq!(body.len(), 4);

        let mut ticks = Vec::new();
        while let Ok(t) = rx.try_recv() {
            assert_eq!(t.attempt, 3);
            ticks.push(t.percent);
        }
        assert_eq!(ticks, vec![32, 64, 96, 100]);
    }

    #[tokio::test]
    async fn empty_file_reports_complete_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunks: Vec<_> = progress_stream(Bytes::new(), ProgressReporter::new(1, tx))
            .collect()
            .await;
        assert!(chunks.is_empty());
        assert_eq!(rx.try_recv().unwrap().percent, 100);
    }
}

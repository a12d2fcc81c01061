//! Execution log push channel.
//!
//! One WebSocket connection per process. Every inbound data frame becomes one
//! transcript line; nothing is ever sent besides the closing handshake. Reconnect
//! is opt-in via [`ReconnectPolicy`].

use crate::error::PushError;
use crate::model::{ClientConfig, PushStatus, ReconnectPolicy};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Status(PushStatus),
    Line(String),
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub url: String,
    pub idle_timeout: Option<Duration>,
    pub reconnect: ReconnectPolicy,
}

impl From<&ClientConfig> for PushSettings {
    fn from(cfg: &ClientConfig) -> Self {
        Self {
            url: cfg.push_url.clone(),
            idle_timeout: cfg.push_idle_timeout,
            reconnect: cfg.reconnect.clone(),
        }
    }
}

/// Owned handle to the receiver task. Released by [`PushChannel::close`]; dropping it aborts the task.
pub struct PushChannel {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PushChannel {
    pub fn open(settings: PushSettings, event_tx: mpsc::UnboundedSender<PushEvent>) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_receiver(settings, event_tx, shutdown_rx));
        Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Send the closing handshake and wait briefly for the receiver to wind down.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                warn!("push channel did not close in time; aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        // In Tokio, dropping a JoinHandle does not cancel the task.
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based), before jitter.
pub fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32) as i32;
    let secs = policy.initial_backoff.as_secs_f64() * policy.multiplier.max(1.0).powi(exp);
    Duration::from_secs_f64(secs.min(policy.max_backoff.as_secs_f64()).max(0.0))
}

fn with_jitter(delay: Duration) -> Duration {
    let extra: f64 = rand::thread_rng().gen_range(0.0..0.1);
    delay.mul_f64(1.0 + extra)
}

enum SessionEnd {
    Shutdown,
    Lost(PushError),
}

async fn run_receiver(
    settings: PushSettings,
    event_tx: mpsc::UnboundedSender<PushEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut attempt = 0u32;
    loop {
        let _ = event_tx.send(PushEvent::Status(PushStatus::Connecting));
        let mut opened = false;
        let err = match session(&settings, &event_tx, &mut shutdown, &mut opened).await {
            SessionEnd::Shutdown => {
                info!("push channel closed");
                let _ = event_tx.send(PushEvent::Status(PushStatus::Closed {
                    reason: "client shutdown".into(),
                }));
                return;
            }
            SessionEnd::Lost(err) => err,
        };
        if opened {
            attempt = 0;
        }
        warn!(error = %err, "push channel lost");

        if !settings.reconnect.enabled {
            let _ = event_tx.send(PushEvent::Status(PushStatus::Closed {
                reason: err.to_string(),
            }));
            return;
        }

        attempt += 1;
        if attempt > settings.reconnect.max_attempts {
            let _ = event_tx.send(PushEvent::Status(PushStatus::Closed {
                reason: format!("gave up after {} attempts: {err}", attempt - 1),
            }));
            return;
        }

        let delay = with_jitter(backoff_delay(&settings.reconnect, attempt));
        let _ = event_tx.send(PushEvent::Status(PushStatus::Reconnecting {
            attempt,
            delay_ms: delay.as_millis() as u64,
        }));
        tokio::select! {
            _ = &mut shutdown => {
                let _ = event_tx.send(PushEvent::Status(PushStatus::Closed {
                    reason: "client shutdown".into(),
                }));
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn session(
    settings: &PushSettings,
    event_tx: &mpsc::UnboundedSender<PushEvent>,
    shutdown: &mut oneshot::Receiver<()>,
    opened: &mut bool,
) -> SessionEnd {
    let ws = tokio::select! {
        _ = &mut *shutdown => return SessionEnd::Shutdown,
        res = connect_async(settings.url.as_str()) => match res {
            Ok((ws, _)) => ws,
            Err(source) => {
                return SessionEnd::Lost(PushError::Connect {
                    url: settings.url.clone(),
                    source,
                })
            }
        },
    };
    *opened = true;
    info!(url = %settings.url, "push channel open");
    let _ = event_tx.send(PushEvent::Status(PushStatus::Open));

    let (mut write, mut read) = ws.split();
    loop {
        let next = async {
            match settings.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, read.next())
                    .await
                    .map_err(|_| PushError::IdleTimeout(limit)),
                None => Ok(read.next().await),
            }
        };

        let line = tokio::select! {
            _ = &mut *shutdown => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            msg = next => match msg {
                Err(idle) => return SessionEnd::Lost(idle),
                Ok(None) => return SessionEnd::Lost(PushError::Closed("stream ended".into())),
                Ok(Some(Err(e))) => return SessionEnd::Lost(PushError::Closed(e.to_string())),
                Ok(Some(Ok(msg))) => match msg {
                    Message::Text(text) => text.to_string(),
                    Message::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                    Message::Close(frame) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "close frame received".into());
                        return SessionEnd::Lost(PushError::Closed(reason));
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                },
            },
        };

        debug!(line = %line, "push line");
        if event_tx.send(PushEvent::Line(line)).is_err() {
            // Nobody is listening any more.
            let _ = write.send(Message::Close(None)).await;
            return SessionEnd::Shutdown;
        }
    }
}

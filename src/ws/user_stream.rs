//! User-data stream: listen-key lifecycle, execution-report fan-in,
//! reconnection with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result};
use crate::exchange::Exchange;
use crate::ws::{ExecutionReport, EVENT_CHANNEL_CAPACITY};

/// Listen keys expire after 60 minutes; refresh at half that.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Manages the user-data stream and forwards execution reports into a
/// bounded channel consumed by the event ingestor.
pub struct UserStream {
    exchange: Arc<dyn Exchange>,
    ws_base: String,
    events_tx: mpsc::Sender<ExecutionReport>,
}

impl UserStream {
    /// Create the stream manager and the receiving half of its channel.
    pub fn new(
        exchange: Arc<dyn Exchange>,
        ws_base: impl Into<String>,
    ) -> (Self, mpsc::Receiver<ExecutionReport>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                exchange,
                ws_base: ws_base.into(),
                events_tx,
            },
            events_rx,
        )
    }

    /// Run until shutdown. Reconnects with exponential backoff and jitter on
    /// connection loss; the listen key is closed on the way out.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut delay = INITIAL_RECONNECT_DELAY;

        loop {
            let listen_key = match self.exchange.start_user_stream().await {
                Ok(key) => {
                    info!(target: "grid_trader::stream", "Listen key acquired");
                    key
                }
                Err(e) => {
                    error!(target: "grid_trader::stream", error = %e, "Failed to start user stream");
                    tokio::select! {
                        _ = tokio::time::sleep(jittered(delay)) => {
                            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                            continue;
                        }
                        _ = shutdown.recv() => return,
                    }
                }
            };

            match self.read_session(&listen_key, &mut shutdown).await {
                SessionEnd::Shutdown => {
                    let _ = self.exchange.close_user_stream(&listen_key).await;
                    info!(target: "grid_trader::stream", "User stream closed");
                    return;
                }
                SessionEnd::LostAfterConnect => {
                    // The session was healthy before it dropped.
                    delay = INITIAL_RECONNECT_DELAY;
                    warn!(
                        target: "grid_trader::stream",
                        reconnect_in = ?delay,
                        "User stream connection lost, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(jittered(delay)) => {}
                        _ = shutdown.recv() => {
                            let _ = self.exchange.close_user_stream(&listen_key).await;
                            return;
                        }
                    }
                }
                SessionEnd::ConnectFailed => {
                    tokio::select! {
                        _ = tokio::time::sleep(jittered(delay)) => {
                            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                        }
                        _ = shutdown.recv() => {
                            let _ = self.exchange.close_user_stream(&listen_key).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One connected session. Returns how it ended.
    async fn read_session(
        &self,
        listen_key: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let url = format!("{}/{}", self.ws_base, listen_key);
        let (ws, _) = match connect_async(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(target: "grid_trader::stream", error = %e, "WebSocket connect failed");
                return SessionEnd::ConnectFailed;
            }
        };
        info!(target: "grid_trader::stream", "User stream connected");

        let (_, mut reader) = ws.split();
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.recv() => return SessionEnd::Shutdown,
                _ = keepalive.tick() => {
                    if let Err(e) = self.exchange.keepalive_user_stream(listen_key).await {
                        error!(target: "grid_trader::stream", error = %e, "Listen key keepalive failed");
                    } else {
                        debug!(target: "grid_trader::stream", "Listen key keepalive sent");
                    }
                }
                frame = reader.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.dispatch(&text).await {
                                warn!(target: "grid_trader::stream", error = %e, "Dropped stream message");
                            }
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::LostAfterConnect,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(target: "grid_trader::stream", error = %e, "WebSocket read error");
                            return SessionEnd::LostAfterConnect;
                        }
                    }
                }
            }
        }
    }

    /// Forward `executionReport` events; everything else on the stream
    /// (account position snapshots, balance updates) is ignored.
    async fn dispatch(&self, text: &str) -> Result<()> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::JsonParse(e.to_string()))?;
        if value.get("e").and_then(Value::as_str) != Some("executionReport") {
            return Ok(());
        }

        let report: ExecutionReport =
            serde_json::from_value(value).map_err(|e| Error::JsonParse(e.to_string()))?;
        self.events_tx
            .send(report)
            .await
            .map_err(|_| Error::Websocket("event channel closed".to_string()))
    }
}

enum SessionEnd {
    Shutdown,
    LostAfterConnect,
    ConnectFailed,
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    delay.mul_f64(factor)
}

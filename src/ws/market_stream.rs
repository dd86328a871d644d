//! Public book-ticker stream for the primary symbol.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{error, info, warn};

use crate::types::Ticker;
use crate::ws::{BookTickerUpdate, EVENT_CHANNEL_CAPACITY};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Streams best bid/ask updates into a bounded channel.
pub struct MarketStream {
    ws_base: String,
    symbol: String,
    ticks_tx: mpsc::Sender<Ticker>,
}

impl MarketStream {
    pub fn new(
        ws_base: impl Into<String>,
        symbol: impl Into<String>,
    ) -> (Self, mpsc::Receiver<Ticker>) {
        let (ticks_tx, ticks_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                ws_base: ws_base.into(),
                symbol: symbol.into(),
                ticks_tx,
            },
            ticks_rx,
        )
    }

    /// Run until shutdown, reconnecting on connection loss.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let url = format!("{}/{}@bookTicker", self.ws_base, self.symbol.to_lowercase());

        loop {
            let (ws, _) = match connect_async(&url).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(target: "grid_trader::stream", error = %e, "Market stream connect failed");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                        _ = shutdown.recv() => return,
                    }
                }
            };
            info!(target: "grid_trader::stream", symbol = %self.symbol, "Market stream connected");

            let (_, mut reader) = ws.split();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    frame = reader.next() => {
                        match frame {
                            Some(Ok(Message::Text(text))) => self.forward(&text).await,
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!(target: "grid_trader::stream", error = %e, "Market stream read error");
                                break;
                            }
                        }
                    }
                }
            }

            warn!(
                target: "grid_trader::stream",
                reconnect_in = ?RECONNECT_DELAY,
                "Market stream closed, reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.recv() => return,
            }
        }
    }

    async fn forward(&self, text: &str) {
        let Ok(update) = serde_json::from_str::<BookTickerUpdate>(text) else {
            return;
        };
        let (Ok(bid), Ok(ask)) = (update.bid_price.parse(), update.ask_price.parse()) else {
            warn!(target: "grid_trader::stream", "Unparseable book ticker prices");
            return;
        };

        let ticker = Ticker {
            symbol: update.symbol,
            bid,
            ask,
        };
        // A newer tick supersedes a dropped one; never block the reader.
        if self.ticks_tx.try_send(ticker).is_err() {
            warn!(target: "grid_trader::stream", "Tick channel full, dropping update");
        }
    }
}

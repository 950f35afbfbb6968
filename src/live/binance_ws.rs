//! Aggregated-trades websocket source.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::live::{LiveEvent, LiveSource};
use crate::parser;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Websocket source for one symbol's aggTrade stream.
pub struct BinanceWsSource {
    url: String,
    write: Option<SplitSink<WsStream, Message>>,
    read: Option<SplitStream<WsStream>>,
    last_ping: Instant,
    messages: u64,
}

impl BinanceWsSource {
    pub fn new(url: String) -> Self {
        Self {
            url,
            write: None,
            read: None,
            last_ping: Instant::now(),
            messages: 0,
        }
    }
}

#[async_trait]
impl LiveSource for BinanceWsSource {
    async fn connect(&mut self) -> Result<()> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| EngineError::Transient(format!("websocket connect: {e}")))?;
        let (write, read) = stream.split();
        self.write = Some(write);
        self.read = Some(read);
        self.last_ping = Instant::now();
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut write) = self.write.take() {
            let _ = write.send(Message::Close(None)).await;
        }
        self.read = None;
    }

    async fn subscribe(&mut self, _symbol: &str, _channels: &[&str]) -> Result<()> {
        // The stream URL already encodes symbol and channel; nothing to send.
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<LiveEvent>> {
        let read = self
            .read
            .as_mut()
            .ok_or_else(|| EngineError::Transient("websocket not connected".into()))?;

        if self.last_ping.elapsed() >= PING_INTERVAL {
            self.last_ping = Instant::now();
            if let Some(write) = self.write.as_mut() {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    return Err(EngineError::Transient(format!("ping failed: {e}")));
                }
            }
        }

        let message = match tokio::time::timeout(POLL_TIMEOUT, read.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(EngineError::Transient("websocket stream ended".into())),
            Ok(Some(Err(e))) => return Err(EngineError::Transient(format!("websocket read: {e}"))),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                self.messages += 1;
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| EngineError::Parse(format!("websocket payload: {e}")))?;
                // Combined-stream frames nest the event under "data".
                let payload = value.get("data").unwrap_or(&value);
                let event_type = payload.get("e").and_then(Value::as_str).unwrap_or("");
                if !event_type.is_empty() && event_type != "aggTrade" && event_type != "trade" {
                    return Ok(None);
                }
                match parser::parse_agg_trade(payload) {
                    Ok(trade) => Ok(Some(LiveEvent::Trade(trade))),
                    Err(e) => {
                        debug!(error = %e, "skipping unparseable stream trade");
                        Ok(None)
                    }
                }
            }
            Message::Ping(data) => {
                if let Some(write) = self.write.as_mut() {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Ok(None)
            }
            Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => Ok(None),
            Message::Close(frame) => {
                warn!(?frame, "websocket closed by peer");
                Err(EngineError::Transient("websocket closed".into()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.read.is_some()
    }

    fn health(&self) -> Value {
        json!({
            "transport": "websocket",
            "url": self.url,
            "connected": self.is_connected(),
            "messages": self.messages,
        })
    }
}

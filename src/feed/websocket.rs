use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};

use crate::schema::{Candle, SymbolInfo, Task};
use crate::util;

use super::{ChartSession, MarketDataClient, MarketEvent};

/// JSON-over-WebSocket market-data client.
///
/// FRAMING:
/// - Outgoing: one `subscribe` object per session
/// - Incoming: `symbol_loaded`, `update`, `error` objects;
///   anything else (heartbeats, acks) is ignored
///
/// DESIGN PRINCIPLES:
/// - Pure protocol translation into `MarketEvent`
/// - No retry logic (the orchestrator owns retries)
pub struct WsFeedClient {
    url: String,
}

impl WsFeedClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl MarketDataClient for WsFeedClient {

    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, task: &Task) -> Result<Box<dyn ChartSession>> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("connecting to {}", self.url))?;

        Ok(Box::new(WsChartSession {
            ws,
            token: task.token.clone(),
            signature: task.signature.clone(),
        }))
    }
}

struct WsChartSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    token: String,
    signature: String,
}

#[async_trait::async_trait]
impl ChartSession for WsChartSession {

    async fn set_market(&mut self, task: &Task) -> Result<()> {
        let sub = build_subscribe_message(task, &self.token, &self.signature);
        self.ws
            .send(Message::Text(sub.to_string().into()))
            .await
            .context("sending subscribe message")?;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<MarketEvent> {
        while let Some(msg) = self.ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Some(event) = parse_frame(text.as_str()) {
                        return Some(event);
                    }
                }

                Ok(Message::Close(_)) => return None,

                // Ignore non-text frames (ping/pong/binary)
                Ok(_) => {}

                Err(e) => return Some(MarketEvent::Error(format!("websocket error: {e}"))),
            }
        }

        None
    }

    async fn end(&mut self) -> Result<()> {
        self.ws.close(None).await.context("closing websocket")?;
        Ok(())
    }
}

/// Builds the subscribe payload for one chart session.
///
/// Task options are merged last so callers can override the
/// defaults (e.g. `"adjustment": "splits"`).
pub fn build_subscribe_message(task: &Task, token: &str, signature: &str) -> Value {
    let mut chart = json!({
        "symbol": task.symbol,
        "timeframe": task.timeframe,
        "range": task.range,
    });

    if let Some(obj) = chart.as_object_mut() {
        for (k, v) in &task.options {
            obj.insert(k.clone(), v.clone());
        }
    }

    json!({
        "op": "subscribe",
        "id": util::now_ms(),
        "auth": {
            "token": token,
            "signature": signature,
        },
        "chart": chart,
    })
}

/// Parses a raw text frame into a `MarketEvent`.
///
/// RETURNS:
/// - `None` for heartbeats, acks and unknown frames
/// - `Some(MarketEvent::Error)` for provider errors and malformed
///   update payloads
///
/// This function must never panic.
pub fn parse_frame(raw: &str) -> Option<MarketEvent> {
    let v: Value = serde_json::from_str(raw).ok()?;

    match v.get("type")?.as_str()? {
        "symbol_loaded" => {
            let info = v
                .get("info")
                .cloned()
                .and_then(|i| serde_json::from_value::<SymbolInfo>(i).ok())
                .unwrap_or_default();
            Some(MarketEvent::SymbolLoaded(info))
        }

        "update" => {
            let periods = v.get("periods").cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<Vec<Candle>>(periods) {
                Ok(candles) => Some(MarketEvent::DataUpdate(candles)),
                Err(e) => Some(MarketEvent::Error(format!("malformed update frame: {e}"))),
            }
        }

        "error" => {
            let message = v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown provider error");
            Some(MarketEvent::Error(message.to_string()))
        }

        _ => None,
    }
}

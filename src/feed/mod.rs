//! Market-data client contract.
//!
//! This module provides:
//! - The `MarketDataClient` / `ChartSession` traits consumed by workers
//! - The `MarketEvent` contract (symbol loaded, data update, error)
//! - A factory resolving the concrete client a worker should use
//!
//! Provider-specific wire handling must live in dedicated client
//! modules. The worker state machine interacts exclusively through
//! these traits.

pub mod websocket;

#[cfg(test)]
pub mod scripted;

use std::sync::Arc;

use anyhow::Result;

use crate::schema::{Candle, SymbolInfo, Task};

/// Lifecycle events emitted by a chart session.
///
/// IMPORTANT:
/// - `DataUpdate` may carry either a cumulative snapshot or an
///   incremental slice. Consumers merge by candle `time`.
/// - `Error` is not necessarily the last event, but consumers
///   treat it as fatal for the current task.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    SymbolLoaded(SymbolInfo),
    DataUpdate(Vec<Candle>),
    Error(String),
}

/// Opens sessions against a market-data provider.
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - A single client instance may open several sessions
///
#[async_trait::async_trait]
pub trait MarketDataClient: Send + Sync {

    /// Short identifier used in logs (e.g. "websocket").
    fn name(&self) -> &'static str;

    /// Establishes a connection using the task's credentials.
    ///
    /// Connection failures are returned as `Err` and are retryable
    /// from the orchestrator's point of view.
    async fn open(&self, task: &Task) -> Result<Box<dyn ChartSession>>;
}

/// One open chart session for exactly one symbol.
#[async_trait::async_trait]
pub trait ChartSession: Send {

    /// Requests `task.range` candles of `task.symbol` on `task.timeframe`.
    async fn set_market(&mut self, task: &Task) -> Result<()>;

    /// Waits for the next lifecycle event.
    ///
    /// RETURNS:
    /// - `None` once the session is closed by the provider
    async fn next_event(&mut self) -> Option<MarketEvent>;

    /// Tears the session down. Callers treat errors as best-effort.
    async fn end(&mut self) -> Result<()>;
}

/// Returns the client used by worker processes.
///
/// The websocket client is the only built-in provider; tests plug
/// their own `MarketDataClient` into the worker runtime directly.
pub fn default_client(url: &str) -> Arc<dyn MarketDataClient> {
    Arc::new(websocket::WsFeedClient::new(url))
}

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default timeframe when a symbol request does not name one.
pub const DEFAULT_TIMEFRAME: &str = "D";

/// Default candle count when a symbol request does not name one.
pub const DEFAULT_RANGE: u32 = 1000;

/// Worker deadline used when a task arrives without one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

// ------------------------------------------------------------
// Symbol request
// ------------------------------------------------------------
//
// Raw entry handed to `Crawler::add_symbols`, either from the
// configuration file or from a discovery helper.
//
// Every field is optional at this stage; validation into a
// `Task` happens in `SymbolRequest::into_task`.
//
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SymbolRequest {
    /// Provider symbol (e.g. "BINANCE:BTCUSDT")
    #[serde(default)]
    pub symbol: Option<String>,

    /// Timeframe code (e.g. "D", "60", "15")
    #[serde(default)]
    pub timeframe: Option<String>,

    /// Number of candles to collect
    #[serde(default)]
    pub range: Option<u32>,

    /// Provider-specific options, forwarded untouched
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl SymbolRequest {
    pub fn new(symbol: &str, timeframe: &str, range: u32) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            timeframe: Some(timeframe.to_string()),
            range: Some(range),
            options: Map::new(),
        }
    }

    /// Validates the request and turns it into a queueable task.
    ///
    /// Returns the reason as `Err` when the entry must be dropped.
    pub fn into_task(self) -> Result<Task, String> {
        let symbol = match self.symbol.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return Err("missing symbol".to_string()),
        };

        let range = self.range.unwrap_or(DEFAULT_RANGE);
        if range == 0 {
            return Err(format!("range must be positive for {symbol}"));
        }

        let timeframe = self
            .timeframe
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TIMEFRAME.to_string());

        Ok(Task {
            symbol,
            timeframe,
            range,
            options: self.options,
            retries: 0,
            timeout_ms: 0,
            token: String::new(),
            signature: String::new(),
        })
    }
}

// ------------------------------------------------------------
// Task
// ------------------------------------------------------------
//
// One crawl request as it travels through the queue and over
// IPC to a worker.
//
// IMPORTANT:
// - `retries` is the only field that changes after creation.
// - `timeout_ms`, `token` and `signature` are stamped by the
//   orchestrator right before the task is sent to a worker.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Task {
    pub symbol: String,
    pub timeframe: String,
    pub range: u32,

    #[serde(default)]
    pub options: Map<String, Value>,

    /// Number of times this task has been re-enqueued after failure
    #[serde(default)]
    pub retries: u32,

    /// Worker-side collection deadline in milliseconds
    #[serde(default)]
    pub timeout_ms: u64,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub signature: String,
}

impl Task {
    pub fn timeout(&self) -> Duration {
        match self.timeout_ms {
            0 => Duration::from_millis(DEFAULT_TIMEOUT_MS),
            ms => Duration::from_millis(ms),
        }
    }

    /// Returns the copy that goes back into the queue after a failure.
    pub fn next_attempt(&self) -> Task {
        Task {
            retries: self.retries + 1,
            ..self.clone()
        }
    }
}

// ------------------------------------------------------------
// Candle
// ------------------------------------------------------------
//
// One OHLCV period. `time` is unix seconds and is the identity
// used to merge cumulative snapshots.
//
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,

    #[serde(default)]
    pub volume: f64,
}

// ------------------------------------------------------------
// Symbol metadata
// ------------------------------------------------------------
//
// Whatever the provider reports on symbol load. Only the
// description is interpreted (for logging); everything else
// is kept verbatim.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct SymbolInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ------------------------------------------------------------
// Collected result
// ------------------------------------------------------------
//
// Final payload of a successful worker. This exact shape is
// written to `<output_dir>/<symbol>.json`.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CollectedResult {
    pub symbol: String,
    pub timeframe: String,
    pub periods: Vec<Candle>,
    pub info: Option<SymbolInfo>,
}

impl CollectedResult {
    pub fn empty(task: &Task) -> Self {
        Self {
            symbol: task.symbol.clone(),
            timeframe: task.timeframe.clone(),
            periods: Vec::new(),
            info: None,
        }
    }
}

// ------------------------------------------------------------
// Stats / snapshots
// ------------------------------------------------------------

/// Process-wide task counters owned by the orchestrator.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub total: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Value delivered by `wait_for_completion` and by `stop`.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct CrawlReport {
    pub results: BTreeMap<String, CollectedResult>,
    pub errors: BTreeMap<String, String>,
    pub stats: Stats,
}

/// Memory usage of the orchestrator process.
#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub rss_mb: u64,
    pub total_mb: u64,
    pub percentage: f64,
}

/// One in-flight worker as seen by `status()`.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ActiveWorker {
    pub id: String,
    pub symbol: String,
    pub attempt: u32,
    pub started_at: String,
    pub pid: Option<u32>,
}

/// Snapshot returned by `Crawler::status`.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct CrawlStatus {
    pub running: bool,
    pub throttled: bool,
    pub active_workers: usize,
    pub queued_tasks: usize,
    pub completed_symbols: usize,
    pub failed_symbols: usize,
    pub stats: Stats,
    pub workers: Vec<ActiveWorker>,
    pub memory: Option<MemorySnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

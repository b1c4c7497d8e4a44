use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::schema::SymbolRequest;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Top-level structure loaded from `crawler.json`.
//
// It defines:
// - Crawler (orchestrator) options
// - The market-data feed the workers connect to
// - The initial symbol list
//
// Every section has defaults, so `{}` is a valid file.
//
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub symbols: Vec<SymbolRequest>,
}

// ------------------------------------------------------------
// Crawler configuration
// ------------------------------------------------------------
//
// Options of the orchestrator.
//
// Notes:
// - `token` / `signature` are forwarded to every worker and
//   must not be committed to version control.
// - Durations are plain milliseconds to keep the file format
//   flat.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Concurrency ceiling (default: CPU count - 1, min 1)
    pub max_workers: usize,

    /// Per-task deadline in milliseconds
    pub timeout_ms: u64,

    /// Maximum re-queues per task
    pub retries: u32,

    /// Directory receiving one JSON file per symbol
    pub output_dir: PathBuf,

    /// Provider session token
    pub token: String,

    /// Provider session signature
    pub signature: String,

    /// Minimum spacing between two worker spawns
    pub throttle_delay_ms: u64,

    /// Memory ceiling (percent of system memory) before throttling
    pub max_memory_usage: f64,

    /// Memory cap per worker process in MB
    pub worker_memory_limit_mb: u64,

    /// Grace period granted to each worker on `stop()`
    pub stop_grace_ms: u64,

    /// Grace period granted to a worker after its hard timeout fired
    pub timeout_kill_grace_ms: u64,

    /// Added to `timeout_ms` for the orchestrator-side hard timeout,
    /// so the worker's own deadline can report partial data first
    pub hard_timeout_slack_ms: u64,

    /// Resource monitor polling interval
    pub monitor_interval_ms: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            timeout_ms: 30_000,
            retries: 3,
            output_dir: PathBuf::from("./data"),
            token: String::new(),
            signature: String::new(),
            throttle_delay_ms: 500,
            max_memory_usage: 80.0,
            worker_memory_limit_mb: 300,
            stop_grace_ms: 5_000,
            timeout_kill_grace_ms: 2_000,
            hard_timeout_slack_ms: 2_000,
            monitor_interval_ms: 1_000,
        }
    }
}

impl CrawlerConfig {
    /// Deadline enforced by the orchestrator, independent of the worker.
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms + self.hard_timeout_slack_ms)
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn timeout_kill_grace(&self) -> Duration {
        Duration::from_millis(self.timeout_kill_grace_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    /// `max_workers` with the lower bound of one slot applied.
    pub fn worker_slots(&self) -> usize {
        self.max_workers.max(1)
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

// ------------------------------------------------------------
// Feed configuration
// ------------------------------------------------------------
//
// Where worker processes open their market-data session.
//
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedConfig {
    /// WebSocket URL of the market-data provider
    pub url: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/feed".to_string(),
        }
    }
}

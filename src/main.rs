// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:   Configuration structs loaded from JSON
// - schema:   Task, candle, result and status definitions
// - util:     Shared helpers (time, symbol names, memory, signals)
// - ipc:      Parent <-> worker JSON-lines protocol
// - feed:     Market-data client used inside workers
// - worker:   Worker process runtime (one task per process)
// - crawler:  Orchestrator (queue, pool, retries, throttling)
// - metrics:  Process-wide runtime counters
//
mod config;
mod schema;
mod util;
mod ipc;
mod feed;
mod worker;
mod crawler;
mod metrics;
// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use anyhow::Context;
use log::{error, info, warn};
use rustls::crypto::{CryptoProvider, ring};

use config::Config;
use crawler::Crawler;
use metrics::METRICS;
use worker::WorkerArgs;

use std::fs;

const DEFAULT_CONFIG_PATH: &str = "crawler.json";

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// One binary, two roles:
//
//     symbol-crawler [config.json]     orchestrator
//     symbol-crawler worker [args]     single-task worker process
//
// The orchestrator re-executes itself in worker mode for every
// task, so a crashing or leaking session never takes the whole
// crawl down.
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation, once, before any TLS connection is made.
    // An Err here only means one is already installed.
    // --------------------------------------------------------
    let _ = CryptoProvider::install_default(ring::default_provider());

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let first = args.next();

    if first.as_deref() == Some("worker") {
        let code = worker::run(WorkerArgs::parse(args)).await;
        std::process::exit(code);
    }

    // --------------------------------------------------------
    // Load configuration from disk
    //
    // NOTE:
    // - The config file contains provider credentials.
    // - It must not be committed to version control.
    // --------------------------------------------------------
    let path = first.unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&path)?;

    let crawler = Crawler::with_processes(config.crawler, &config.feed.url)?;

    if crawler.add_symbols(config.symbols) == 0 {
        warn!("No symbols configured in {path}, nothing to crawl");
        return Ok(());
    }

    crawler.start().await?;

    // --------------------------------------------------------
    // Run until the queue drains, or until SIGINT / SIGTERM.
    // Either way `stop()` leaves no worker process behind, and
    // an interrupted run still reports what it collected.
    // --------------------------------------------------------
    let completion = crawler.wait_for_completion();
    tokio::pin!(completion);

    let report = tokio::select! {
        report = &mut completion => report?,
        signal = util::shutdown_signal() => {
            info!("Received {signal}, shutting down");
            crawler.stop().await?;
            completion.await?
        }
    };

    crawler.cleanup().await?;

    info!(
        "Finished: {} completed, {} retried, {} failed (of {})",
        report.stats.completed, report.stats.retried, report.stats.failed, report.stats.total
    );
    for (symbol, reason) in &report.errors {
        error!("{symbol}: {reason}");
    }
    info!("[METRICS] {}", METRICS.summary());

    Ok(())
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads a JSON configuration file from disk and deserializes
// it into the strongly typed `Config` structure.
//
fn load_config(path: &str) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let cfg = serde_json::from_str(&data).with_context(|| format!("parsing {path}"))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "crawler": {{ "max_workers": 2 }}, "symbols": [ {{ "symbol": "BINANCE:BTCUSDT" }} ] }}"#
        )
        .unwrap();

        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.crawler.max_workers, 2);
        assert_eq!(cfg.symbols.len(), 1);
    }

    #[test]
    fn missing_config_names_the_path() {
        let err = load_config("/definitely/not/here.json").unwrap_err();
        assert!(format!("{err:#}").contains("/definitely/not/here.json"));
    }
}

/// Utility helpers shared by the orchestrator and the workers.
///
/// This module contains:
/// - Symbol → file name conversion
/// - Time helpers
/// - Process / system memory readers
///
/// IMPORTANT:
/// - No orchestration logic should live here.
/// - Readers return `anyhow::Result`; callers decide whether a
///   failure matters.
///

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};

/// Convert a provider symbol into a file-system safe name.
///
/// Examples:
/// - "BINANCE:BTCUSDT" -> "BINANCE_BTCUSDT"
/// - "FX:EUR/USD"      -> "FX_EUR_USD"
///
pub fn sanitize_symbol(symbol: &str) -> String {
    symbol.replace([':', '/'], "_")
}

/// Returns the current Unix timestamp in milliseconds.
///
/// Falls back to 0 if the system clock is before UNIX_EPOCH.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn bytes_to_mb(bytes: u64) -> u64 {
    bytes / 1024 / 1024
}

// ------------------------------------------------------------
// Memory readers
// ------------------------------------------------------------
//
// Linux exposes both values through procfs:
// - /proc/self/status  → VmRSS  (resident set of this process)
// - /proc/meminfo      → MemTotal
//
// Both report kB.
//

/// Resident set size of the calling process, in bytes.
pub fn process_rss_bytes() -> Result<u64> {
    let status = std::fs::read_to_string("/proc/self/status")
        .context("reading /proc/self/status")?;
    parse_kb_field(&status, "VmRSS:")
}

/// Total physical memory of the machine, in bytes.
pub fn system_total_bytes() -> Result<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")
        .context("reading /proc/meminfo")?;
    parse_kb_field(&meminfo, "MemTotal:")
}

/// Extracts a `<key>   <n> kB` line and returns it in bytes.
fn parse_kb_field(text: &str, key: &str) -> Result<u64> {
    let line = text
        .lines()
        .find(|l| l.starts_with(key))
        .ok_or_else(|| anyhow!("{key} not found"))?;

    let kb: u64 = line[key.len()..]
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("{key} has no value"))?
        .parse()
        .with_context(|| format!("parsing {key}"))?;

    Ok(kb * 1024)
}

// ------------------------------------------------------------
// Shutdown signals
// ------------------------------------------------------------
//
// Resolves with the name of the first interrupt / terminate
// signal received. Used by the binary (to call `stop()`) and by
// worker processes (to run their cleanup path).
//
#[cfg(unix)]
pub async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigint, mut sigterm) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(i), Ok(t)) => (i, t),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("cannot register signal handlers: {e}");
                return std::future::pending().await;
            }
        };

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "CTRL-C",
        Err(e) => {
            log::warn!("cannot register ctrl-c handler: {e}");
            std::future::pending().await
        }
    }
}

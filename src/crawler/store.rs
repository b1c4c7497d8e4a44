use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::metrics::{METRICS, RuntimeMetrics};
use crate::schema::CollectedResult;
use crate::util;

/// Per-symbol JSON artifact writer.
///
/// Layout: `<dir>/<sanitized-symbol>.json`, pretty-printed,
/// overwritten on every successful fetch of the same symbol.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.json", util::sanitize_symbol(symbol)))
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))
    }

    /// Writes one result.
    ///
    /// RETURNS:
    /// - `Ok(None)` when the payload is empty and nothing was written
    /// - `Ok(Some(path))` after a successful write
    pub async fn persist(&self, symbol: &str, data: &CollectedResult) -> Result<Option<PathBuf>> {
        if data.periods.is_empty() {
            warn!("No valid data received for {symbol}, skipping save");
            return Ok(None);
        }

        let path = self.path_for(symbol);
        let json = serde_json::to_string_pretty(data)
            .with_context(|| format!("serializing result for {symbol}"))?;

        let written = tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()));

        match written {
            Ok(()) => {
                RuntimeMetrics::incr(&METRICS.results_persisted);
                info!("Saved data for {symbol} to {}", path.display());
                Ok(Some(path))
            }
            Err(e) => {
                RuntimeMetrics::incr(&METRICS.persist_errors);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::scripted::candles;

    fn result(symbol: &str, n: usize) -> CollectedResult {
        CollectedResult {
            symbol: symbol.to_string(),
            timeframe: "15".to_string(),
            periods: candles(0, n),
            info: None,
        }
    }

    #[tokio::test]
    async fn writes_pretty_json_under_sanitized_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("out"));
        store.ensure_dir().await.unwrap();

        let path = store
            .persist("BINANCE:BTC/USDT", &result("BINANCE:BTC/USDT", 3))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(path.file_name().unwrap(), "BINANCE_BTC_USDT.json");
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  \"symbol\""));
        let back: CollectedResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back.periods.len(), 3);
    }

    #[tokio::test]
    async fn overwrites_previous_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());

        store.persist("X", &result("X", 5)).await.unwrap();
        let path = store.persist("X", &result("X", 2)).await.unwrap().unwrap();

        let back: CollectedResult =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back.periods.len(), 2);
    }

    #[tokio::test]
    async fn empty_payload_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path());

        assert_eq!(store.persist("X", &result("X", 0)).await.unwrap(), None);
        assert!(!store.path_for("X").exists());
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("does/not/exist"));
        assert!(store.persist("X", &result("X", 1)).await.is_err());
    }
}

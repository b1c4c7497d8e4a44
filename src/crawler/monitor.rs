use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::schema::MemorySnapshot;
use crate::util;

use super::engine::Event;

/// Fraction of the ceiling below which throttling is released.
pub const RELEASE_RATIO: f64 = 0.8;

/// One memory reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            rss_mb: util::bytes_to_mb(self.used_bytes),
            total_mb: util::bytes_to_mb(self.total_bytes),
            percentage: (self.percentage() * 10.0).round() / 10.0,
        }
    }
}

/// Source of memory readings for the resource monitor.
pub trait MemoryProbe: Send + Sync {
    fn sample(&self) -> Result<MemorySample>;
}

/// Reads the orchestrator's own RSS against total system memory.
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn sample(&self) -> Result<MemorySample> {
        Ok(MemorySample {
            used_bytes: util::process_rss_bytes()?,
            total_bytes: util::system_total_bytes()?,
        })
    }
}

/// Outcome of one hysteresis evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleChange {
    Engage,
    Release,
    Unchanged,
}

/// Two-threshold hysteresis.
///
/// - above `ceiling`                  → engage
/// - below `ceiling * RELEASE_RATIO`  → release (only if engaged)
/// - anything in between keeps the current state
pub fn evaluate(throttled: bool, percentage: f64, ceiling: f64) -> ThrottleChange {
    if percentage > ceiling {
        if throttled {
            ThrottleChange::Unchanged
        } else {
            ThrottleChange::Engage
        }
    } else if throttled && percentage < ceiling * RELEASE_RATIO {
        ThrottleChange::Release
    } else {
        ThrottleChange::Unchanged
    }
}

/// Polls the probe every `interval` and posts the reading to the
/// engine. Stops once the engine is gone or the handle is aborted.
pub fn spawn(
    probe: Arc<dyn MemoryProbe>,
    interval: Duration,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            let reading = probe.sample().map_err(|e| format!("{e:#}"));
            if events.send(Event::Memory(reading)).is_err() {
                break;
            }
        }
    })
}

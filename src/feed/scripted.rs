//! Scripted market-data client for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};

use crate::schema::{Candle, Task};

use super::{ChartSession, MarketDataClient, MarketEvent};

#[derive(Debug, Clone)]
pub enum Step {
    Event(MarketEvent),
    Wait(Duration),
    Close,
}

/// Plays back a fixed list of steps, then hangs forever.
#[derive(Clone, Default)]
pub struct ScriptedClient {
    pub steps: Vec<Step>,
    pub refuse: Option<String>,
    pub ended: Arc<AtomicUsize>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    pub fn refusing(reason: &str) -> Self {
        Self {
            refuse: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn end_calls(&self) -> usize {
        self.ended.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MarketDataClient for ScriptedClient {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn open(&self, _task: &Task) -> Result<Box<dyn ChartSession>> {
        if let Some(reason) = &self.refuse {
            bail!("{reason}");
        }
        Ok(Box::new(ScriptedSession {
            steps: self.steps.iter().cloned().collect(),
            ended: self.ended.clone(),
        }))
    }
}

struct ScriptedSession {
    steps: VecDeque<Step>,
    ended: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ChartSession for ScriptedSession {
    async fn set_market(&mut self, _task: &Task) -> Result<()> {
        Ok(())
    }

    async fn next_event(&mut self) -> Option<MarketEvent> {
        loop {
            match self.steps.pop_front() {
                Some(Step::Event(e)) => return Some(e),
                Some(Step::Wait(d)) => tokio::time::sleep(d).await,
                Some(Step::Close) => return None,
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn end(&mut self) -> Result<()> {
        self.ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// `count` one-minute candles starting at `from`.
pub fn candles(from: i64, count: usize) -> Vec<Candle> {
    (0..count as i64)
        .map(|i| Candle {
            time: from + i * 60,
            open: 100.0 + i as f64,
            high: 101.0 + i as f64,
            low: 99.0 + i as f64,
            close: 100.5 + i as f64,
            volume: 1_000.0,
        })
        .collect()
}

pub fn update(from: i64, count: usize) -> Step {
    Step::Event(MarketEvent::DataUpdate(candles(from, count)))
}

//! Orchestrator.
//!
//! `Crawler` is a cheap handle over an `engine::Engine` task that
//! owns the queue, the worker pool and every result. Workers are
//! started through a `WorkerLauncher`, memory is read through a
//! `MemoryProbe`, both swappable for tests.

pub mod engine;
pub mod launcher;
pub mod monitor;
pub mod store;

#[cfg(test)]
mod fake;

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::CrawlerConfig;
use crate::schema::{CollectedResult, CrawlReport, CrawlStatus, SymbolRequest, Task};

use engine::{Command, Completion, Engine};
use launcher::{ProcessLauncher, WorkerLauncher};
use monitor::{MemoryProbe, ProcMemoryProbe};

#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("crawler engine has shut down")]
    EngineGone,

    #[error("completion signal dropped before resolving")]
    CompletionDropped,
}

pub struct Crawler {
    commands: mpsc::UnboundedSender<Command>,
}

impl Crawler {
    /// Spawns the engine on the current tokio runtime.
    pub fn new(
        config: CrawlerConfig,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let engine = Engine::new(config, launcher, probe, event_tx);
        tokio::spawn(engine.run(cmd_rx, event_rx));

        Self { commands: cmd_tx }
    }

    /// Production wiring: OS worker processes and /proc memory.
    pub fn with_processes(config: CrawlerConfig, feed_url: &str) -> anyhow::Result<Self> {
        let launcher = ProcessLauncher::current_exe(config.worker_memory_limit_mb, feed_url)?;
        Ok(Self::new(
            config,
            Arc::new(launcher),
            Arc::new(ProcMemoryProbe),
        ))
    }

    /// Queues requests, dropping invalid entries with a warning.
    /// Returns how many tasks were queued.
    pub fn add_symbols(&self, requests: Vec<SymbolRequest>) -> usize {
        if requests.is_empty() {
            warn!("No valid symbols provided to add_symbols");
            return 0;
        }

        let tasks: Vec<Task> = requests
            .into_iter()
            .filter_map(|request| match request.into_task() {
                Ok(task) => Some(task),
                Err(reason) => {
                    warn!("Skipping symbol entry: {reason}");
                    None
                }
            })
            .collect();

        if tasks.is_empty() {
            warn!("No valid symbols provided to add_symbols");
            return 0;
        }

        let count = tasks.len();
        if self.commands.send(Command::Enqueue(tasks)).is_err() {
            error!("crawler engine is gone, dropping {count} symbols");
            return 0;
        }

        info!("Added {count} symbols to crawl queue");
        count
    }

    /// Begins admitting queued tasks. No-op when already running.
    pub async fn start(&self) -> Result<(), CrawlerError> {
        self.request(Command::Start).await
    }

    /// Terminates every worker and resolves a pending completion
    /// with whatever was collected. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<(), CrawlerError> {
        self.request(Command::Stop).await
    }

    pub async fn cleanup(&self) -> Result<(), CrawlerError> {
        self.stop().await
    }

    pub async fn status(&self) -> Result<CrawlStatus, CrawlerError> {
        self.request(Command::Status).await
    }

    pub async fn results(&self) -> Result<BTreeMap<String, CollectedResult>, CrawlerError> {
        self.request(Command::Results).await
    }

    pub async fn errors(&self) -> Result<BTreeMap<String, String>, CrawlerError> {
        self.request(Command::Errors).await
    }

    /// Resolves once queue and pool are both empty, or when `stop`
    /// interrupts the run. All concurrent waiters get the same report.
    pub async fn wait_for_completion(&self) -> Result<CrawlReport, CrawlerError> {
        match self.request(Command::Wait).await? {
            Completion::Ready(report) => Ok(report),
            Completion::Pending(signal) => signal.await.map_err(|_| CrawlerError::CompletionDropped),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CrawlerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| CrawlerError::EngineGone)?;
        rx.await.map_err(|_| CrawlerError::EngineGone)
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::feed::{ChartSession, MarketDataClient, MarketEvent};
use crate::ipc::WorkerMessage;
use crate::schema::{Candle, CollectedResult, SymbolInfo, Task};

/// Upper bound for the best-effort session teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Execution states of a worker.
///
/// Idle → Connecting → Collecting → {Reporting, TimedOut, Errored} → Terminated
///
/// `TimedOut` always moves on to either `Reporting` (partial data)
/// or `Errored` (nothing collected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Connecting,
    Collecting,
    Reporting,
    TimedOut,
    Errored,
    Terminated,
}

/// Terminal outcome of one task attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Report(CollectedResult),
    Failed(String),
}

// ------------------------------------------------------------
// Reporter
// ------------------------------------------------------------
//
// Worker → parent message sink.
//
// GUARANTEES:
// - At most one terminal message (`result` / `error`) per
//   reporter family (clones share the guard)
// - Log lines are fire-and-forget
//
#[derive(Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    reported: Arc<AtomicBool>,
}

impl Reporter {
    pub fn new(tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            tx,
            reported: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn log(&self, data: impl Into<String>) {
        let data = data.into();
        debug!("{data}");
        let _ = self.tx.send(WorkerMessage::Log { data });
    }

    /// Sends the terminal message for this worker.
    ///
    /// Returns `false` if a terminal message was already sent.
    pub fn report(&self, outcome: Outcome) -> bool {
        if self.reported.swap(true, Ordering::SeqCst) {
            warn!("terminal message already sent, dropping {outcome:?}");
            return false;
        }

        let msg = match outcome {
            Outcome::Report(data) => WorkerMessage::Result { data },
            Outcome::Failed(error) => WorkerMessage::Error { error },
        };
        self.tx.send(msg).is_ok()
    }
}

// ------------------------------------------------------------
// Task runner
// ------------------------------------------------------------
//
// Drives the market-data client for exactly one task.
//
// RESPONSIBILITIES:
// - Session setup (Connecting)
// - Merging cumulative / incremental updates (Collecting)
// - Racing collection against the task timeout
// - Session teardown (Terminated)
//
// NOT RESPONSIBLE FOR:
// - IPC framing (see worker::serve)
// - Exit codes
//
pub struct TaskRunner {
    task: Task,
    reporter: Reporter,
    state: WorkerState,
    session: Option<Box<dyn ChartSession>>,
    periods: BTreeMap<i64, Candle>,
    info: Option<SymbolInfo>,
}

impl TaskRunner {
    pub fn new(task: Task, reporter: Reporter) -> Self {
        Self {
            task,
            reporter,
            state: WorkerState::Idle,
            session: None,
            periods: BTreeMap::new(),
            info: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn collected(&self) -> usize {
        self.periods.len()
    }

    fn transition(&mut self, next: WorkerState) {
        debug!("[{}] {:?} -> {:?}", self.task.symbol, self.state, next);
        self.state = next;
    }

    /// Runs the task until it has a terminal outcome.
    ///
    /// The outcome is returned, not sent; the caller reports it.
    pub async fn run(&mut self, client: &dyn MarketDataClient) -> Outcome {
        let deadline = tokio::time::sleep(self.task.timeout());
        tokio::pin!(deadline);

        let raced = tokio::select! {
            outcome = self.collect(client) => Some(outcome),
            _ = &mut deadline => None,
        };

        let outcome = match raced {
            Some(outcome) => outcome,
            None => self.on_deadline(),
        };

        self.settle(outcome)
    }

    /// Marks the runner as failed for a reason found outside `run`
    /// (e.g. the memory watchdog).
    pub fn fail(&mut self, reason: String) -> Outcome {
        self.transition(WorkerState::Errored);
        Outcome::Failed(reason)
    }

    async fn collect(&mut self, client: &dyn MarketDataClient) -> Outcome {
        self.transition(WorkerState::Connecting);

        let session = match client.open(&self.task).await {
            Ok(s) => self.session.insert(s),
            Err(e) => {
                return Outcome::Failed(format!(
                    "Connection failed for {}: {e:#}",
                    self.task.symbol
                ));
            }
        };

        if let Err(e) = session.set_market(&self.task).await {
            return Outcome::Failed(format!(
                "Failed to request {}: {e:#}",
                self.task.symbol
            ));
        }

        self.transition(WorkerState::Collecting);

        loop {
            let event = match self.session.as_mut() {
                Some(s) => s.next_event().await,
                None => None,
            };

            match event {
                Some(MarketEvent::SymbolLoaded(info)) => self.on_symbol_loaded(info),

                Some(MarketEvent::DataUpdate(candles)) => {
                    if self.on_update(candles) {
                        return Outcome::Report(self.snapshot());
                    }
                }

                Some(MarketEvent::Error(msg)) => {
                    return Outcome::Failed(format!("Chart error: {msg}"));
                }

                None => return self.on_closed(),
            }
        }
    }

    fn on_symbol_loaded(&mut self, info: SymbolInfo) {
        let description = info
            .description
            .clone()
            .unwrap_or_else(|| self.task.symbol.clone());
        self.reporter.log(format!("Symbol loaded: {description}"));
        self.info = Some(info);
    }

    /// Merges an update by candle time. Returns `true` once the
    /// requested range is reached.
    fn on_update(&mut self, candles: Vec<Candle>) -> bool {
        if candles.is_empty() {
            return false;
        }

        for candle in candles {
            self.periods.insert(candle.time, candle);
        }

        self.reporter.log(format!(
            "Collected {} candles for {}",
            self.periods.len(),
            self.task.symbol
        ));

        self.periods.len() >= self.task.range as usize
    }

    fn on_deadline(&mut self) -> Outcome {
        self.transition(WorkerState::TimedOut);

        if self.periods.is_empty() {
            return Outcome::Failed(format!(
                "Timeout after {}ms while crawling {}",
                self.task.timeout().as_millis(),
                self.task.symbol
            ));
        }

        self.reporter.log(format!(
            "Timeout reached, but returning partial data ({} candles) for {}",
            self.periods.len(),
            self.task.symbol
        ));
        Outcome::Report(self.snapshot())
    }

    fn on_closed(&mut self) -> Outcome {
        if self.periods.is_empty() {
            return Outcome::Failed(format!(
                "Session closed before any data for {}",
                self.task.symbol
            ));
        }

        self.reporter.log(format!(
            "Session closed, returning partial data ({} candles) for {}",
            self.periods.len(),
            self.task.symbol
        ));
        Outcome::Report(self.snapshot())
    }

    /// Final validation before the outcome leaves the runner.
    fn settle(&mut self, outcome: Outcome) -> Outcome {
        match outcome {
            Outcome::Report(result) if result.periods.is_empty() => {
                self.fail(format!("Invalid data received for {}", self.task.symbol))
            }
            Outcome::Report(result) => {
                self.transition(WorkerState::Reporting);
                Outcome::Report(result)
            }
            Outcome::Failed(reason) => self.fail(reason),
        }
    }

    fn snapshot(&self) -> CollectedResult {
        CollectedResult {
            info: self.info.clone(),
            periods: self.periods.values().copied().collect(),
            ..CollectedResult::empty(&self.task)
        }
    }

    /// Tears the session down. Safe to call more than once.
    pub async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            match tokio::time::timeout(TEARDOWN_TIMEOUT, session.end()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("[{}] session teardown failed: {e:#}", self.task.symbol),
                Err(_) => debug!("[{}] session teardown timed out", self.task.symbol),
            }
        }

        if self.state != WorkerState::Terminated {
            self.transition(WorkerState::Terminated);
        }
    }
}

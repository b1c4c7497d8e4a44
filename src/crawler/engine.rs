use std::any::Any;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::Shared;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CrawlerConfig;
use crate::ipc::{ParentMessage, WorkerMessage};
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::schema::{
    ActiveWorker, CollectedResult, CrawlReport, CrawlStatus, MemorySnapshot, Stats, Task,
};
use crate::util;

use super::launcher::{WorkerExit, WorkerLauncher};
use super::monitor::{self, MemoryProbe, MemorySample, ThrottleChange};
use super::store::ResultStore;

/// Delay before re-running admission after a worker terminated.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Resource log cadence, in monitor samples.
const RESOURCE_LOG_EVERY: u64 = 10;

pub type WorkerId = String;

/// Completion signal shared by every concurrent waiter.
pub type SharedReport = Shared<oneshot::Receiver<CrawlReport>>;

/// Answer to a `wait_for_completion` request.
pub enum Completion {
    Ready(CrawlReport),
    Pending(SharedReport),
}

/// Requests coming from the `Crawler` handle.
pub enum Command {
    Enqueue(Vec<Task>),
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    Status(oneshot::Sender<CrawlStatus>),
    Results(oneshot::Sender<BTreeMap<String, CollectedResult>>),
    Errors(oneshot::Sender<BTreeMap<String, String>>),
    Wait(oneshot::Sender<Completion>),
}

/// Everything else the engine reacts to.
pub enum Event {
    Message { id: WorkerId, msg: WorkerMessage },
    Exited { id: WorkerId, exit: WorkerExit },
    HardTimeout(WorkerId),
    ForceKill(WorkerId),
    Memory(Result<MemorySample, String>),
}

/// Orchestrator-owned state of one in-flight worker.
///
/// A handle holds its pool slot until the process exits. Once its
/// task is settled by the hard timeout, later messages are ignored
/// and `timer` is the pending force-kill instead of the deadline.
struct WorkerHandle {
    task: Task,
    seq: u64,
    settled: bool,
    pid: Option<u32>,
    started: Instant,
    started_at: DateTime<Utc>,
    retries_at_spawn: u32,
    timer: Option<JoinHandle<()>>,
    outbound: mpsc::UnboundedSender<ParentMessage>,
    kill: Option<oneshot::Sender<()>>,
}

/// A worker that already delivered its terminal message but whose
/// process has not exited yet. It no longer occupies a slot.
struct Retired {
    symbol: String,
    kill: Option<oneshot::Sender<()>>,
    grace: JoinHandle<()>,
}

// ------------------------------------------------------------
// Engine
// ------------------------------------------------------------
//
// Single owner of the queue, the worker pool and all result
// bookkeeping. Commands and events are processed one at a time
// by `run`, so no handler ever observes a half-applied update.
//
pub struct Engine {
    config: CrawlerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn MemoryProbe>,
    store: ResultStore,
    events: mpsc::UnboundedSender<Event>,

    queue: VecDeque<Task>,
    active: HashMap<WorkerId, WorkerHandle>,
    retired: HashMap<WorkerId, Retired>,
    results: BTreeMap<String, CollectedResult>,
    errors: BTreeMap<String, String>,
    stats: Stats,
    /// Tasks whose workers exited during `stop()`, keyed by spawn order
    interrupted: Vec<(u64, Task)>,

    running: bool,
    throttled: bool,
    stopping: bool,
    detached: bool,

    monitor: Option<JoinHandle<()>>,
    memory: Option<MemorySnapshot>,
    samples: u64,

    completion: Option<(oneshot::Sender<CrawlReport>, SharedReport)>,
    stop_waiters: Vec<oneshot::Sender<()>>,

    admit_at: Option<Instant>,
    last_spawn: Option<Instant>,
    spawn_seq: u64,
}

impl Engine {
    pub fn new(
        config: CrawlerConfig,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn MemoryProbe>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let store = ResultStore::new(config.output_dir.clone());
        Self {
            config,
            launcher,
            probe,
            store,
            events,
            queue: VecDeque::new(),
            active: HashMap::new(),
            retired: HashMap::new(),
            results: BTreeMap::new(),
            errors: BTreeMap::new(),
            stats: Stats::default(),
            interrupted: Vec::new(),
            running: false,
            throttled: false,
            stopping: false,
            detached: false,
            monitor: None,
            memory: None,
            samples: 0,
            completion: None,
            stop_waiters: Vec::new(),
            admit_at: None,
            last_spawn: None,
            spawn_seq: 0,
        }
    }

    /// Event loop. Returns once the `Crawler` handle is dropped and
    /// every worker is gone.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            if self.detached && self.active.is_empty() && self.retired.is_empty() {
                break;
            }

            let admit_at = self.admit_at;

            let step = AssertUnwindSafe(async {
                tokio::select! {
                    cmd = commands.recv(), if !self.detached => match cmd {
                        Some(cmd) => self.on_command(cmd).await,
                        None => {
                            debug!("crawler handle dropped, shutting down");
                            self.detached = true;
                            self.begin_stop(None);
                        }
                    },

                    Some(event) = events.recv() => self.on_event(event).await,

                    _ = sleep_until(admit_at) => {
                        self.admit_at = None;
                        self.admit().await;
                    }
                }
            });

            if let Err(panic) = step.catch_unwind().await {
                error!(
                    "orchestrator fault: {}; stopping all workers",
                    panic_message(panic.as_ref())
                );
                self.begin_stop(None);
            }
        }
    }

    // --------------------------------------------------------
    // Commands
    // --------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue(tasks) => {
                self.stats.total += tasks.len() as u64;
                self.queue.extend(tasks);
                if self.running {
                    self.schedule_admission(Duration::ZERO);
                }
            }

            Command::Start(reply) => {
                self.start().await;
                let _ = reply.send(());
            }

            Command::Stop(reply) => self.begin_stop(Some(reply)),

            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }

            Command::Results(reply) => {
                let _ = reply.send(self.results.clone());
            }

            Command::Errors(reply) => {
                let _ = reply.send(self.errors.clone());
            }

            Command::Wait(reply) => {
                let answer = if self.queue.is_empty() && self.active.is_empty() {
                    Completion::Ready(self.report())
                } else {
                    Completion::Pending(self.completion_signal())
                };
                let _ = reply.send(answer);
            }
        }
    }

    async fn start(&mut self) {
        if self.running {
            return;
        }
        if self.stopping {
            warn!("start requested while stopping, ignoring");
            return;
        }

        self.running = true;
        info!("Starting crawler with max {} workers", self.config.worker_slots());

        if let Err(e) = self.store.ensure_dir().await {
            error!("Error creating output directory: {e:#}");
        }

        self.monitor = Some(monitor::spawn(
            self.probe.clone(),
            self.config.monitor_interval(),
            self.events.clone(),
        ));

        self.schedule_admission(Duration::ZERO);
    }

    // --------------------------------------------------------
    // Admission
    // --------------------------------------------------------

    /// Arms the admission timer, never earlier than the spawn
    /// spacing allows.
    fn schedule_admission(&mut self, delay: Duration) {
        let mut at = Instant::now() + delay;
        if let Some(last) = self.last_spawn {
            at = at.max(last + self.config.throttle_delay());
        }
        self.admit_at = Some(match self.admit_at {
            Some(current) => current.min(at),
            None => at,
        });
    }

    async fn admit(&mut self) {
        if !self.running || self.throttled {
            self.check_completion();
            return;
        }

        if self.active.len() < self.config.worker_slots() {
            if let Some(task) = self.queue.pop_front() {
                self.spawn_worker(task).await;
                self.last_spawn = Some(Instant::now());
                self.schedule_admission(self.config.throttle_delay());
                return;
            }
        }

        self.check_completion();
    }

    async fn spawn_worker(&mut self, mut task: Task) {
        task.timeout_ms = self.config.timeout_ms;
        task.token = self.config.token.clone();
        task.signature = self.config.signature.clone();

        info!(
            "Spawning worker for {} (timeframe: {}, range: {}, attempt: {})",
            task.symbol,
            task.timeframe,
            task.range,
            task.retries + 1
        );

        let channel = match self.launcher.launch(&task).await {
            Ok(channel) => channel,
            Err(e) => {
                RuntimeMetrics::incr(&METRICS.spawn_errors);
                error!("Failed to spawn worker for {}: {e:#}", task.symbol);
                self.retry_or_fail(task, format!("{e:#}"));
                self.schedule_admission(SETTLE_DELAY);
                return;
            }
        };
        RuntimeMetrics::incr(&METRICS.workers_spawned);

        if channel
            .outbound
            .send(ParentMessage::Start { task: task.clone() })
            .is_err()
        {
            error!("Failed to send task to worker for {}", task.symbol);
            let _ = channel.kill.send(());
            self.retry_or_fail(task, "Failed to send task to worker".to_string());
            self.schedule_admission(SETTLE_DELAY);
            return;
        }

        self.spawn_seq += 1;
        let id = format!("{}_{}_{}", task.symbol, util::now_ms(), self.spawn_seq);

        forward(self.events.clone(), id.clone(), channel.inbound, channel.exit);
        let timeout = post_after(
            self.events.clone(),
            self.config.hard_timeout(),
            Event::HardTimeout(id.clone()),
        );

        self.active.insert(
            id,
            WorkerHandle {
                retries_at_spawn: task.retries,
                seq: self.spawn_seq,
                settled: false,
                task,
                pid: channel.pid,
                started: Instant::now(),
                started_at: Utc::now(),
                timer: Some(timeout),
                outbound: channel.outbound,
                kill: Some(channel.kill),
            },
        );
    }

    // --------------------------------------------------------
    // Worker events
    // --------------------------------------------------------

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Message { id, msg } => self.on_message(id, msg).await,
            Event::Exited { id, exit } => self.on_exit(id, exit),
            Event::HardTimeout(id) => self.on_hard_timeout(id),
            Event::ForceKill(id) => self.on_force_kill(&id),
            Event::Memory(reading) => self.on_memory(reading),
        }
    }

    async fn on_message(&mut self, id: WorkerId, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Log { data } => {
                let symbol = self
                    .active
                    .get(&id)
                    .map(|h| h.task.symbol.as_str())
                    .or_else(|| self.retired.get(&id).map(|r| r.symbol.as_str()))
                    .unwrap_or(id.as_str());
                info!("[{symbol}] {data}");
            }

            WorkerMessage::Result { data } => {
                let Some(handle) = self.take_unsettled(&id) else {
                    warn!(
                        "Discarding late result from worker {id} ({} periods), task already settled",
                        data.periods.len()
                    );
                    return;
                };
                info!(
                    "Worker for {} completed in {}ms",
                    handle.task.symbol,
                    handle.started.elapsed().as_millis()
                );
                self.record_success(&handle.task, data).await;
                self.retire(id, handle, self.config.timeout_kill_grace());
                self.after_termination();
            }

            WorkerMessage::Error { error } => {
                let Some(handle) = self.take_unsettled(&id) else {
                    warn!("Discarding late error from worker {id}, task already settled: {error}");
                    return;
                };
                error!("Error crawling {}: {error}", handle.task.symbol);
                self.retry_or_fail(handle.task.clone(), error);
                self.retire(id, handle, self.config.timeout_kill_grace());
                self.after_termination();
            }
        }
    }

    /// Removes the handle unless its task was already settled.
    fn take_unsettled(&mut self, id: &str) -> Option<WorkerHandle> {
        if self.active.get(id)?.settled {
            return None;
        }
        self.active.remove(id)
    }

    fn on_exit(&mut self, id: WorkerId, exit: WorkerExit) {
        if let Some(mut handle) = self.active.remove(&id) {
            if let Some(timer) = handle.timer.take() {
                timer.abort();
            }

            if handle.settled {
                debug!("timed-out worker for {} {}", handle.task.symbol, exit.describe());
            } else if self.stopping {
                info!(
                    "Worker for {} stopped before reporting, returning task to queue",
                    handle.task.symbol
                );
                self.interrupted.push((handle.seq, handle.task));
            } else {
                let reason = if exit.success() {
                    "Worker exited without reporting a result".to_string()
                } else {
                    format!("Worker {}", exit.describe())
                };
                warn!(
                    "Worker for {} {} after {}ms",
                    handle.task.symbol,
                    exit.describe(),
                    handle.started.elapsed().as_millis()
                );
                self.retry_or_fail(handle.task, reason);
            }

            self.after_termination();
        } else if let Some(retired) = self.retired.remove(&id) {
            retired.grace.abort();
            debug!("retired worker for {} {}", retired.symbol, exit.describe());
        }

        self.finish_stop_if_idle();
    }

    /// Settles the task but keeps the slot until the process exits.
    fn on_hard_timeout(&mut self, id: WorkerId) {
        let grace = self.config.timeout_kill_grace();
        let Some(handle) = self.active.get_mut(&id) else {
            return;
        };
        if handle.settled {
            return;
        }

        warn!(
            "Worker for {} timed out after {}ms",
            handle.task.symbol,
            self.config.hard_timeout().as_millis()
        );
        handle.settled = true;
        let _ = handle.outbound.send(ParentMessage::Timeout);
        handle.timer = Some(post_after(self.events.clone(), grace, Event::ForceKill(id)));

        let task = handle.task.clone();
        self.retry_or_fail(task, "Task timed out".to_string());
    }

    fn on_force_kill(&mut self, id: &str) {
        let kill = match (self.active.get_mut(id), self.retired.get_mut(id)) {
            (Some(handle), _) => handle.kill.take(),
            (None, Some(retired)) => retired.kill.take(),
            (None, None) => None,
        };

        if let Some(kill) = kill {
            warn!("Force killing worker {id} after grace period");
            RuntimeMetrics::incr(&METRICS.workers_killed);
            let _ = kill.send(());
        }
    }

    fn on_memory(&mut self, reading: Result<MemorySample, String>) {
        if !self.running {
            return;
        }

        let sample = match reading {
            Ok(sample) => sample,
            Err(e) => {
                error!("Error monitoring resources: {e}");
                return;
            }
        };

        self.samples += 1;
        let snapshot = sample.snapshot();
        self.memory = Some(snapshot);

        if self.samples % RESOURCE_LOG_EVERY == 0 {
            info!(
                "Memory usage: {}MB / {}MB ({}%), active workers: {}, queued tasks: {}",
                snapshot.rss_mb,
                snapshot.total_mb,
                snapshot.percentage,
                self.active.len(),
                self.queue.len()
            );
            info!("[METRICS] {}", METRICS.summary());
        }

        let ceiling = self.config.max_memory_usage;
        match monitor::evaluate(self.throttled, sample.percentage(), ceiling) {
            ThrottleChange::Engage => {
                self.throttled = true;
                warn!(
                    "Memory usage too high ({}%). Throttling worker creation.",
                    snapshot.percentage
                );
            }
            ThrottleChange::Release => {
                self.throttled = false;
                info!(
                    "Memory usage normalized ({}%). Resuming normal operation.",
                    snapshot.percentage
                );
                self.schedule_admission(Duration::ZERO);
            }
            ThrottleChange::Unchanged => {}
        }
    }

    // --------------------------------------------------------
    // Bookkeeping
    // --------------------------------------------------------

    async fn record_success(&mut self, task: &Task, data: CollectedResult) {
        self.stats.completed += 1;
        self.errors.remove(&task.symbol);

        if let Err(e) = self.store.persist(&task.symbol, &data).await {
            error!("Error saving data for {}: {e:#}", task.symbol);
        }
        self.results.insert(task.symbol.clone(), data);
    }

    /// Requeues at the tail while retry budget remains, otherwise
    /// records a permanent failure.
    fn retry_or_fail(&mut self, task: Task, reason: String) {
        if task.retries < self.config.retries {
            self.stats.retried += 1;
            info!(
                "Retrying {} ({}/{}): {reason}",
                task.symbol,
                task.retries + 1,
                self.config.retries
            );
            self.queue.push_back(task.next_attempt());
        } else {
            self.stats.failed += 1;
            error!(
                "Giving up on {} after {} retries: {reason}",
                task.symbol, task.retries
            );
            self.errors.insert(task.symbol, reason);
        }
    }

    /// Moves a settled worker out of the pool; it gets `grace` to
    /// exit before being killed.
    fn retire(&mut self, id: WorkerId, mut handle: WorkerHandle, grace: Duration) {
        if let Some(timer) = handle.timer.take() {
            timer.abort();
        }

        let timer = post_after(self.events.clone(), grace, Event::ForceKill(id.clone()));
        self.retired.insert(
            id,
            Retired {
                symbol: handle.task.symbol,
                kill: handle.kill.take(),
                grace: timer,
            },
        );
        // dropping `handle.outbound` closes the worker's stdin
    }

    fn after_termination(&mut self) {
        if self.running {
            self.schedule_admission(SETTLE_DELAY);
        }
        self.check_completion();
    }

    fn check_completion(&mut self) {
        if !(self.queue.is_empty() && self.active.is_empty() && self.running) {
            return;
        }

        info!(
            "Crawling complete. Processed {} symbols successfully, {} failed.",
            self.stats.completed, self.stats.failed
        );
        self.stop_monitor();
        self.running = false;
        self.admit_at = None;
        self.resolve_completion();
    }

    // --------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------

    fn begin_stop(&mut self, reply: Option<oneshot::Sender<()>>) {
        if let Some(reply) = reply {
            self.stop_waiters.push(reply);
        }
        if self.stopping {
            return;
        }

        if !self.running && self.active.is_empty() && self.retired.is_empty() {
            self.finish_stop();
            return;
        }

        info!("Stopping all crawler processes...");
        self.stopping = true;
        self.running = false;
        self.admit_at = None;
        self.stop_monitor();

        let grace = self.config.stop_grace();
        // settled workers already have a shorter kill pending
        for (id, handle) in self.active.iter_mut().filter(|(_, h)| !h.settled) {
            if let Some(timer) = handle.timer.take() {
                timer.abort();
            }
            let _ = handle.outbound.send(ParentMessage::Terminate);
            handle.timer = Some(post_after(
                self.events.clone(),
                grace,
                Event::ForceKill(id.clone()),
            ));
        }

        self.finish_stop_if_idle();
    }

    fn finish_stop_if_idle(&mut self) {
        if self.stopping && self.active.is_empty() && self.retired.is_empty() {
            self.stopping = false;
            self.requeue_interrupted();
            info!("All crawler processes terminated.");
            self.finish_stop();
        }
    }

    /// Puts interrupted tasks back at the head in their spawn order.
    fn requeue_interrupted(&mut self) {
        self.interrupted.sort_by_key(|(seq, _)| *seq);
        for (_, task) in self.interrupted.drain(..).rev() {
            self.queue.push_front(task);
        }
    }

    fn finish_stop(&mut self) {
        self.resolve_completion();
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }

    // --------------------------------------------------------
    // Snapshots
    // --------------------------------------------------------

    fn completion_signal(&mut self) -> SharedReport {
        let (_, shared) = self.completion.get_or_insert_with(|| {
            let (tx, rx) = oneshot::channel();
            (tx, rx.shared())
        });
        shared.clone()
    }

    fn resolve_completion(&mut self) {
        if let Some((tx, _)) = self.completion.take() {
            let _ = tx.send(self.report());
        }
    }

    fn report(&self) -> CrawlReport {
        CrawlReport {
            results: self.results.clone(),
            errors: self.errors.clone(),
            stats: self.stats,
        }
    }

    fn status(&self) -> CrawlStatus {
        let mut workers: Vec<ActiveWorker> = self
            .active
            .iter()
            .map(|(id, h)| ActiveWorker {
                id: id.clone(),
                symbol: h.task.symbol.clone(),
                attempt: h.retries_at_spawn + 1,
                started_at: h.started_at.to_rfc3339(),
                pid: h.pid,
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        let memory = self
            .memory
            .or_else(|| self.probe.sample().ok().map(|s| s.snapshot()));

        let idle = self.queue.is_empty() && self.active.is_empty();
        let message = (idle && self.results.is_empty())
            .then(|| "No results collected. Check worker logs for possible errors.".to_string());

        CrawlStatus {
            running: self.running,
            throttled: self.throttled,
            active_workers: self.active.len(),
            queued_tasks: self.queue.len(),
            completed_symbols: self.results.len(),
            failed_symbols: self.errors.len(),
            stats: self.stats,
            workers,
            memory,
            message,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Posts `event` after `delay` unless the returned handle is aborted.
fn post_after(events: mpsc::UnboundedSender<Event>, delay: Duration, event: Event) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(event);
    })
}

/// Relays one worker's messages, then its exit, into the engine.
/// Messages are relayed in order and always before the exit.
fn forward(
    events: mpsc::UnboundedSender<Event>,
    id: WorkerId,
    mut inbound: mpsc::UnboundedReceiver<WorkerMessage>,
    exit: oneshot::Receiver<WorkerExit>,
) {
    tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            if events.send(Event::Message { id: id.clone(), msg }).is_err() {
                return;
            }
        }

        let exit = exit.await.unwrap_or(WorkerExit {
            code: None,
            killed: false,
        });
        let _ = events.send(Event::Exited { id, exit });
    });
}

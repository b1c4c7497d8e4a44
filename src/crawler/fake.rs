//! In-memory worker simulation for orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tokio::sync::{Notify, mpsc, oneshot};

use crate::feed::scripted::candles;
use crate::ipc::{ParentMessage, WorkerMessage};
use crate::schema::{CollectedResult, Task};

use super::launcher::{WorkerChannel, WorkerExit, WorkerLauncher};
use super::monitor::{MemoryProbe, MemorySample};

/// What a simulated worker does once it received its task.
///
/// Every behavior except `Hang` and `Stubborn` exits with code 0
/// as soon as a terminate/timeout notice arrives or stdin closes.
#[derive(Clone)]
pub enum Behavior {
    Succeed { periods: usize, after: Duration },
    /// Like `Succeed`, but ignores notices
    Stubborn { periods: usize, after: Duration },
    Fail { error: String, after: Duration },
    Crash { code: i32, after: Duration },
    /// Reports one candle when notified
    Hold(Arc<Notify>),
    /// Never reports, but honors notices
    Polite,
    /// Never reports, ignores notices, only a kill ends it
    Hang,
    /// `launch` itself fails
    RefuseSpawn,
    /// `launch` panics
    Panic,
}

pub struct FakeLauncher {
    default: Behavior,
    scripts: Mutex<HashMap<String, VecDeque<Behavior>>>,
    launched: Mutex<Vec<String>>,
    notices: Arc<Mutex<Vec<ParentMessage>>>,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn new(default: Behavior) -> Arc<Self> {
        Arc::new(Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            launched: Mutex::new(Vec::new()),
            notices: Arc::new(Mutex::new(Vec::new())),
            live: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            kills: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Per-attempt behaviors for one symbol; the default applies
    /// once the script runs out.
    pub fn script(&self, symbol: &str, behaviors: Vec<Behavior>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(symbol.to_string(), behaviors.into());
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Counts control messages (other than `Start`) matching `pred`.
    pub fn notices(&self, pred: impl Fn(&ParentMessage) -> bool) -> usize {
        self.notices.lock().unwrap().iter().filter(|m| pred(m)).count()
    }

    fn next_behavior(&self, symbol: &str) -> Behavior {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(symbol)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait::async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, task: &Task) -> Result<WorkerChannel> {
        let behavior = self.next_behavior(&task.symbol);
        self.launched.lock().unwrap().push(task.symbol.clone());

        match behavior {
            Behavior::RefuseSpawn => bail!("spawn refused for {}", task.symbol),
            Behavior::Panic => panic!("launcher blew up on {}", task.symbol),
            _ => {}
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        let sim = Simulation {
            behavior,
            control: out_rx,
            to_parent: in_tx,
            kill: kill_rx,
            notices: self.notices.clone(),
            live: self.live.clone(),
            peak: self.peak.clone(),
            kills: self.kills.clone(),
        };
        tokio::spawn(async move {
            let exit = sim.run().await;
            let _ = exit_tx.send(exit);
        });

        Ok(WorkerChannel {
            pid: None,
            outbound: out_tx,
            inbound: in_rx,
            exit: exit_rx,
            kill: kill_tx,
        })
    }
}

struct Simulation {
    behavior: Behavior,
    control: mpsc::UnboundedReceiver<ParentMessage>,
    to_parent: mpsc::UnboundedSender<WorkerMessage>,
    kill: oneshot::Receiver<()>,
    notices: Arc<Mutex<Vec<ParentMessage>>>,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    kills: Arc<AtomicUsize>,
}

impl Simulation {
    async fn run(self) -> WorkerExit {
        let Simulation {
            behavior,
            mut control,
            to_parent,
            mut kill,
            notices,
            live,
            peak,
            kills,
        } = self;

        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);

        let task = match control.recv().await {
            Some(ParentMessage::Start { task }) => task,
            _ => {
                live.fetch_sub(1, Ordering::SeqCst);
                return WorkerExit {
                    code: Some(1),
                    killed: false,
                };
            }
        };

        let honors_notices = !matches!(behavior, Behavior::Hang | Behavior::Stubborn { .. });

        let code = tokio::select! {
            code = act(behavior, &task, &to_parent) => Some(code),
            code = listen(&mut control, &notices, honors_notices) => Some(code),
            Ok(()) = &mut kill => {
                kills.fetch_add(1, Ordering::SeqCst);
                None
            }
        };

        drop(to_parent);
        live.fetch_sub(1, Ordering::SeqCst);
        WorkerExit {
            code,
            killed: code.is_none(),
        }
    }
}

async fn act(behavior: Behavior, task: &Task, to_parent: &mpsc::UnboundedSender<WorkerMessage>) -> i32 {
    match behavior {
        Behavior::Succeed { periods, after } | Behavior::Stubborn { periods, after } => {
            tokio::time::sleep(after).await;
            report(task, periods, to_parent);
            0
        }
        Behavior::Fail { error, after } => {
            tokio::time::sleep(after).await;
            let _ = to_parent.send(WorkerMessage::Error { error });
            1
        }
        Behavior::Crash { code, after } => {
            tokio::time::sleep(after).await;
            code
        }
        Behavior::Hold(release) => {
            release.notified().await;
            report(task, 1, to_parent);
            0
        }
        Behavior::Polite | Behavior::Hang | Behavior::RefuseSpawn | Behavior::Panic => {
            std::future::pending().await
        }
    }
}

fn report(task: &Task, periods: usize, to_parent: &mpsc::UnboundedSender<WorkerMessage>) {
    let _ = to_parent.send(WorkerMessage::Log {
        data: format!("Collected {periods} periods"),
    });
    let _ = to_parent.send(WorkerMessage::Result {
        data: CollectedResult {
            symbol: task.symbol.clone(),
            timeframe: task.timeframe.clone(),
            periods: candles(0, periods),
            info: None,
        },
    });
}

/// Records notices; resolves with exit code 0 on the first notice
/// (or closed stdin) when the behavior honors them.
async fn listen(
    control: &mut mpsc::UnboundedReceiver<ParentMessage>,
    notices: &Mutex<Vec<ParentMessage>>,
    honors: bool,
) -> i32 {
    while let Some(msg) = control.recv().await {
        notices.lock().unwrap().push(msg);
        if honors {
            return 0;
        }
    }
    if honors {
        return 0;
    }
    std::future::pending().await
}

/// Memory probe with a settable reading.
pub struct FakeProbe {
    percentage: Mutex<Option<f64>>,
}

impl FakeProbe {
    pub fn new(percentage: f64) -> Self {
        Self {
            percentage: Mutex::new(Some(percentage)),
        }
    }

    pub fn failing() -> Self {
        Self {
            percentage: Mutex::new(None),
        }
    }

    pub fn set(&self, percentage: f64) {
        *self.percentage.lock().unwrap() = Some(percentage);
    }
}

impl MemoryProbe for FakeProbe {
    fn sample(&self) -> Result<MemorySample> {
        let pct = self
            .percentage
            .lock()
            .unwrap()
            .ok_or_else(|| anyhow!("probe unavailable"))?;
        Ok(MemorySample {
            used_bytes: (pct * 100.0).round() as u64,
            total_bytes: 10_000,
        })
    }
}

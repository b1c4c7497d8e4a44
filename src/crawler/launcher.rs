use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use log::warn;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::ipc::{self, ParentMessage, WorkerMessage};
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::schema::Task;

/// How a worker ended, as observed by its launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, if the worker exited on its own
    pub code: Option<i32>,

    /// The launcher force-killed the worker
    pub killed: bool,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.killed) {
            (_, true) => "was killed".to_string(),
            (Some(code), false) => format!("exited with code {code}"),
            (None, false) => "terminated by signal".to_string(),
        }
    }
}

/// Orchestrator-side endpoints of one running worker.
///
/// CONTRACT:
/// - `inbound` closes once the worker can no longer send
/// - `exit` resolves after the worker is gone
/// - sending on `kill` forces the worker down
pub struct WorkerChannel {
    pub pid: Option<u32>,
    pub outbound: mpsc::UnboundedSender<ParentMessage>,
    pub inbound: mpsc::UnboundedReceiver<WorkerMessage>,
    pub exit: oneshot::Receiver<WorkerExit>,
    pub kill: oneshot::Sender<()>,
}

/// Starts isolated execution units for tasks.
///
/// The production implementation forks OS processes; tests plug
/// in an in-memory simulation.
#[async_trait::async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, task: &Task) -> Result<WorkerChannel>;
}

// ------------------------------------------------------------
// Process launcher
// ------------------------------------------------------------
//
// Re-executes the crawler binary in worker mode:
//
//     <program> worker --max-memory-mb=<n> --feed-url=<url>
//
// stdin/stdout carry IPC frames, stderr is inherited so worker
// logs land in the same terminal / log file as the parent.
//
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Launcher for the crawler binary at `program` in worker mode.
    pub fn new(program: PathBuf, memory_limit_mb: u64, feed_url: &str) -> Self {
        Self::with_args(
            program,
            [
                "worker".to_string(),
                format!("--max-memory-mb={memory_limit_mb}"),
                format!("--feed-url={feed_url}"),
            ],
        )
    }

    /// Launcher for an arbitrary program speaking the worker protocol.
    pub fn with_args<I, A>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Launcher that re-runs the current executable.
    pub fn current_exe(memory_limit_mb: u64, feed_url: &str) -> Result<Self> {
        let program = std::env::current_exe().context("resolving current executable")?;
        Ok(Self::new(program, memory_limit_mb, feed_url))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait::async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, task: &Task) -> Result<WorkerChannel> {
        let mut child = self
            .command()
            .spawn()
            .with_context(|| format!("spawning worker for {}", task.symbol))?;

        let pid = child.id();
        let mut stdin = child.stdin.take().context("worker stdin not captured")?;
        let stdout = child.stdout.take().context("worker stdout not captured")?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ParentMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        // Writer: ParentMessage → worker stdin
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let line = match ipc::encode(&msg) {
                    Ok(l) => l,
                    Err(e) => {
                        warn!("{e}");
                        continue;
                    }
                };
                if stdin.write_all(line.as_bytes()).await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        // Reader: worker stdout → WorkerMessage
        let symbol = task.symbol.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match ipc::decode::<WorkerMessage>(&line) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        RuntimeMetrics::incr(&METRICS.ipc_decode_errors);
                        warn!("[{symbol}] {e}");
                    }
                }
            }
        });

        // Reaper: waits for exit, or kills on request
        tokio::spawn(async move {
            let mut killed = false;
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    killed = true;
                    if let Err(e) = child.start_kill() {
                        warn!("failed to kill worker: {e}");
                    }
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => WorkerExit {
                    code: status.code(),
                    killed,
                },
                Err(e) => {
                    warn!("failed to wait for worker: {e}");
                    WorkerExit { code: None, killed }
                }
            };
            let _ = exit_tx.send(exit);
        });

        Ok(WorkerChannel {
            pid,
            outbound: out_tx,
            inbound: in_rx,
            exit: exit_rx,
            kill: kill_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::schema::SymbolRequest;

    const REPORTING_WORKER: &str = r#"
        read line
        case "$line" in
            *'"type":"start"'*) ;;
            *) exit 9 ;;
        esac
        echo '{"type":"log","data":"started"}'
        echo 'not a frame'
        echo '{"type":"result","data":{"symbol":"X","timeframe":"15","periods":[{"time":60,"open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":10.0}],"info":null}}'
        exit 0
    "#;

    fn task() -> Task {
        SymbolRequest::new("X", "15", 1).into_task().unwrap()
    }

    async fn exit_of(channel: WorkerChannel) -> WorkerExit {
        tokio::time::timeout(Duration::from_secs(10), channel.exit)
            .await
            .expect("worker did not exit")
            .unwrap()
    }

    #[test]
    fn exit_descriptions() {
        assert_eq!(WorkerExit { code: Some(1), killed: false }.describe(), "exited with code 1");
        assert_eq!(WorkerExit { code: None, killed: false }.describe(), "terminated by signal");
        assert_eq!(WorkerExit { code: None, killed: true }.describe(), "was killed");
        assert!(WorkerExit { code: Some(0), killed: false }.success());
    }

    #[test]
    fn worker_command_line() {
        let launcher = ProcessLauncher::new(PathBuf::from("/usr/bin/crawler"), 300, "ws://feed");
        let cmd = launcher.command();
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["worker", "--max-memory-mb=300", "--feed-url=ws://feed"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_worker_reports_over_stdio() {
        let launcher = ProcessLauncher::with_args("sh", ["-c", REPORTING_WORKER]);
        let mut channel = launcher.launch(&task()).await.unwrap();
        assert!(channel.pid.is_some());

        channel.outbound.send(ParentMessage::Start { task: task() }).unwrap();

        let mut msgs = Vec::new();
        while let Some(msg) = channel.inbound.recv().await {
            msgs.push(msg);
        }
        // the undecodable line is skipped
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], WorkerMessage::Log { data: "started".into() });
        assert!(matches!(
            &msgs[1],
            WorkerMessage::Result { data } if data.symbol == "X" && data.periods.len() == 1
        ));

        assert_eq!(exit_of(channel).await, WorkerExit { code: Some(0), killed: false });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_code_is_reported() {
        let launcher = ProcessLauncher::with_args("sh", ["-c", "exit 3"]);
        let channel = launcher.launch(&task()).await.unwrap();

        let exit = exit_of(channel).await;
        assert_eq!(exit, WorkerExit { code: Some(3), killed: false });
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresponsive_process_is_killed_on_request() {
        let launcher = ProcessLauncher::with_args("sh", ["-c", "exec sleep 30"]);
        let channel = launcher.launch(&task()).await.unwrap();

        channel.outbound.send(ParentMessage::Terminate).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.kill.send(()).unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(10), channel.exit)
            .await
            .expect("worker was not killed")
            .unwrap();
        assert_eq!(exit, WorkerExit { code: None, killed: true });
    }
}

//! Worker process runtime.
//!
//! A worker is the crawler binary started with the `worker`
//! argument. It handles exactly one task:
//!
//! - stdin  : `ParentMessage` frames (start / terminate / timeout)
//! - stdout : `WorkerMessage` frames (log / result / error)
//! - stderr : regular `log` output, inherited from the parent
//!
//! Exit codes: 0 on success or on a shutdown notice / signal,
//! 1 on any error path.

pub mod session;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::feed::{self, MarketDataClient};
use crate::ipc::{self, ParentMessage, WorkerMessage};
use crate::metrics::{METRICS, RuntimeMetrics};
use crate::util;

use session::{Outcome, Reporter, TaskRunner};

/// How often a worker samples its own resident memory.
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Arguments the orchestrator passes on the worker command line.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkerArgs {
    pub max_memory_mb: Option<u64>,
    pub feed_url: String,
}

impl WorkerArgs {
    /// Parses `--max-memory-mb=<n>` and `--feed-url=<url>`.
    /// Unknown arguments are logged and ignored.
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut parsed = WorkerArgs {
            feed_url: crate::config::FeedConfig::default().url,
            ..Default::default()
        };

        for arg in args {
            if let Some(v) = arg.strip_prefix("--max-memory-mb=") {
                parsed.max_memory_mb = v.parse().ok();
            } else if let Some(v) = arg.strip_prefix("--feed-url=") {
                parsed.feed_url = v.to_string();
            } else {
                warn!("ignoring unknown worker argument `{arg}`");
            }
        }

        parsed
    }
}

/// Why the worker stopped collecting.
enum Exit {
    Finished(Outcome),
    Notice(&'static str),
    Signal(&'static str),
    MemoryLimit(String),
}

/// Process entry point for worker mode. Returns the exit code.
pub async fn run(args: WorkerArgs) -> i32 {
    let client = feed::default_client(&args.feed_url);
    debug!("worker using {} feed at {}", client.name(), args.feed_url);

    run_over(
        client,
        tokio::io::stdin(),
        tokio::io::stdout(),
        args.max_memory_mb,
        util::shutdown_signal(),
    )
    .await
}

/// Wires the frame pumps around `serve` and waits until every
/// outgoing frame is flushed.
async fn run_over<R, W, S>(
    client: Arc<dyn MarketDataClient>,
    input: R,
    output: W,
    memory_limit_mb: Option<u64>,
    shutdown: S,
) -> i32
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = &'static str>,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(output, out_rx));

    let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
    let reader = tokio::spawn(read_frames(input, ctl_tx));

    let code = serve(client, Reporter::new(out_tx), ctl_rx, memory_limit_mb, shutdown).await;

    reader.abort();

    // All reporters are gone, so the writer drains and stops.
    match writer.await {
        Ok(Ok(())) => code,
        Ok(Err(e)) => {
            error!("failed to flush IPC frames: {e:#}");
            1
        }
        Err(e) => {
            error!("IPC writer task failed: {e}");
            1
        }
    }
}

/// Drives one worker lifetime over already-decoded channels.
///
/// Idle until a `start` frame arrives, then runs the task while
/// listening for shutdown notices, process signals and the memory
/// cap. Cleanup runs exactly once on every path.
pub async fn serve<S>(
    client: Arc<dyn MarketDataClient>,
    reporter: Reporter,
    mut control: mpsc::UnboundedReceiver<ParentMessage>,
    memory_limit_mb: Option<u64>,
    shutdown: S,
) -> i32
where
    S: Future<Output = &'static str>,
{
    tokio::pin!(shutdown);

    // --------------------------------------------------------
    // Idle: wait for the one and only task
    // --------------------------------------------------------
    let task = tokio::select! {
        msg = control.recv() => match msg {
            Some(ParentMessage::Start { task }) => task,
            Some(other) => {
                info!("worker received {other:?} before start, exiting");
                return 0;
            }
            None => {
                warn!("parent closed the IPC channel before sending a task");
                return 1;
            }
        },
        sig = &mut shutdown => {
            info!("worker received {sig} while idle, exiting");
            return 0;
        }
    };

    reporter.log(format!(
        "Starting to crawl {} on {} timeframe",
        task.symbol, task.timeframe
    ));

    let mut runner = TaskRunner::new(task, reporter.clone());

    let exit = tokio::select! {
        outcome = runner.run(client.as_ref()) => Exit::Finished(outcome),
        notice = next_notice(&mut control) => Exit::Notice(notice),
        sig = &mut shutdown => Exit::Signal(sig),
        reason = memory_watchdog(memory_limit_mb) => Exit::MemoryLimit(reason),
    };

    // --------------------------------------------------------
    // Report, then clean up
    // --------------------------------------------------------
    let code = match exit {
        Exit::Finished(outcome) => {
            let code = match outcome {
                Outcome::Report(_) => 0,
                Outcome::Failed(_) => 1,
            };
            reporter.report(outcome);
            code
        }

        Exit::MemoryLimit(reason) => {
            reporter.report(runner.fail(reason));
            1
        }

        Exit::Notice(notice) => {
            info!("worker received {notice} notice, cleaning up");
            reporter.log(format!("Worker received {notice} notice"));
            0
        }

        Exit::Signal(sig) => {
            info!("worker received {sig} signal, cleaning up");
            reporter.log(format!("Worker received {sig} signal"));
            0
        }
    };

    runner.teardown().await;
    code
}

/// Resolves on the next shutdown notice from the parent.
async fn next_notice(control: &mut mpsc::UnboundedReceiver<ParentMessage>) -> &'static str {
    loop {
        match control.recv().await {
            Some(ParentMessage::Terminate) => return "terminate",
            Some(ParentMessage::Timeout) => return "timeout",
            Some(ParentMessage::Start { task }) => {
                warn!("ignoring second start for {}", task.symbol);
            }
            None => return "disconnect",
        }
    }
}

/// Resolves with a reason once resident memory exceeds the cap.
/// Never resolves when no cap is set.
async fn memory_watchdog(limit_mb: Option<u64>) -> String {
    let Some(limit) = limit_mb.filter(|l| *l > 0) else {
        return std::future::pending().await;
    };

    let mut tick = tokio::time::interval(MEMORY_CHECK_INTERVAL);
    loop {
        tick.tick().await;
        match util::process_rss_bytes() {
            Ok(rss) if util::bytes_to_mb(rss) > limit => {
                return format!(
                    "Worker memory limit exceeded ({} MB > {} MB)",
                    util::bytes_to_mb(rss),
                    limit
                );
            }
            Ok(_) => {}
            Err(e) => debug!("memory check unavailable: {e:#}"),
        }
    }
}

/// Writes every outgoing message as one flushed line.
async fn write_frames<W>(mut out: W, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let line = ipc::encode(&msg)?;
        out.write_all(line.as_bytes()).await?;
        out.flush().await?;
    }
    Ok(())
}

/// Decodes incoming lines until EOF. Bad frames are skipped.
async fn read_frames<R>(input: R, tx: mpsc::UnboundedSender<ParentMessage>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match ipc::decode::<ParentMessage>(&line) {
                Ok(msg) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    RuntimeMetrics::incr(&METRICS.ipc_decode_errors);
                    warn!("{e}");
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("reading IPC input failed: {e}");
                break;
            }
        }
    }
}

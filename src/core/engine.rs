//! Pipeline execution.
//!
//! A run spawns every stage of a [`PipelineSpec`] into one process group,
//! wires stdout of each stage into stdin of the next, and merges stderr of
//! all stages plus stdout of the last into a single line stream. Results
//! reach the caller only through [`RunEvent`]s; the terminal
//! [`RunEvent::Finished`] is sent exactly once per run.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::pipeline::{PipelineSpec, Stage};
use crate::error::ExecError;
use crate::logging::LogThrottle;

/// Estimate bump per line of output.
const LINE_INCREMENT: f64 = 0.002;
/// Estimates never reach completion before the run does.
const PROGRESS_CAP: f64 = 0.98;
/// Grace period between SIGTERM and SIGKILL on cancellation.
const KILL_GRACE: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Line { text: String, progress: f64 },
    Finished(RunOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed(String),
    Cancelled,
}

/// Live run. Dropping the handle does not stop the run; call [`cancel`].
///
/// [`cancel`]: RunHandle::cancel
pub struct RunHandle {
    pub events: mpsc::Receiver<RunEvent>,
    pub started_at: DateTime<Local>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this run, for holders that outlive the receiver.
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

pub trait Executor: Send + Sync {
    fn start(&self, spec: PipelineSpec) -> RunHandle;
}

pub fn create_executor(simulation: bool) -> Arc<dyn Executor> {
    if simulation {
        Arc::new(SimulatedExecutor::default())
    } else {
        Arc::new(ProcessExecutor)
    }
}

/// Monotonic progress heuristic: a fixed bump per line, raised to any
/// native percentage a tool prints, capped below 1.0.
pub struct ProgressEstimator {
    value: f64,
    percent: Regex,
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self {
            value: 0.0,
            // "  12,345,678   45%  10.2MB/s ..."
            percent: Regex::new(r"(?:^|\s)(\d{1,3})%(?:\s|$)").expect("static regex"),
        }
    }

    pub fn observe(&mut self, line: &str) -> f64 {
        let mut next = self.value + LINE_INCREMENT;
        if let Some(pct) = self
            .percent
            .captures(line)
            .and_then(|c| c[1].parse::<u8>().ok())
            .filter(|p| *p <= 100)
        {
            next = next.max(f64::from(pct) / 100.0);
        }
        self.value = next.min(PROGRESS_CAP).max(self.value);
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Emits run events, tracking the progress estimate as lines go by.
struct Emitter {
    tx: mpsc::Sender<RunEvent>,
    progress: ProgressEstimator,
    throttle: LogThrottle,
}

impl Emitter {
    async fn line(&mut self, text: String) {
        let progress = self.progress.observe(&text);
        if self.throttle.should_log() {
            debug!(progress = format!("{:.3}", progress), line = %text, "Run output");
        }
        let _ = self.tx.send(RunEvent::Line { text, progress }).await;
    }
}

/// Runs pipelines as real subprocesses.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn start(&self, spec: PipelineSpec) -> RunHandle {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let started_at = Local::now();

        let span = info_span!("run", strategy = %spec.strategy, remote = %spec.remote);
        let token = cancel.clone();
        tokio::spawn(
            async move {
                let mut emitter = Emitter {
                    tx: tx.clone(),
                    progress: ProgressEstimator::new(),
                    throttle: LogThrottle::new(Duration::from_millis(500)),
                };

                let inner_token = token.clone();
                let outcome = match tokio::spawn(async move {
                    run_pipeline(&spec, &mut emitter, &inner_token).await
                })
                .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => RunOutcome::Failed(format!("run task aborted: {}", e)),
                };

                info!(outcome = ?outcome, "Run finished");
                let _ = tx.send(RunEvent::Finished(outcome)).await;
            }
            .instrument(span),
        );

        RunHandle {
            events: rx,
            started_at,
            cancel,
        }
    }
}

/// How a group of piped processes ended.
enum GroupResult {
    Exited(Vec<(String, ExitStatus)>),
    Cancelled,
}

async fn run_pipeline(
    spec: &PipelineSpec,
    emitter: &mut Emitter,
    cancel: &CancellationToken,
) -> RunOutcome {
    if cancel.is_cancelled() {
        return RunOutcome::Cancelled;
    }

    info!(pipeline = %spec.display(), "Starting run");
    for note in &spec.notes {
        emitter.line(format!("# {}", note)).await;
    }

    for step in &spec.setup {
        emitter.line(format!("$ {}", step.stage.display())).await;
        match run_group(std::slice::from_ref(&step.stage), emitter, cancel).await {
            Ok(GroupResult::Cancelled) => return RunOutcome::Cancelled,
            Ok(GroupResult::Exited(statuses)) => {
                if let Some(err) = first_failure(statuses) {
                    if step.allow_failure {
                        warn!(error = %err, "Setup step failed, continuing");
                        emitter.line(format!("# ignored: {}", err)).await;
                    } else {
                        return RunOutcome::Failed(err.to_string());
                    }
                }
            }
            Err(e) => return RunOutcome::Failed(e.to_string()),
        }
    }

    emitter.line(format!("$ {}", spec.display())).await;
    match run_group(&spec.stages, emitter, cancel).await {
        Ok(GroupResult::Cancelled) => RunOutcome::Cancelled,
        Ok(GroupResult::Exited(statuses)) => match first_failure(statuses) {
            Some(err) => RunOutcome::Failed(err.to_string()),
            None => RunOutcome::Success,
        },
        Err(e) => RunOutcome::Failed(e.to_string()),
    }
}

/// Pipefail: the first stage that did not exit cleanly fails the pipeline.
fn first_failure(statuses: Vec<(String, ExitStatus)>) -> Option<ExecError> {
    statuses
        .into_iter()
        .find(|(_, status)| !status.success())
        .map(|(program, status)| ExecError::StageFailed {
            program,
            status: status.to_string(),
        })
}

/// Spawn `stages` as one piped process group and stream their output until
/// every reader hits EOF, then collect exit statuses.
async fn run_group(
    stages: &[Stage],
    emitter: &mut Emitter,
    cancel: &CancellationToken,
) -> Result<GroupResult, ExecError> {
    if stages.is_empty() {
        return Err(ExecError::EmptyPipeline);
    }
    if cancel.is_cancelled() {
        return Ok(GroupResult::Cancelled);
    }

    let (line_tx, mut line_rx) = mpsc::channel::<String>(EVENT_CHANNEL_CAPACITY);
    let mut children: Vec<(String, Child)> = Vec::with_capacity(stages.len());
    let mut pgid: Option<i32> = None;
    let mut upstream: Option<Stdio> = None;

    for (i, stage) in stages.iter().enumerate() {
        let last = i + 1 == stages.len();
        let mut cmd = Command::new(&stage.program);
        cmd.args(&stage.args)
            .envs(stage.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(upstream.take().unwrap_or_else(Stdio::null))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(pgid.unwrap_or(0))
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                terminate_group(pgid, Signal::SIGKILL);
                return Err(ExecError::Spawn {
                    program: stage.program.clone(),
                    source,
                });
            }
        };
        debug!(program = %stage.program, pid = ?child.id(), "Spawned stage");

        if pgid.is_none() {
            pgid = child.id().map(|id| id as i32);
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx.clone()));
        }
        if let Some(stdout) = child.stdout.take() {
            if last {
                tokio::spawn(forward_lines(stdout, line_tx.clone()));
            } else {
                match stdout.try_into() {
                    Ok(stdio) => upstream = Some(stdio),
                    Err(source) => {
                        terminate_group(pgid, Signal::SIGKILL);
                        return Err(ExecError::Pipe {
                            program: stage.program.clone(),
                            source,
                        });
                    }
                }
            }
        }

        children.push((stage.program.clone(), child));
    }
    drop(line_tx);

    let mut waiter = tokio::spawn(wait_all(children));
    let mut cancelled = false;
    let mut kill_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !cancelled => {
                info!("Cancelling run");
                cancelled = true;
                terminate_group(pgid, Signal::SIGTERM);
                kill_deadline = Some(Instant::now() + KILL_GRACE);
            }
            _ = sleep_until(kill_deadline.unwrap_or_else(Instant::now)), if kill_deadline.is_some() => {
                warn!("Pipeline ignored SIGTERM, killing");
                terminate_group(pgid, Signal::SIGKILL);
                kill_deadline = None;
            }
            line = line_rx.recv() => match line {
                Some(text) => emitter.line(text).await,
                None => break,
            },
        }
    }

    let statuses = loop {
        tokio::select! {
            joined = &mut waiter => break joined,
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                terminate_group(pgid, Signal::SIGTERM);
            }
            _ = sleep(KILL_GRACE), if cancelled => terminate_group(pgid, Signal::SIGKILL),
        }
    };

    if cancelled {
        return Ok(GroupResult::Cancelled);
    }

    match statuses {
        Ok(result) => result.map(GroupResult::Exited),
        Err(e) => Err(ExecError::Wait {
            program: stages[0].program.clone(),
            source: std::io::Error::other(e),
        }),
    }
}

async fn wait_all(
    mut children: Vec<(String, Child)>,
) -> Result<Vec<(String, ExitStatus)>, ExecError> {
    let mut statuses = Vec::with_capacity(children.len());
    for (program, child) in children.iter_mut() {
        let status = child.wait().await.map_err(|source| ExecError::Wait {
            program: program.clone(),
            source,
        })?;
        statuses.push((program.clone(), status));
    }
    Ok(statuses)
}

fn terminate_group(pgid: Option<i32>, signal: Signal) {
    if let Some(pgid) = pgid {
        if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
            debug!(pgid, error = %e, "killpg failed");
        }
    }
}

/// Split a byte stream into lines on `\n` or `\r`, so carriage-return
/// progress redraws (dd, pv, rsync) surface as their own lines.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = reader;
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut line_buffer: Vec<u8> = Vec::new();

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for &b in &chunk[..n] {
            if b == b'\r' || b == b'\n' {
                if line_buffer.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&line_buffer).into_owned();
                line_buffer.clear();
                if tx.send(line).await.is_err() {
                    return;
                }
            } else {
                line_buffer.push(b);
            }
        }
    }

    if !line_buffer.is_empty() {
        let _ = tx
            .send(String::from_utf8_lossy(&line_buffer).into_owned())
            .await;
    }
}

/// Replays plausible output without spawning anything.
pub struct SimulatedExecutor {
    pub lines: usize,
    pub line_delay: Duration,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self {
            lines: 200,
            line_delay: Duration::from_millis(50),
        }
    }
}

impl Executor for SimulatedExecutor {
    fn start(&self, spec: PipelineSpec) -> RunHandle {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let lines = self.lines;
        let delay = self.line_delay;

        tokio::spawn(async move {
            let mut emitter = Emitter {
                tx: tx.clone(),
                progress: ProgressEstimator::new(),
                throttle: LogThrottle::new(Duration::from_millis(500)),
            };

            let outcome = async {
                if token.is_cancelled() {
                    return RunOutcome::Cancelled;
                }
                emitter.line(format!("$ {}", spec.display())).await;
                for i in 1..=lines {
                    tokio::select! {
                        _ = token.cancelled() => return RunOutcome::Cancelled,
                        _ = sleep(delay) => {}
                    }
                    let pct = i * 100 / lines;
                    emitter
                        .line(format!("  {:>12}  {:>3}%  (simulated)", i * 4096, pct))
                        .await;
                }
                RunOutcome::Success
            }
            .await;

            let _ = tx.send(RunEvent::Finished(outcome)).await;
        });

        RunHandle {
            events: rx,
            started_at: Local::now(),
            cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimator_is_monotonic_and_capped() {
        let mut est = ProgressEstimator::new();
        let a = est.observe("sending incremental file list");
        let b = est.observe("  1,024  45%  1.00MB/s  0:00:01");
        let c = est.observe("  2,048  10%  1.00MB/s  0:00:01");
        assert!(a > 0.0);
        assert!((b - 0.45).abs() < 1e-9);
        assert!(c >= b);

        est.observe("100%");
        assert!(est.value() <= PROGRESS_CAP);
        for _ in 0..1000 {
            est.observe("line");
        }
        assert!(est.value() < 1.0);
    }

    #[test]
    fn estimator_ignores_non_percent_numbers() {
        let mut est = ProgressEstimator::new();
        let p = est.observe("1073741824 bytes (1.1 GB, 1.0 GiB) copied, 5 s, 215 MB/s");
        assert!((p - LINE_INCREMENT).abs() < 1e-9);
    }

    #[tokio::test]
    async fn forward_lines_splits_on_cr_and_lf() {
        let (tx, mut rx) = mpsc::channel(16);
        let input: &[u8] = b"one\r\rtwo\nthree";
        forward_lines(input, tx).await;

        let mut got = Vec::new();
        while let Some(line) = rx.recv().await {
            got.push(line);
        }
        assert_eq!(got, ["one", "two", "three"]);
    }
}

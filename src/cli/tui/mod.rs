//! Interactive TUI for bkstream.
//!
//! Walks the operator through strategy selection, configuration, preflight
//! and a live run view. The control loop awaits a single inbound channel fed
//! by the terminal reader, a redraw ticker, and background tasks.

mod app;
mod input;
mod ui;

use std::io::{self, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::{
    event, execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::Loaded;
use crate::core::engine::Executor;
use crate::core::pipeline::{self, BuildContext};
use crate::core::preflight::{self, PreflightReport};
use crate::core::probe::EnvironmentProbe;

pub use app::{Action, ConfigForm, Effect, Message, PreflightOutcome, TuiApp, View};

const INBOX_CAPACITY: usize = 256;
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Collaborators the control loop drives.
pub struct Runtime {
    pub probe: Arc<dyn EnvironmentProbe>,
    pub executor: Arc<dyn Executor>,
    pub config_path: PathBuf,
}

/// Run the interactive session until the operator quits.
pub async fn run(loaded: Loaded, runtime: Runtime) -> Result<()> {
    enable_raw_mode().context("Failed to enable raw mode")?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen).context("Failed to enter alternate screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("Failed to create terminal")?;

    let mut app = TuiApp::new(loaded.config);
    if let Some(warning) = loaded.warning {
        app.notice = Some(format!("Config: {} (using defaults)", warning));
    }
    let result = run_app(&mut terminal, &mut app, &runtime).await;

    disable_raw_mode().context("Failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("Failed to leave alternate screen")?;
    terminal.show_cursor().context("Failed to show cursor")?;

    result
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut TuiApp,
    runtime: &Runtime,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Message>(INBOX_CAPACITY);
    spawn_terminal_reader(tx.clone());
    spawn_ticker(tx.clone());

    loop {
        terminal.draw(|frame| ui::render(frame, app))?;

        let Some(msg) = rx.recv().await else {
            break;
        };

        if let Some(effect) = app.update(msg) {
            perform(effect, app, runtime, &tx);
        }

        if !app.running {
            break;
        }
    }

    Ok(())
}

/// Carry out an effect off the control loop; results return as messages.
fn perform(effect: Effect, app: &mut TuiApp, runtime: &Runtime, tx: &mpsc::Sender<Message>) {
    match effect {
        Effect::SaveConfig(config) => {
            let path = runtime.config_path.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let saved = tokio::task::spawn_blocking(move || {
                    config.save_to(&path).map(|_| path).map_err(|e| e.to_string())
                })
                .await
                .unwrap_or_else(|e| Err(e.to_string()));
                let _ = tx.send(Message::ConfigSaved(saved)).await;
            });
        }
        Effect::RunPreflight(config) => {
            let probe = runtime.probe.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let checks = {
                    let config = config.clone();
                    let probe = probe.clone();
                    tokio::spawn(async move {
                        preflight::validate(&config, probe.as_ref()).await
                    })
                };
                let report = match checks.await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(error = %e, "Preflight task failed");
                        PreflightReport::incomplete(format!("preflight did not finish: {}", e))
                    }
                };
                let ctx = BuildContext::detect(probe.as_ref());
                let pipeline = pipeline::build(&config, &ctx);
                if let Err(e) = &pipeline {
                    debug!(error = %e, "Pipeline build failed");
                }
                let outcome = PreflightOutcome {
                    config,
                    report,
                    pipeline,
                };
                let _ = tx.send(Message::PreflightDone(Box::new(outcome))).await;
            });
        }
        Effect::StartRun(spec) => {
            let handle = runtime.executor.start(spec);
            app.update(Message::RunStarted {
                started_at: handle.started_at,
                cancel: handle.canceller(),
            });

            let mut events = handle.events;
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if tx.send(Message::Run(event)).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
}

/// Blocking terminal reads happen on their own thread.
fn spawn_terminal_reader(tx: mpsc::Sender<Message>) {
    std::thread::spawn(move || {
        loop {
            match event::read() {
                Ok(ev) => {
                    if tx.blocking_send(Message::Terminal(ev)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Terminal read failed");
                    break;
                }
            }
        }
    });
}

fn spawn_ticker(tx: mpsc::Sender<Message>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            interval.tick().await;
            // Skip rather than queue redraws behind real events.
            match tx.try_send(Message::Tick) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });
}

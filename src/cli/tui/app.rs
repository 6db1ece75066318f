//! TUI application state and the run state machine.
//!
//! `TuiApp::update` is the whole control logic: it consumes one [`Message`]
//! and optionally returns an [`Effect`] for the driver to perform in the
//! background. It never does I/O itself, so a scripted message sequence
//! drives it deterministically in tests.

use std::path::PathBuf;

use chrono::{DateTime, Local};
use crossterm::event::Event;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BackupConfig, Compression, Strategy};
use crate::core::engine::{RunEvent, RunOutcome};
use crate::core::pipeline::PipelineSpec;
use crate::core::preflight::PreflightReport;
use crate::core::run_state::RunState;
use crate::error::BuildError;

use super::input;

/// Current view being displayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    Intro,
    StrategySelect { selected: usize },
    Configure,
    Preflight,
    Run,
}

/// Actions that can be triggered by user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    Up,
    Down,
    NextField,
    PrevField,
    Confirm,
    Back,
    Cancel,
    Char(char),
    Backspace,
}

/// Result of the background preflight task.
#[derive(Debug, Clone)]
pub struct PreflightOutcome {
    /// Config the checks and pipeline were built from.
    pub config: BackupConfig,
    pub report: PreflightReport,
    pub pipeline: Result<PipelineSpec, BuildError>,
}

/// Inbound events of the control loop.
#[derive(Debug)]
pub enum Message {
    Terminal(Event),
    Action(Action),
    Tick,
    ConfigSaved(Result<PathBuf, String>),
    PreflightDone(Box<PreflightOutcome>),
    RunStarted {
        started_at: DateTime<Local>,
        cancel: CancellationToken,
    },
    Run(RunEvent),
}

/// Background work requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SaveConfig(BackupConfig),
    RunPreflight(BackupConfig),
    StartRun(PipelineSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    User,
    Host,
    Port,
    RemotePath,
    SourceDevice,
    Compression,
    Bandwidth,
    Excludes,
    ArchiveRepo,
    PassphraseEnv,
}

impl Field {
    /// Fields the operator edits for `strategy`, in form order.
    fn for_strategy(strategy: Strategy) -> Vec<Field> {
        let mut fields = vec![Field::User, Field::Host, Field::Port, Field::RemotePath];
        match strategy {
            Strategy::RawDevice => fields.extend([Field::SourceDevice, Field::Compression]),
            Strategy::FileSync => fields.extend([Field::Bandwidth, Field::Excludes]),
            Strategy::DedupArchive => fields.extend([Field::ArchiveRepo, Field::PassphraseEnv]),
            Strategy::ZfsSnapshot | Strategy::BtrfsSnapshot => fields.push(Field::SourceDevice),
        }
        fields
    }

    pub fn label(&self, strategy: Strategy) -> &'static str {
        match self {
            Field::User => "remote user",
            Field::Host => "remote host",
            Field::Port => "ssh port",
            Field::RemotePath => "remote path",
            Field::SourceDevice => match strategy {
                Strategy::ZfsSnapshot => "dataset (e.g. tank/root)",
                Strategy::BtrfsSnapshot => "subvolume (default /)",
                _ => "source device (e.g. /dev/sda)",
            },
            Field::Compression => "compression (pigz|gzip|none)",
            Field::Bandwidth => "bandwidth kbps (0=unlimited)",
            Field::Excludes => "excludes (comma separated)",
            Field::ArchiveRepo => "archive repo (ssh://…)",
            Field::PassphraseEnv => "passphrase env var",
        }
    }

    fn value_of(&self, cfg: &BackupConfig) -> String {
        match self {
            Field::User => cfg.remote_user.clone(),
            Field::Host => cfg.remote_host.clone(),
            Field::Port => cfg.ssh_port.to_string(),
            Field::RemotePath => cfg.remote_path.clone(),
            Field::SourceDevice => cfg.source_device.clone(),
            Field::Compression => cfg.compression.to_string(),
            Field::Bandwidth => cfg.bandwidth_kbps.to_string(),
            Field::Excludes => cfg.excludes.join(", "),
            Field::ArchiveRepo => cfg.archive_repo.clone(),
            Field::PassphraseEnv => cfg.passphrase_env.clone(),
        }
    }

    fn apply(&self, value: &str, cfg: &mut BackupConfig) -> Result<(), String> {
        let value = value.trim();
        match self {
            Field::User => cfg.remote_user = value.to_string(),
            Field::Host => cfg.remote_host = value.to_string(),
            Field::Port => {
                cfg.ssh_port = value
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| format!("ssh port must be 1-65535, got {:?}", value))?;
            }
            Field::RemotePath => cfg.remote_path = value.to_string(),
            Field::SourceDevice => cfg.source_device = value.to_string(),
            Field::Compression => {
                cfg.compression = Compression::parse(value)
                    .ok_or_else(|| format!("unknown compression {:?}", value))?;
            }
            Field::Bandwidth => {
                cfg.bandwidth_kbps = if value.is_empty() {
                    0
                } else {
                    value
                        .parse()
                        .map_err(|_| format!("bandwidth must be a number, got {:?}", value))?
                };
            }
            Field::Excludes => {
                cfg.excludes = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            Field::ArchiveRepo => cfg.archive_repo = value.to_string(),
            Field::PassphraseEnv => cfg.passphrase_env = value.to_string(),
        }
        Ok(())
    }
}

/// Editable text fields for the current strategy.
#[derive(Debug, Clone)]
pub struct ConfigForm {
    pub fields: Vec<(Field, String)>,
    pub focus: usize,
}

impl ConfigForm {
    pub fn from_config(cfg: &BackupConfig) -> Self {
        Self {
            fields: Field::for_strategy(cfg.strategy)
                .into_iter()
                .map(|f| (f, f.value_of(cfg)))
                .collect(),
            focus: 0,
        }
    }

    /// Copy of `base` with every form value parsed into it.
    pub fn apply(&self, base: &BackupConfig) -> Result<BackupConfig, String> {
        let mut cfg = base.clone();
        for (field, value) in &self.fields {
            field.apply(value, &mut cfg)?;
        }
        Ok(cfg)
    }

    fn focused_value(&mut self) -> Option<&mut String> {
        self.fields.get_mut(self.focus).map(|(_, v)| v)
    }

    fn next(&mut self) {
        self.focus = (self.focus + 1) % self.fields.len().max(1);
    }

    fn prev(&mut self) {
        let len = self.fields.len().max(1);
        self.focus = (self.focus + len - 1) % len;
    }
}

/// Main TUI application state.
pub struct TuiApp {
    pub config: BackupConfig,
    pub view: View,
    pub form: ConfigForm,
    /// `None` while the preflight task is still running.
    pub preflight: Option<PreflightOutcome>,
    /// `None` until the engine reports the run started.
    pub run: Option<RunState>,
    pub running: bool,
    pub notice: Option<String>,
    pub error: Option<String>,
    pub tick: usize,
    quit_after_run: bool,
}

impl TuiApp {
    pub fn new(config: BackupConfig) -> Self {
        Self {
            form: ConfigForm::from_config(&config),
            config,
            view: View::Intro,
            preflight: None,
            run: None,
            running: true,
            notice: None,
            error: None,
            tick: 0,
            quit_after_run: false,
        }
    }

    /// Text entry swallows plain keys, so quitting needs Ctrl+C there.
    pub fn is_editing(&self) -> bool {
        self.view == View::Configure
    }

    pub fn run_in_progress(&self) -> bool {
        self.run.as_ref().is_some_and(RunState::is_running)
    }

    /// Whether confirming on the preflight view would start a run.
    pub fn can_start_run(&self) -> bool {
        matches!(
            &self.preflight,
            Some(PreflightOutcome { report, pipeline: Ok(_), .. }) if !report.blocks_run()
        )
    }

    pub fn update(&mut self, msg: Message) -> Option<Effect> {
        match msg {
            Message::Terminal(event) => {
                let action = input::handle_event(event, self.is_editing())?;
                self.handle_action(action)
            }
            Message::Action(action) => self.handle_action(action),
            Message::Tick => {
                self.tick = self.tick.wrapping_add(1);
                None
            }
            Message::ConfigSaved(result) => {
                match result {
                    Ok(path) => self.notice = Some(format!("Saved {}", path.display())),
                    Err(e) => self.error = Some(format!("Failed to save config: {}", e)),
                }
                (self.view == View::Preflight).then(|| Effect::RunPreflight(self.config.clone()))
            }
            Message::PreflightDone(outcome) => {
                // A result for an earlier edit of the form is stale.
                if self.view == View::Preflight && outcome.config == self.config {
                    self.preflight = Some(*outcome);
                } else {
                    debug!("Discarding stale preflight result");
                }
                None
            }
            Message::RunStarted { started_at, cancel } => {
                self.run = Some(RunState::new(started_at, cancel));
                None
            }
            Message::Run(event) => {
                let finished = matches!(event, RunEvent::Finished(_));
                if let Some(run) = self.run.as_mut() {
                    run.apply(event);
                }
                if finished {
                    self.on_run_finished();
                }
                None
            }
        }
    }

    fn on_run_finished(&mut self) {
        match self.run.as_ref().and_then(|r| r.outcome.as_ref()) {
            Some(RunOutcome::Success) => info!("Backup complete"),
            Some(RunOutcome::Cancelled) => info!("Backup cancelled"),
            Some(RunOutcome::Failed(cause)) => warn!(cause = %cause, "Backup failed"),
            None => {}
        }
        if self.quit_after_run {
            self.running = false;
        }
    }

    fn handle_action(&mut self, action: Action) -> Option<Effect> {
        if action == Action::Quit {
            self.quit();
            return None;
        }

        match self.view.clone() {
            View::Intro => {
                if action == Action::Confirm {
                    self.to_strategy_select();
                }
                None
            }
            View::StrategySelect { selected } => self.on_strategy_select(action, selected),
            View::Configure => self.on_configure(action),
            View::Preflight => self.on_preflight(action),
            View::Run => self.on_run(action),
        }
    }

    fn quit(&mut self) {
        match &self.run {
            Some(run) if run.is_running() => {
                run.cancel();
                self.quit_after_run = true;
                self.notice = Some("Cancelling run before exit…".to_string());
            }
            _ => self.running = false,
        }
    }

    fn to_strategy_select(&mut self) {
        let selected = Strategy::ALL
            .iter()
            .position(|s| *s == self.config.strategy)
            .unwrap_or(0);
        self.view = View::StrategySelect { selected };
        self.preflight = None;
        self.run = None;
        self.error = None;
    }

    fn on_strategy_select(&mut self, action: Action, selected: usize) -> Option<Effect> {
        match action {
            Action::Up => {
                self.view = View::StrategySelect {
                    selected: selected.saturating_sub(1),
                };
            }
            Action::Down => {
                self.view = View::StrategySelect {
                    selected: (selected + 1).min(Strategy::ALL.len() - 1),
                };
            }
            Action::Confirm => {
                self.config.strategy = Strategy::ALL[selected];
                self.form = ConfigForm::from_config(&self.config);
                self.view = View::Configure;
            }
            Action::Back => self.view = View::Intro,
            _ => {}
        }
        None
    }

    fn on_configure(&mut self, action: Action) -> Option<Effect> {
        match action {
            Action::NextField | Action::Down => self.form.next(),
            Action::PrevField | Action::Up => self.form.prev(),
            Action::Char(c) => self.form.focused_value()?.push(c),
            Action::Backspace => {
                self.form.focused_value()?.pop();
            }
            Action::Back => self.to_strategy_select(),
            Action::Confirm => match self.form.apply(&self.config) {
                Ok(cfg) => {
                    self.config = cfg;
                    self.error = None;
                    self.preflight = None;
                    self.view = View::Preflight;
                    return Some(Effect::SaveConfig(self.config.clone()));
                }
                Err(e) => self.error = Some(e),
            },
            Action::Cancel | Action::Quit => {}
        }
        None
    }

    fn on_preflight(&mut self, action: Action) -> Option<Effect> {
        match action {
            Action::Back => {
                self.form = ConfigForm::from_config(&self.config);
                self.preflight = None;
                self.view = View::Configure;
                None
            }
            Action::Confirm => {
                let outcome = self.preflight.as_ref()?;
                if let Some(cause) = &outcome.report.error {
                    self.error = Some(format!("Run blocked: {}", cause));
                    return None;
                }
                if outcome.report.blocks_run() {
                    self.error = Some("Run blocked: raw device checks failed".to_string());
                    return None;
                }
                match &outcome.pipeline {
                    Ok(spec) => {
                        let spec = spec.clone();
                        self.error = None;
                        self.run = None;
                        self.view = View::Run;
                        Some(Effect::StartRun(spec))
                    }
                    Err(e) => {
                        self.error = Some(format!("Run blocked: {}", e));
                        None
                    }
                }
            }
            _ => None,
        }
    }

    fn on_run(&mut self, action: Action) -> Option<Effect> {
        if self.run_in_progress() {
            if matches!(action, Action::Cancel | Action::Back) {
                if let Some(run) = &self.run {
                    run.cancel();
                }
                self.notice = Some("Cancelling…".to_string());
            }
            return None;
        }

        if self.run.is_some() && matches!(action, Action::Confirm | Action::Back) {
            self.to_strategy_select();
        }
        None
    }
}

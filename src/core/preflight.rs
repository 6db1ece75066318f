//! Preflight validation: required tools, remote reachability, and
//! strategy-specific safety checks.
//!
//! Every check runs even after a failure so the operator sees the whole
//! picture at once. Lines are emitted in a fixed order (tools, reachability,
//! strategy extras) so reports from successive runs diff cleanly.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{BackupConfig, Strategy};
use crate::core::probe::{EnvironmentProbe, REACHABILITY_TIMEOUT};

/// Listing tool required before a raw device is read.
const DEVICE_LISTING_TOOL: &str = "lsblk";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
    /// Optional capability missing; never affects the verdict.
    Warn,
    /// Context for the operator, e.g. the device listing.
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckLine {
    pub status: CheckStatus,
    pub message: String,
}

impl fmt::Display for CheckLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let icon = match self.status {
            CheckStatus::Pass => "✓",
            CheckStatus::Fail => "✗",
            CheckStatus::Warn => "!",
            CheckStatus::Info => " ",
        };
        write!(f, "{} {}", icon, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub lines: Vec<CheckLine>,
    /// Set when a check that must block the run failed.
    pub blocking: bool,
    /// Error that ended validation early, if any.
    pub error: Option<String>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.lines.iter().all(|l| l.status != CheckStatus::Fail)
    }

    /// Report for checks that never finished. Nothing was verified, so
    /// it blocks the run.
    pub fn incomplete(cause: impl Into<String>) -> Self {
        Self {
            lines: Vec::new(),
            blocking: true,
            error: Some(cause.into()),
        }
    }

    /// The run may not start regardless of operator override.
    pub fn blocks_run(&self) -> bool {
        self.blocking || self.error.is_some()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckLine> {
        self.lines.iter().filter(|l| l.status == CheckStatus::Fail)
    }

    fn push(&mut self, status: CheckStatus, message: impl Into<String>) {
        self.lines.push(CheckLine {
            status,
            message: message.into(),
        });
    }

    fn check(&mut self, ok: bool, pass: impl Into<String>, fail: impl Into<String>) {
        if ok {
            self.push(CheckStatus::Pass, pass);
        } else {
            self.push(CheckStatus::Fail, fail);
        }
    }
}

/// Tools a strategy cannot run without, in report order.
pub fn required_tools(cfg: &BackupConfig) -> Vec<&'static str> {
    let mut tools = vec!["ssh", "rsync"];
    match cfg.strategy {
        Strategy::RawDevice => {
            tools.push("dd");
            tools.extend(cfg.compression.program());
        }
        Strategy::FileSync => {}
        Strategy::DedupArchive => tools.push("borg"),
        Strategy::ZfsSnapshot => tools.push("zfs"),
        Strategy::BtrfsSnapshot => tools.push("btrfs"),
    }
    tools
}

pub async fn validate(cfg: &BackupConfig, probe: &dyn EnvironmentProbe) -> PreflightReport {
    validate_with_timeout(cfg, probe, REACHABILITY_TIMEOUT).await
}

pub async fn validate_with_timeout(
    cfg: &BackupConfig,
    probe: &dyn EnvironmentProbe,
    timeout: Duration,
) -> PreflightReport {
    let mut report = PreflightReport::default();

    for tool in required_tools(cfg) {
        let found = probe.tool_available(tool);
        debug!(tool, found, "Tool check");
        report.check(found, tool, format!("missing {}", tool));
    }

    let remote = cfg.remote();
    match probe.remote_reachable(&remote, timeout).await {
        Ok(()) => report.push(CheckStatus::Pass, format!("ssh {} reachable", remote)),
        Err(e) => report.push(
            CheckStatus::Fail,
            format!("ssh {} unreachable: {}", remote, e),
        ),
    }

    if cfg.strategy == Strategy::RawDevice {
        raw_device_checks(cfg, probe, &mut report).await;
    }

    info!(
        strategy = %cfg.strategy,
        passed = report.passed(),
        blocking = report.blocks_run(),
        "Preflight complete"
    );
    report
}

/// Reading the wrong block device is unrecoverable, so these fail closed.
async fn raw_device_checks(
    cfg: &BackupConfig,
    probe: &dyn EnvironmentProbe,
    report: &mut PreflightReport,
) {
    if probe.tool_available("pv") {
        report.push(CheckStatus::Pass, "pv present (progress meter)");
    } else {
        report.push(CheckStatus::Warn, "pv not found, progress will be estimated");
    }

    let has_lister = probe.tool_available(DEVICE_LISTING_TOOL);
    report.check(
        has_lister,
        DEVICE_LISTING_TOOL,
        format!("need {} for raw device safety", DEVICE_LISTING_TOOL),
    );

    let has_source = !cfg.source_device.trim().is_empty();
    report.check(
        has_source,
        format!("source device {}", cfg.source_device),
        "source device not set",
    );

    if !has_lister || !has_source {
        report.blocking = true;
    }

    if has_lister {
        if let Some(listing) = probe.list_block_devices().await {
            for line in listing {
                report.push(CheckStatus::Info, line);
            }
        }
    }
}

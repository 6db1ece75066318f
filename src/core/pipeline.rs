//! Strategy → command pipeline construction.
//!
//! Building is pure: everything environmental (hostname, clock, which
//! optional tools exist) arrives through [`BuildContext`], so a given input
//! always yields the same [`PipelineSpec`].

use std::collections::BTreeSet;
use std::fmt;

use chrono::{Local, NaiveDateTime};

use crate::config::{BackupConfig, Remote, Strategy};
use crate::core::probe::{EnvironmentProbe, ssh_transport_args};
use crate::error::BuildError;

/// Optional tools the builder may splice in when present.
const OPTIONAL_TOOLS: [&str; 3] = ["pv", "gzip", "pigz"];

/// Passphrase variable borg reads natively.
const BORG_NATIVE_PASSPHRASE: &str = "BORG_PASSPHRASE";

/// One process in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for this process only. Values never carry secrets.
    pub env: Vec<(String, String)>,
}

impl Stage {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    /// Shell-equivalent rendering, for logs and the run view.
    pub fn display(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote_arg(v)))
            .collect();
        parts.push(self.program.clone());
        parts.extend(self.args.iter().map(|a| quote_arg(a)));
        parts.join(" ")
    }
}

/// Command run to completion before the pipeline starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub stage: Stage,
    /// Non-zero exit is tolerated (idempotent create-if-absent).
    pub allow_failure: bool,
}

/// Fully resolved description of one backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub strategy: Strategy,
    pub remote: Remote,
    pub setup: Vec<SetupStep>,
    /// stdout of stage i feeds stdin of stage i + 1.
    pub stages: Vec<Stage>,
    pub notes: Vec<String>,
}

impl PipelineSpec {
    pub fn final_stage(&self) -> Option<&Stage> {
        self.stages.last()
    }

    /// Every argument of every setup step and stage.
    pub fn all_args(&self) -> impl Iterator<Item = &str> {
        self.setup
            .iter()
            .map(|s| &s.stage)
            .chain(self.stages.iter())
            .flat_map(|s| s.args.iter().map(String::as_str))
    }

    pub fn display(&self) -> String {
        self.stages
            .iter()
            .map(Stage::display)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

impl fmt::Display for PipelineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.setup {
            let suffix = if step.allow_failure { "  # may fail" } else { "" };
            writeln!(f, "{}{}", step.stage.display(), suffix)?;
        }
        write!(f, "{}", self.display())
    }
}

/// Environment facts the builder needs, resolved once before building.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub hostname: String,
    pub timestamp: NaiveDateTime,
    pub available: BTreeSet<String>,
}

impl BuildContext {
    pub fn new<'a>(
        hostname: &str,
        timestamp: NaiveDateTime,
        available: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            hostname: hostname.to_string(),
            timestamp,
            available: available.into_iter().map(str::to_string).collect(),
        }
    }

    /// Resolve hostname, clock and optional tools from the running system.
    pub fn detect(probe: &dyn EnvironmentProbe) -> Self {
        let available = OPTIONAL_TOOLS
            .iter()
            .copied()
            .filter(|t| probe.tool_available(t));
        Self::new(&local_hostname(), Local::now().naive_local(), available)
    }

    pub fn has(&self, tool: &str) -> bool {
        self.available.contains(tool)
    }

    /// Second-resolution stamp so repeated same-day runs never collide.
    fn stamp(&self) -> String {
        self.timestamp.format("%Y%m%d-%H%M%S").to_string()
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "host".to_string())
}

/// Build the pipeline for `cfg.strategy`. Either a complete pipeline or an error;
/// never a partial pipeline.
pub fn build(cfg: &BackupConfig, ctx: &BuildContext) -> Result<PipelineSpec, BuildError> {
    let strategy = cfg.strategy;
    require(&cfg.remote_user, "remote user", strategy)?;
    require(&cfg.remote_host, "remote host", strategy)?;
    if cfg.ssh_port == 0 {
        return Err(BuildError::Invalid {
            field: "ssh port",
            reason: "must be a positive integer".to_string(),
        });
    }

    let cfg = cfg.with_hostname(&ctx.hostname);
    match strategy {
        Strategy::RawDevice => raw_device(&cfg, ctx),
        Strategy::FileSync => file_sync(&cfg),
        Strategy::DedupArchive => dedup_archive(&cfg, ctx),
        Strategy::ZfsSnapshot => zfs_snapshot(&cfg, ctx),
        Strategy::BtrfsSnapshot => btrfs_snapshot(&cfg, ctx),
    }
}

fn raw_device(cfg: &BackupConfig, ctx: &BuildContext) -> Result<PipelineSpec, BuildError> {
    require(&cfg.source_device, "source device", cfg.strategy)?;
    require(&cfg.remote_path, "remote path", cfg.strategy)?;

    let remote = cfg.remote();
    let dir = trim_dir(&cfg.remote_path);
    let mut notes = Vec::new();

    let compressor = match cfg.compression.program() {
        Some(program) if ctx.has(program) => Some(Stage::new(program, ["-c"])),
        Some(program) => {
            notes.push(format!("{} not found, streaming uncompressed", program));
            None
        }
        None => None,
    };
    let extension = if compressor.is_some() { ".img.gz" } else { ".img" };
    let remote_file = format!("{}/disk-{}{}", dir, ctx.stamp(), extension);

    let mut stages = vec![Stage::new(
        "dd",
        [
            format!("if={}", cfg.source_device),
            "bs=64K".to_string(),
            "status=progress".to_string(),
        ],
    )];
    if ctx.has("pv") {
        stages.push(Stage::new("pv", Vec::<String>::new()));
    }
    stages.extend(compressor);
    stages.push(ssh_stage(&remote, &format!("cat > {}", shell_escape(&remote_file))));

    notes.push(format!("Image: {}:{}", remote.host, remote_file));

    Ok(PipelineSpec {
        strategy: cfg.strategy,
        setup: vec![SetupStep {
            stage: ssh_stage(&remote, &format!("mkdir -p {}", shell_escape(dir))),
            allow_failure: false,
        }],
        remote,
        stages,
        notes,
    })
}

fn file_sync(cfg: &BackupConfig) -> Result<PipelineSpec, BuildError> {
    require(&cfg.remote_path, "remote path", cfg.strategy)?;

    let remote = cfg.remote();
    let mut args: Vec<String> = [
        "-aAXHvz",
        "--numeric-ids",
        "--delete-after",
        "--info=progress2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if cfg.bandwidth_kbps > 0 {
        args.push(format!("--bwlimit={}", cfg.bandwidth_kbps));
    }
    args.extend(cfg.excludes.iter().map(|ex| format!("--exclude={}", ex)));
    args.push("-e".to_string());
    args.push(ssh_command_string(remote.port));
    args.push("/".to_string());
    args.push(format!(
        "{}:{}/",
        remote.destination(),
        trim_dir(&cfg.remote_path)
    ));

    Ok(PipelineSpec {
        strategy: cfg.strategy,
        remote,
        setup: Vec::new(),
        stages: vec![Stage::new("rsync", args)],
        notes: Vec::new(),
    })
}

fn dedup_archive(cfg: &BackupConfig, ctx: &BuildContext) -> Result<PipelineSpec, BuildError> {
    require(&cfg.archive_repo, "archive repository", cfg.strategy)?;
    require(&cfg.passphrase_env, "passphrase variable", cfg.strategy)?;
    if !is_env_name(&cfg.passphrase_env) {
        return Err(BuildError::Invalid {
            field: "passphrase variable",
            reason: format!("{:?} is not an environment variable name", cfg.passphrase_env),
        });
    }

    let remote = cfg.remote();
    let with_borg_env = |stage: Stage| {
        let stage = stage.with_env("BORG_RSH", ssh_command_string(remote.port));
        if cfg.passphrase_env == BORG_NATIVE_PASSPHRASE {
            stage
        } else {
            // Expanded by the child shell, so only the name is ever visible.
            stage.with_env(
                "BORG_PASSCOMMAND",
                format!("sh -c 'printf %s \"${}\"'", cfg.passphrase_env),
            )
        }
    };

    let archive = format!(
        "{}::{}-{}",
        cfg.archive_repo,
        ctx.hostname,
        ctx.stamp()
    );

    let init = with_borg_env(Stage::new(
        "borg",
        ["init", "--encryption=repokey", cfg.archive_repo.as_str()],
    ));
    let create = with_borg_env(Stage::new(
        "borg",
        [
            "create",
            "--stats",
            "--progress",
            "--one-file-system",
            archive.as_str(),
            "/",
        ],
    ));

    Ok(PipelineSpec {
        strategy: cfg.strategy,
        setup: vec![SetupStep {
            stage: init,
            allow_failure: true,
        }],
        stages: vec![create],
        notes: vec![format!("Archive: {}", archive)],
        remote,
    })
}

fn zfs_snapshot(cfg: &BackupConfig, ctx: &BuildContext) -> Result<PipelineSpec, BuildError> {
    require(&cfg.source_device, "source dataset", cfg.strategy)?;
    require(&cfg.remote_path, "remote path", cfg.strategy)?;

    let remote = cfg.remote();
    let snapshot = format!("{}@bkstream-{}", cfg.source_device, ctx.stamp());
    let target = trim_dir(&cfg.remote_path);

    Ok(PipelineSpec {
        strategy: cfg.strategy,
        setup: vec![SetupStep {
            stage: Stage::new("zfs", ["snapshot", snapshot.as_str()]),
            allow_failure: false,
        }],
        stages: vec![
            Stage::new("zfs", ["send", snapshot.as_str()]),
            ssh_stage(&remote, &format!("zfs receive -u {}", shell_escape(target))),
        ],
        notes: vec![format!("Snapshot: {}", snapshot)],
        remote,
    })
}

fn btrfs_snapshot(cfg: &BackupConfig, ctx: &BuildContext) -> Result<PipelineSpec, BuildError> {
    require(&cfg.remote_path, "remote path", cfg.strategy)?;

    let remote = cfg.remote();
    let subvolume = if cfg.source_device.trim().is_empty() {
        "/"
    } else {
        cfg.source_device.as_str()
    };
    let snapshot = format!(
        "{}/.bkstream-{}",
        subvolume.trim_end_matches('/'),
        ctx.stamp()
    );
    let target = shell_escape(trim_dir(&cfg.remote_path));

    Ok(PipelineSpec {
        strategy: cfg.strategy,
        setup: vec![SetupStep {
            stage: Stage::new(
                "btrfs",
                ["subvolume", "snapshot", "-r", subvolume, snapshot.as_str()],
            ),
            allow_failure: false,
        }],
        stages: vec![
            Stage::new("btrfs", ["send", snapshot.as_str()]),
            ssh_stage(
                &remote,
                &format!("mkdir -p {} && btrfs receive {}", target, target),
            ),
        ],
        notes: vec![format!(
            "Read-only snapshot {} is kept locally; remove it with `btrfs subvolume delete`",
            snapshot
        )],
        remote,
    })
}

fn require(value: &str, field: &'static str, strategy: Strategy) -> Result<(), BuildError> {
    if value.trim().is_empty() {
        return Err(BuildError::MissingField {
            field,
            strategy: strategy.as_str(),
        });
    }
    Ok(())
}

fn ssh_stage(remote: &Remote, remote_command: &str) -> Stage {
    let mut args = ssh_transport_args(remote.port);
    args.push(remote.destination());
    args.push(remote_command.to_string());
    Stage::new("ssh", args)
}

/// Transport as a single string, for tools taking an `-e`/`*_RSH` command.
fn ssh_command_string(port: u16) -> String {
    let mut parts = vec!["ssh".to_string()];
    parts.extend(ssh_transport_args(port));
    parts.join(" ")
}

fn trim_dir(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn quote_arg(s: &str) -> String {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@,+%".contains(c));
    if plain { s.to_string() } else { shell_escape(s) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use chrono::NaiveDate;

    fn ctx(tools: &[&str]) -> BuildContext {
        let ts = NaiveDate::from_ymd_opt(2025, 10, 1)
            .unwrap()
            .and_hms_opt(9, 30, 5)
            .unwrap();
        BuildContext::new("laptop", ts, tools.iter().copied())
    }

    fn cfg(strategy: Strategy) -> BackupConfig {
        BackupConfig {
            remote_user: "backup".to_string(),
            remote_host: "nas.lan".to_string(),
            ssh_port: 2222,
            strategy,
            source_device: "/dev/sda".to_string(),
            archive_repo: "ssh://backup@nas.lan:2222/srv/borg/$(hostname)".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn raw_device_full_pipeline() {
        let spec = build(&cfg(Strategy::RawDevice), &ctx(&["pv", "pigz"])).unwrap();
        let programs: Vec<_> = spec.stages.iter().map(|s| s.program.as_str()).collect();
        assert_eq!(programs, ["dd", "pv", "pigz", "ssh"]);
        assert_eq!(spec.stages[0].args[0], "if=/dev/sda");

        let sink = spec.final_stage().unwrap();
        assert_eq!(
            sink.args.last().unwrap(),
            "cat > '/backups/laptop/disk-20251001-093005.img.gz'"
        );
        assert_eq!(
            spec.setup[0].stage.args.last().unwrap(),
            "mkdir -p '/backups/laptop'"
        );
    }

    #[test]
    fn raw_device_skips_unavailable_compressor() {
        let spec = build(&cfg(Strategy::RawDevice), &ctx(&[])).unwrap();
        let programs: Vec<_> = spec.stages.iter().map(|s| s.program.as_str()).collect();
        assert_eq!(programs, ["dd", "ssh"]);
        assert!(spec.final_stage().unwrap().args.last().unwrap().ends_with(".img'"));
        assert!(spec.notes.iter().any(|n| n.contains("pigz not found")));
    }

    #[test]
    fn raw_device_without_compression_has_no_compressor() {
        let config = BackupConfig {
            compression: Compression::None,
            ..cfg(Strategy::RawDevice)
        };
        let spec = build(&config, &ctx(&["gzip", "pigz"])).unwrap();
        assert!(spec.stages.iter().all(|s| s.program != "gzip" && s.program != "pigz"));
    }

    #[test]
    fn raw_device_requires_source() {
        let config = BackupConfig {
            source_device: "  ".to_string(),
            ..cfg(Strategy::RawDevice)
        };
        assert_eq!(
            build(&config, &ctx(&[])),
            Err(BuildError::MissingField {
                field: "source device",
                strategy: "raw-device"
            })
        );
    }

    #[test]
    fn file_sync_transport_uses_port() {
        let spec = build(&cfg(Strategy::FileSync), &ctx(&[])).unwrap();
        let args = &spec.final_stage().unwrap().args;
        assert!(args.contains(&"ssh -p 2222 -o BatchMode=yes".to_string()));
        assert_eq!(args.last().unwrap(), "backup@nas.lan:/backups/laptop/");
        assert_eq!(args[args.len() - 2], "/");
    }

    #[test]
    fn dedup_archive_keeps_passphrase_out_of_argv() {
        let config = BackupConfig {
            passphrase_env: "MY_BORG_SECRET".to_string(),
            ..cfg(Strategy::DedupArchive)
        };
        let spec = build(&config, &ctx(&[])).unwrap();
        let create = spec.final_stage().unwrap();

        assert!(create.args.contains(
            &"ssh://backup@nas.lan:2222/srv/borg/laptop::laptop-20251001-093005".to_string()
        ));
        assert!(spec.setup[0].allow_failure);
        assert_eq!(spec.setup[0].stage.args[0], "init");

        let passcommand = create
            .env
            .iter()
            .find(|(k, _)| k == "BORG_PASSCOMMAND")
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert_eq!(passcommand, "sh -c 'printf %s \"$MY_BORG_SECRET\"'");
        assert!(spec.all_args().all(|a| !a.contains("MY_BORG_SECRET")));
    }

    #[test]
    fn dedup_archive_native_variable_needs_no_passcommand() {
        let spec = build(&cfg(Strategy::DedupArchive), &ctx(&[])).unwrap();
        let create = spec.final_stage().unwrap();
        assert!(create.env.iter().all(|(k, _)| k != "BORG_PASSCOMMAND"));
        assert!(create
            .env
            .contains(&("BORG_RSH".to_string(), "ssh -p 2222 -o BatchMode=yes".to_string())));
    }

    #[test]
    fn dedup_archive_rejects_bad_variable_name() {
        let config = BackupConfig {
            passphrase_env: "X; rm -rf /".to_string(),
            ..cfg(Strategy::DedupArchive)
        };
        assert!(matches!(
            build(&config, &ctx(&[])),
            Err(BuildError::Invalid { field: "passphrase variable", .. })
        ));
    }

    #[test]
    fn zfs_snapshot_is_sent_to_remote_receive() {
        let config = BackupConfig {
            source_device: "tank/root".to_string(),
            remote_path: "backup/$(hostname)".to_string(),
            ..cfg(Strategy::ZfsSnapshot)
        };
        let spec = build(&config, &ctx(&[])).unwrap();
        assert_eq!(
            spec.setup[0].stage.args,
            ["snapshot", "tank/root@bkstream-20251001-093005"]
        );
        assert_eq!(spec.stages[0].args, ["send", "tank/root@bkstream-20251001-093005"]);
        assert_eq!(
            spec.final_stage().unwrap().args.last().unwrap(),
            "zfs receive -u 'backup/laptop'"
        );
    }

    #[test]
    fn btrfs_snapshot_defaults_to_root_subvolume() {
        let config = BackupConfig {
            source_device: String::new(),
            ..cfg(Strategy::BtrfsSnapshot)
        };
        let spec = build(&config, &ctx(&[])).unwrap();
        assert_eq!(
            spec.setup[0].stage.args,
            ["subvolume", "snapshot", "-r", "/", "/.bkstream-20251001-093005"]
        );
        assert_eq!(spec.stages[0].args, ["send", "/.bkstream-20251001-093005"]);
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let stage = Stage::new("ssh", ["-p", "22", "u@h", "cat > '/x'"]);
        assert_eq!(stage.display(), "ssh -p 22 u@h 'cat > '\\''/x'\\'''");
    }

    #[test]
    fn env_name_validation() {
        assert!(is_env_name("BORG_PASSPHRASE"));
        assert!(is_env_name("_x1"));
        assert!(!is_env_name("1X"));
        assert!(!is_env_name(""));
        assert!(!is_env_name("A-B"));
    }
}

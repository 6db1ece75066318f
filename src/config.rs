//! Persistent backup configuration.
//!
//! The configuration lives at `$XDG_CONFIG_HOME/bkstream/config.toml` and is
//! layered with figment: built-in defaults, then the TOML file, then
//! `BKSTREAM_*` environment overrides. Secrets are never stored; only the name
//! of the environment variable holding the archive passphrase is.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;

const CONFIG_DIR_NAME: &str = "bkstream";
const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_PREFIX: &str = "BKSTREAM_";

/// Placeholder in remote paths replaced by the local hostname at run time.
pub const HOSTNAME_PLACEHOLDER: &str = "$(hostname)";

/// Backup transfer method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    RawDevice,
    FileSync,
    DedupArchive,
    ZfsSnapshot,
    BtrfsSnapshot,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::RawDevice,
        Strategy::FileSync,
        Strategy::DedupArchive,
        Strategy::ZfsSnapshot,
        Strategy::BtrfsSnapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawDevice => "raw-device",
            Self::FileSync => "file-sync",
            Self::DedupArchive => "dedup-archive",
            Self::ZfsSnapshot => "zfs-snapshot",
            Self::BtrfsSnapshot => "btrfs-snapshot",
        }
    }

    /// One-line description shown in the strategy picker.
    pub fn description(&self) -> &'static str {
        match self {
            Self::RawDevice => "Raw disk stream (dd → ssh)",
            Self::FileSync => "Rsync file-level (fast/smart)",
            Self::DedupArchive => "Borg encrypted (dedup/incremental)",
            Self::ZfsSnapshot => "ZFS snapshot send/receive",
            Self::BtrfsSnapshot => "Btrfs snapshot send/receive",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
    Pigz,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Pigz => "pigz",
        }
    }

    /// Executable implementing this compression, if any.
    pub fn program(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Pigz => Some("pigz"),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Some(Self::None),
            "gzip" => Some(Self::Gzip),
            "pigz" => Some(Self::Pigz),
            _ => None,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote principal the transport connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Remote {
    /// `user@host` as passed to ssh.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub remote_user: String,
    pub remote_host: String,
    pub ssh_port: u16,
    pub remote_path: String,
    pub strategy: Strategy,
    /// Block device (raw-device), dataset (zfs-snapshot) or subvolume (btrfs-snapshot).
    pub source_device: String,
    pub compression: Compression,
    /// 0 = unlimited
    pub bandwidth_kbps: u32,
    pub excludes: Vec<String>,
    pub archive_repo: String,
    /// Name of the environment variable holding the archive passphrase.
    pub passphrase_env: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            remote_user: std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
            remote_host: String::new(),
            ssh_port: 22,
            remote_path: format!("/backups/{}", HOSTNAME_PLACEHOLDER),
            strategy: Strategy::FileSync,
            source_device: String::new(),
            compression: Compression::Pigz,
            bandwidth_kbps: 0,
            excludes: [
                "/dev/*",
                "/proc/*",
                "/sys/*",
                "/tmp/*",
                "/run/*",
                "/mnt/*",
                "/media/*",
                "/lost+found",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            archive_repo: String::new(),
            passphrase_env: "BORG_PASSPHRASE".to_string(),
        }
    }
}

/// Result of loading: always a usable config, plus the error that forced
/// a fallback to defaults, if any.
#[derive(Debug)]
pub struct Loaded {
    pub config: BackupConfig,
    pub warning: Option<ConfigError>,
}

impl BackupConfig {
    pub fn remote(&self) -> Remote {
        Remote {
            user: self.remote_user.clone(),
            host: self.remote_host.clone(),
            port: self.ssh_port,
        }
    }

    /// Check field-level invariants that do not depend on the strategy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh_port == 0 {
            return Err(ConfigError::Invalid {
                field: "ssh_port",
                reason: "must be a positive integer".to_string(),
            });
        }
        Ok(())
    }

    /// Copy of this config with every `$(hostname)` placeholder replaced.
    pub fn with_hostname(&self, hostname: &str) -> Self {
        Self {
            remote_path: self.remote_path.replace(HOSTNAME_PLACEHOLDER, hostname),
            archive_repo: self.archive_repo.replace(HOSTNAME_PLACEHOLDER, hostname),
            ..self.clone()
        }
    }

    /// Load from the default per-user location.
    pub fn load() -> Loaded {
        match default_path() {
            Some(path) => Self::load_from(&path),
            None => Loaded {
                config: Self::default(),
                warning: Some(ConfigError::NoConfigDir),
            },
        }
    }

    /// Load from `path`. A missing file yields defaults silently; an
    /// unreadable or unparseable one yields defaults and a warning.
    pub fn load_from(path: &Path) -> Loaded {
        let figment = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        let loaded = figment.extract::<Self>().map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: Box::new(e),
        });

        match loaded.and_then(|c| c.validate().map(|_| c)) {
            Ok(config) => {
                debug!(path = %path.display(), "Loaded configuration");
                Loaded {
                    config,
                    warning: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "Falling back to default configuration");
                Loaded {
                    config: Self::default(),
                    warning: Some(e),
                }
            }
        }
    }

    /// Save to the default per-user location.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Write-then-rename so a torn write never replaces the previous file.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            create_private_dir(parent).map_err(write_err)?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        {
            let mut file = open_private(&tmp_path).map_err(write_err)?;
            file.write_all(content.as_bytes()).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        fs::rename(&tmp_path, path).map_err(write_err)?;

        debug!(path = %path.display(), "Saved configuration");
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/bkstream/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_safe() {
        let cfg = BackupConfig::default();
        assert!(cfg.source_device.is_empty());
        assert!(cfg.remote_host.is_empty());
        assert_eq!(cfg.ssh_port, 22);
        assert_eq!(cfg.strategy, Strategy::FileSync);
        assert_eq!(cfg.passphrase_env, "BORG_PASSPHRASE");
    }

    #[test]
    fn missing_file_loads_defaults_without_warning() {
        let dir = tempdir().unwrap();
        let loaded = BackupConfig::load_from(&dir.path().join("absent.toml"));
        assert!(loaded.warning.is_none());
        assert_eq!(loaded.config, BackupConfig::default());
    }

    #[test]
    fn unparseable_file_falls_back_with_warning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "strategy = \"floppy-disk\"\nssh_port = [").unwrap();

        let loaded = BackupConfig::load_from(&path);
        assert!(matches!(loaded.warning, Some(ConfigError::Read { .. })));
        assert_eq!(loaded.config, BackupConfig::default());
    }

    #[test]
    fn zero_port_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "ssh_port = 0\n").unwrap();

        let loaded = BackupConfig::load_from(&path);
        assert!(matches!(
            loaded.warning,
            Some(ConfigError::Invalid { field: "ssh_port", .. })
        ));
    }

    #[test]
    fn partial_file_is_filled_from_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "remote_host = \"nas.lan\"\nstrategy = \"zfs-snapshot\"\n").unwrap();

        let loaded = BackupConfig::load_from(&path);
        assert!(loaded.warning.is_none());
        assert_eq!(loaded.config.remote_host, "nas.lan");
        assert_eq!(loaded.config.strategy, Strategy::ZfsSnapshot);
        assert_eq!(loaded.config.ssh_port, 22);
    }

    #[test]
    fn save_creates_private_file_and_no_temp_leftover() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        BackupConfig::default().save_to(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn hostname_substitution_covers_path_and_repo() {
        let cfg = BackupConfig {
            archive_repo: "ssh://u@h/borg/$(hostname)".to_string(),
            ..Default::default()
        };
        let resolved = cfg.with_hostname("laptop");
        assert_eq!(resolved.remote_path, "/backups/laptop");
        assert_eq!(resolved.archive_repo, "ssh://u@h/borg/laptop");
    }

    #[test]
    fn compression_parse() {
        assert_eq!(Compression::parse("PIGZ"), Some(Compression::Pigz));
        assert_eq!(Compression::parse(""), Some(Compression::None));
        assert_eq!(Compression::parse("zstd"), None);
    }
}

//! Persistence of the backup configuration.

use bkstream::config::{BackupConfig, Compression, Strategy};
use tempfile::tempdir;

#[test]
fn save_then_load_restores_every_field() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let cfg = BackupConfig {
        remote_user: "ops".to_string(),
        remote_host: "vault.example.net".to_string(),
        ssh_port: 2201,
        remote_path: "/srv/backups/$(hostname)".to_string(),
        strategy: Strategy::DedupArchive,
        source_device: "/dev/nvme0n1".to_string(),
        compression: Compression::Gzip,
        bandwidth_kbps: 750,
        excludes: vec!["/proc/*".to_string(), "/home/*/.cache".to_string()],
        archive_repo: "ssh://ops@vault.example.net:2201/srv/borg".to_string(),
        passphrase_env: "VAULT_BORG_KEY".to_string(),
    };
    cfg.save_to(&path).unwrap();

    let loaded = BackupConfig::load_from(&path);
    assert!(loaded.warning.is_none());
    assert_eq!(loaded.config, cfg);
}

#[test]
fn missing_file_loads_defaults_silently() {
    let dir = tempdir().unwrap();
    let loaded = BackupConfig::load_from(&dir.path().join("absent.toml"));
    assert!(loaded.warning.is_none());
    assert_eq!(loaded.config.ssh_port, 22);
    assert_eq!(loaded.config.strategy, Strategy::FileSync);
}

#[test]
fn malformed_file_falls_back_with_warning() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "ssh_port = \"not a number\"\n").unwrap();

    let loaded = BackupConfig::load_from(&path);
    assert!(loaded.warning.is_some());
    assert_eq!(loaded.config.ssh_port, 22);
}

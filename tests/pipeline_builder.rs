//! Pipeline construction properties across every strategy.

use bkstream::config::{BackupConfig, HOSTNAME_PLACEHOLDER, Strategy};
use bkstream::core::pipeline::{BuildContext, PipelineSpec, build};
use bkstream::error::BuildError;
use chrono::NaiveDate;

fn ctx() -> BuildContext {
    let ts = NaiveDate::from_ymd_opt(2025, 9, 30)
        .unwrap()
        .and_hms_opt(23, 59, 59)
        .unwrap();
    BuildContext::new("workstation", ts, ["pv", "gzip", "pigz"])
}

/// Smallest config each strategy accepts.
fn minimal(strategy: Strategy) -> BackupConfig {
    let mut cfg = BackupConfig {
        remote_user: "ops".to_string(),
        remote_host: "vault.example.net".to_string(),
        ssh_port: 2201,
        strategy,
        excludes: Vec::new(),
        ..Default::default()
    };
    match strategy {
        Strategy::RawDevice => cfg.source_device = "/dev/sdb".to_string(),
        Strategy::ZfsSnapshot => cfg.source_device = "rpool/ROOT".to_string(),
        Strategy::DedupArchive => {
            cfg.archive_repo =
                format!("ssh://ops@vault.example.net:2201/borg/{}", HOSTNAME_PLACEHOLDER)
        }
        Strategy::FileSync | Strategy::BtrfsSnapshot => {}
    }
    cfg
}

fn assert_targets_remote(spec: &PipelineSpec) {
    let last = spec.final_stage().expect("pipeline has stages");
    assert_eq!(spec.remote.host, "vault.example.net");
    assert_eq!(spec.remote.port, 2201);

    let mentions_principal = last
        .args
        .iter()
        .any(|a| a.contains("ops@vault.example.net"));
    assert!(mentions_principal, "final stage misses principal: {:?}", last);

    let mentions_port = last.args.windows(2).any(|w| w[0] == "-p" && w[1] == "2201")
        || last.args.iter().any(|a| a.contains("-p 2201"))
        || last.env.iter().any(|(_, v)| v.contains("-p 2201"));
    assert!(mentions_port, "final stage misses port: {:?}", last);
}

#[test]
fn every_strategy_targets_configured_remote() {
    for strategy in Strategy::ALL {
        let spec = build(&minimal(strategy), &ctx())
            .unwrap_or_else(|e| panic!("{} failed to build: {}", strategy, e));
        assert_eq!(spec.strategy, strategy);
        assert_targets_remote(&spec);
    }
}

#[test]
fn hostname_placeholder_never_survives() {
    for strategy in Strategy::ALL {
        let spec = build(&minimal(strategy), &ctx()).unwrap();
        for arg in spec.all_args() {
            assert!(!arg.contains(HOSTNAME_PLACEHOLDER), "{}: {}", strategy, arg);
        }
        for stage in &spec.stages {
            for (_, value) in &stage.env {
                assert!(!value.contains(HOSTNAME_PLACEHOLDER));
            }
        }
        assert!(spec.all_args().any(|a| a.contains("workstation")), "{}", strategy);
    }
}

#[test]
fn missing_required_field_yields_error_not_spec() {
    let cases: [(Strategy, fn(&mut BackupConfig), &str); 5] = [
        (Strategy::RawDevice, |c| c.source_device.clear(), "source device"),
        (Strategy::FileSync, |c| c.remote_host.clear(), "remote host"),
        (Strategy::DedupArchive, |c| c.archive_repo.clear(), "archive repository"),
        (Strategy::ZfsSnapshot, |c| c.source_device.clear(), "source dataset"),
        (Strategy::BtrfsSnapshot, |c| c.remote_user.clear(), "remote user"),
    ];

    for (strategy, strip, field) in cases {
        let mut cfg = minimal(strategy);
        strip(&mut cfg);
        match build(&cfg, &ctx()) {
            Err(BuildError::MissingField { field: f, .. }) => assert_eq!(f, field),
            other => panic!("{}: expected missing {}, got {:?}", strategy, field, other),
        }
    }
}

#[test]
fn file_sync_bandwidth_and_excludes() {
    let cfg = BackupConfig {
        excludes: vec!["/proc/*".to_string()],
        bandwidth_kbps: 500,
        ..minimal(Strategy::FileSync)
    };
    let spec = build(&cfg, &ctx()).unwrap();
    let args = &spec.final_stage().unwrap().args;
    assert!(args.contains(&"--bwlimit=500".to_string()));
    assert!(args.contains(&"--exclude=/proc/*".to_string()));

    let bare = minimal(Strategy::FileSync);
    let spec = build(&bare, &ctx()).unwrap();
    let args = &spec.final_stage().unwrap().args;
    assert!(!args.iter().any(|a| a.starts_with("--bwlimit")));
    assert!(!args.iter().any(|a| a.starts_with("--exclude")));
}

#[test]
fn excludes_keep_configured_order() {
    let cfg = BackupConfig {
        excludes: vec!["/sys/*".to_string(), "/dev/*".to_string(), "/tmp/*".to_string()],
        ..minimal(Strategy::FileSync)
    };
    let spec = build(&cfg, &ctx()).unwrap();
    let excludes: Vec<_> = spec
        .final_stage()
        .unwrap()
        .args
        .iter()
        .filter(|a| a.starts_with("--exclude="))
        .cloned()
        .collect();
    assert_eq!(
        excludes,
        ["--exclude=/sys/*", "--exclude=/dev/*", "--exclude=/tmp/*"]
    );
}

#[test]
fn snapshot_names_differ_across_seconds() {
    let later = BuildContext::new(
        "workstation",
        NaiveDate::from_ymd_opt(2025, 9, 30)
            .unwrap()
            .and_hms_opt(23, 59, 58)
            .unwrap(),
        ["pv"],
    );
    let cfg = minimal(Strategy::ZfsSnapshot);
    let a = build(&cfg, &ctx()).unwrap();
    let b = build(&cfg, &later).unwrap();
    assert_ne!(a.setup[0].stage.args, b.setup[0].stage.args);
}

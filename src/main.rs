use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bkstream::cli::tui;
use bkstream::config::{self, BackupConfig, Loaded, Strategy};
use bkstream::core::{
    BuildContext, RunEvent, RunOutcome, SystemProbe, build, create_executor, validate,
};
use bkstream::logging::{self, LogConfig};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

#[derive(Parser)]
#[command(name = "bkstream")]
#[command(about = "Stream full machine backups to a remote host over SSH", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args)]
struct GlobalArgs {
    /// Config file (default: $XDG_CONFIG_HOME/bkstream/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured strategy for this invocation
    #[arg(long, global = true, value_enum)]
    strategy: Option<Strategy>,

    #[arg(long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Replay fake output instead of running the pipeline
    #[arg(long, global = true)]
    simulation: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive session (default)
    Tui,
    /// Run preflight checks and print the report
    Preflight,
    /// Print the pipeline the current config would run
    Plan,
    /// Run the backup without the TUI
    Run {
        /// Confirm the run; required because the pipeline reads whole devices
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Tui);
    let interactive = matches!(command, Commands::Tui);

    let log_config = LogConfig {
        json: cli.global.json_logs,
        verbose: cli.global.verbose,
        file: if interactive {
            logging::default_log_path()
        } else {
            None
        },
    };
    if let Err(e) = logging::init(log_config) {
        eprintln!("warning: logging disabled: {:#}", e);
    }

    let config_path = match cli.global.config.clone() {
        Some(path) => path,
        None => config::default_path().context("No per-user configuration directory")?,
    };
    let mut loaded = BackupConfig::load_from(&config_path);
    if let Some(strategy) = cli.global.strategy {
        loaded.config.strategy = strategy;
    }

    match command {
        Commands::Tui => {
            let runtime = tui::Runtime {
                probe: Arc::new(SystemProbe),
                executor: create_executor(cli.global.simulation),
                config_path,
            };
            tui::run(loaded, runtime)
                .await
                .context("Interactive session failed")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Preflight => run_preflight(loaded).await,
        Commands::Plan => run_plan(loaded),
        Commands::Run { yes } => run_headless(loaded, yes, cli.global.simulation).await,
    }
}

fn surface_warning(loaded: &Loaded) {
    if let Some(w) = &loaded.warning {
        warn!(error = %w, "Using default configuration");
        eprintln!("warning: {} (using defaults)", w);
    }
}

async fn run_preflight(loaded: Loaded) -> Result<ExitCode> {
    surface_warning(&loaded);
    let report = validate(&loaded.config, &SystemProbe).await;
    for line in &report.lines {
        println!("{}", line);
    }
    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_plan(loaded: Loaded) -> Result<ExitCode> {
    surface_warning(&loaded);
    let ctx = BuildContext::detect(&SystemProbe);
    let spec = build(&loaded.config, &ctx).context("Cannot build pipeline")?;
    for note in &spec.notes {
        println!("# {}", note);
    }
    println!("{}", spec);
    Ok(ExitCode::SUCCESS)
}

async fn run_headless(loaded: Loaded, yes: bool, simulation: bool) -> Result<ExitCode> {
    surface_warning(&loaded);
    if !yes {
        bail!("Refusing to run without --yes");
    }

    let cfg = loaded.config;
    let report = validate(&cfg, &SystemProbe).await;
    for line in report.failures() {
        eprintln!("{}", line);
    }
    if report.blocks_run() {
        bail!("Preflight blocked the run");
    }

    let ctx = BuildContext::detect(&SystemProbe);
    let spec = build(&cfg, &ctx).context("Cannot build pipeline")?;

    let mut handle = create_executor(simulation).start(spec);
    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    while let Some(event) = handle.events.recv().await {
        match event {
            RunEvent::Line { text, .. } => println!("{}", text),
            RunEvent::Finished(RunOutcome::Success) => {
                eprintln!("✔ Backup complete");
                return Ok(ExitCode::SUCCESS);
            }
            RunEvent::Finished(RunOutcome::Cancelled) => {
                eprintln!("Backup cancelled");
                return Ok(ExitCode::from(130));
            }
            RunEvent::Finished(RunOutcome::Failed(cause)) => {
                eprintln!("✗ Backup failed: {}", cause);
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    bail!("Run ended without a completion event")
}

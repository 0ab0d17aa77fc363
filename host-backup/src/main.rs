//! Host Backup - Main entry point
//!
//! Backs up the running host's configured data-sets into a new generation.

use clap::Parser;
use host_backup::catalog::timestamp::Timestamp;
use host_backup::config::{self, Config, HostConfig};
use host_backup::fs::probe::FindmntProbe;
use host_backup::reconcile::run_log_path;
use host_backup::shutdown::ShutdownCoordinator;
use host_backup::utils::logger::{self, RunLogSink};
use host_backup::{run_backup, BackupError, RunContext, RunOptions};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Backup selected files", long_about = None)]
struct Args {
    /// Path to YAML (or TOML) configuration file
    #[arg(short, long, value_name = "CONFIGFILE")]
    config: Option<PathBuf>,

    /// Print debug messages to the console
    #[arg(short, long)]
    debug: bool,

    /// Don't actually back up anything; report what would be done
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Run a Full backup regardless of the partial count
    #[arg(short, long)]
    full: bool,
}

/// Load the configuration and resolve the section for this machine.
fn load_host_config(args: &Args) -> Result<HostConfig, BackupError> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => {
            let exe = std::env::current_exe()?;
            config::default_config_path(&exe).ok_or_else(|| {
                BackupError::Config(format!(
                    "No configuration file given and none found next to {}",
                    exe.display()
                ))
            })?
        }
    };

    let config_path = std::fs::canonicalize(&config_path)?;
    let config = Config::from_file(&config_path)?;
    let base_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));

    let hostname = hostname::get()?.to_string_lossy().to_string();
    let host = config
        .resolve_host_name(&hostname)
        .ok_or_else(|| BackupError::HostNotConfigured {
            host: hostname.clone(),
            config: config_path.clone(),
        })?;

    let host_config = config.for_host(&host, &base_dir, &config_path)?;
    if args.debug {
        eprintln!("Configuration for host '{}'\n{:#?}", host, host_config);
    }
    Ok(host_config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let host_config = match load_host_config(&args) {
        Ok(host_config) => host_config,
        Err(e) => {
            eprintln!("{}; exiting.", e);
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = config::check_identity(&host_config.uid) {
        eprintln!("{}; exiting.", e);
        return ExitCode::from(e.exit_code());
    }

    let ctx = RunContext::new(&host_config.host, Timestamp::now(), args.dry_run);

    // Run log file, skipped on dry runs
    let run_log = if args.dry_run {
        None
    } else {
        let opened = std::fs::create_dir_all(&host_config.log_dir).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(run_log_path(&host_config.log_dir, &ctx.host, &ctx.timestamp))
        });
        match opened {
            Ok(file) => Some(RunLogSink {
                file,
                level: host_config.log_level.clone(),
            }),
            Err(e) => {
                eprintln!("Cannot open run log in {}: {}; exiting.", host_config.log_dir.display(), e);
                return ExitCode::from(1);
            }
        }
    };

    let console_level = if args.debug { "debug" } else { "info" };
    if let Err(e) = logger::init(console_level, run_log) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::from(1);
    }

    tracing::info!(
        "Starting host-backup v{} (host: {}, run_id: {})",
        env!("CARGO_PKG_VERSION"),
        ctx.host,
        ctx.run_id
    );

    // Cancel the run on SIGINT/SIGTERM
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let cancel = shutdown.token();
    let signal_watcher = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { shutdown.wait_for_signal().await })
    };

    let options = RunOptions {
        force_full: args.full,
    };
    let result = run_backup(&host_config, &ctx, options, &FindmntProbe, &cancel).await;

    shutdown.shutdown();
    let _ = signal_watcher.await;

    match result {
        Ok(report) => {
            tracing::debug!("{:?}", report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}; exiting.", e);
            ExitCode::from(e.exit_code())
        }
    }
}

//! CLI entry point for the Fetch Relay Daemon
//!
//! Parses command line arguments, loads configuration and starts the daemon.

use clap::Parser;
use fetch_relay_daemon::{init_logging, Config, Daemon, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// Fetch Relay Daemon - media download orchestration with live progress
#[derive(Parser, Debug)]
#[command(name = "fetch-relay-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml). Defaults and
    /// environment overrides are used when it does not exist.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the listen address, e.g. 0.0.0.0:8080
    #[arg(short, long)]
    bind: Option<String>,

    /// Skip startup checks (downloader, ffmpeg). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

fn load_config(args: &Args) -> Result<Config, DaemonError> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        warn!(path = %args.config.display(), "config file not found, using defaults and environment");
        Config::from_env()
    };
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    info!(config = %args.config.display(), "fetch relay daemon starting");

    let daemon_result = load_config(&args).and_then(|config| {
        if args.skip_checks {
            warn!("skipping startup checks (--skip-checks enabled)");
            Ok(Daemon::new_without_checks(config))
        } else {
            Daemon::new(config)
        }
    });

    match daemon_result {
        Ok(daemon) => {
            info!(
                bind = %daemon.config.server.bind,
                max_concurrent_jobs = daemon.config.limits.max_concurrent_jobs,
                "daemon initialized"
            );

            if let Err(e) = daemon.run_with_server().await {
                error!(error = %e, "daemon error");
                return ExitCode::FAILURE;
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}

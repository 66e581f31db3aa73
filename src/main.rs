use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use fleetctl::backend::build_backend;
use fleetctl::cli::{run_config_command, run_fleet_command, Cli, Commands};
use fleetctl::config::{default_config_path, load_config_from};
use fleetctl::fleet::Fleet;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = match load_config_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {}: {}", config_path.display(), e);
            process::exit(1);
        }
    };
    debug!("Loaded config from {}", config_path.display());

    if let Commands::Config(ref command) = cli.command {
        match run_config_command(command, &config, &config_path) {
            Ok(output) => print!("{}", output),
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        }
        return;
    }

    let backend = match build_backend(&config.backend) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to initialize {:?} backend: {}", config.backend.kind, e);
            process::exit(1);
        }
    };

    let fleet = match Fleet::new(Arc::clone(&backend), config) {
        Ok(fleet) => fleet,
        Err(e) => {
            error!("Invalid config: {}", e);
            process::exit(1);
        }
    };

    // Ctrl-C stops queued work; in-flight records report cancelled
    let cancel = fleet.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling remaining work");
            cancel.cancel();
        }
    });

    match run_fleet_command(&fleet, &cli.command).await {
        Ok(output) => print!("{}", output),
        Err(e) => {
            if let Some(output) = e.output() {
                print!("{}", output);
            }
            error!("{}", e);
            process::exit(1);
        }
    }
}

//! Periodically collects running configs from network devices and writes
//! them to a directory.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config_harvester::config::Config;
use config_harvester::harvest::HarvestCoordinator;
use config_harvester::persist::{write_configs, write_summary};
use config_harvester::snmp::SnmpConnector;
use config_harvester::Device;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "config-harvester", version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single harvest cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    let connector = Arc::new(SnmpConnector::new(config.snmp_settings())?);
    let coordinator = HarvestCoordinator::new(connector, config.harvest_settings());
    let devices = config.devices();
    info!(
        devices = devices.len(),
        concurrency = config.concurrency,
        output = %config.output_dir.display(),
        "Config harvester started"
    );

    loop {
        if let Err(e) = run(&coordinator, &config, &devices).await {
            error!(error = %e, "Could not finish run");
        }
        if args.once {
            break;
        }

        info!(secs = config.run_interval_secs, "Waiting for next run");
        tokio::select! {
            _ = tokio::time::sleep(config.run_interval()) => {}
            signal = shutdown_signal() => {
                signal?;
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn run(
    coordinator: &HarvestCoordinator<SnmpConnector>,
    config: &Config,
    devices: &[Device],
) -> Result<(), BoxError> {
    let result = coordinator.harvest(devices, config.concurrency).await;

    let configs = result.reassociate(devices);
    let missing: Vec<String> = result
        .missing(devices)
        .into_iter()
        .map(|d| d.name().to_string())
        .collect();
    for name in &missing {
        warn!(device = %name, "No config received");
    }

    let dir = config.output_dir.clone();
    let stats = result.stats.clone();
    let changed = tokio::task::spawn_blocking(move || {
        let changed = write_configs(&dir, &configs)?;
        write_summary(&dir, &stats, &missing)?;
        Ok::<_, BoxError>(changed)
    })
    .await??;

    info!(changed = changed.len(), "Configs updated");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

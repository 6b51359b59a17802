//! Location service entry point

use anyhow::Context;
use clap::Parser;
use location_service::{LocationComponent, LocationService};
use strand_actors::{Fiber, LocalNetwork};
use strand_config::{load_config, StrandConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Process id, overrides `process.id`
    #[arg(short, long)]
    process: Option<u32>,

    /// Log filter, overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(config: &StrandConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(process) = args.process {
        config.process.id = process;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.logging.json |= args.json_logs;
    config.validate()?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing(&config);
    info!("Starting Strand location service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let network = LocalNetwork::new();
    let (fiber, inbound) =
        Fiber::on_local_network(config.clone(), &network).context("failed to start fiber")?;
    let receiver = fiber.spawn_receiver(inbound);
    let maintenance = fiber.spawn_maintenance();

    let directory = LocationComponent::from_config(fiber.locks().clone(), &config);
    let address = LocationService::install(&fiber, directory.clone())
        .context("failed to install location service")?;
    info!(%address, process = fiber.process(), "Location service ready");

    let shutdown = fiber.shutdown_token();
    let stats_directory = directory.clone();
    let stats_fiber = fiber.clone();
    let stats_interval = config.location.stats_interval();
    let stats = tokio::spawn(async move {
        let mut interval = tokio::time::interval(stats_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let directory = stats_directory.stats();
                    let rpc = stats_fiber.rpc().metrics().get_stats();
                    let dispatch = stats_fiber.dispatcher().metrics().get_stats();
                    info!(
                        entries = directory.entries,
                        locked = directory.locked,
                        lease_expirations = directory.lease_expirations,
                        pending_rpcs = stats_fiber.rpc().pending_count(),
                        rpc = ?rpc,
                        dispatch = ?dispatch,
                        held_locks = stats_fiber.locks().lock_count(),
                        "Location service stats"
                    );
                }
            }
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    fiber.shutdown();
    network.detach(fiber.process());
    receiver.abort();
    for task in maintenance {
        let _ = task.await;
    }
    let _ = stats.await;
    info!("Location service stopped");
    Ok(())
}

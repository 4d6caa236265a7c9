//! gum-bridge - development bridge server and watch client.

use anyhow::Result;
use clap::{Parser, Subcommand};
use gum_bridge::{AppConfig, BridgeServer, WatchOptions};
use gum_core::Endpoint;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Development bridge for gum-boards dashboards
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via GUM_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge server
    Serve,
    /// Open headless design and preview tabs and log their traffic
    Watch {
        /// ExEn endpoint as JSON, e.g. '{"host":"localhost","port":8080,"ssl":false}'
        #[arg(long)]
        exen: String,
        /// Device pattern to subscribe to
        #[arg(long, default_value = "*")]
        devices: String,
        /// Number of preview tabs following the design tab
        #[arg(long, default_value_t = 1)]
        previews: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    gum_telemetry::init_logging()?;

    info!("Starting gum-bridge v{}", env!("CARGO_PKG_VERSION"));

    // Config path: CLI arg > GUM_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("GUM_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = AppConfig::load(&config_path)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(%e, "Failed to listen for Ctrl-C");
        }
        on_signal.cancel();
    });

    match args.command {
        Command::Serve => {
            let server = BridgeServer::bind(&config.server).await?;
            server.run(shutdown).await?;
        }
        Command::Watch {
            exen,
            devices,
            previews,
        } => {
            let options = WatchOptions {
                exen: Endpoint::parse_str(&exen)?,
                devices,
                previews,
            };
            gum_bridge::run_watch(&config, options, shutdown).await?;
        }
    }

    Ok(())
}

//! # modgate host binary
//!
//! Loads the YAML configuration, brings up the channel supervisor with a
//! Redis bus writer and runs until interrupted. Logging goes to the console
//! through `tracing`; the level comes from `RUST_LOG` or `--log-level`.
//!
//! ```bash
//! # Start with the default configuration path
//! modgate
//!
//! # Custom configuration and verbose protocol logging
//! modgate --config /etc/modgate.yaml --log-level debug
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use modgate::config::GatewayConfig;
use modgate::events::TracingSink;
use modgate::publish::redis::{RedisBus, RedisBusConfig};
use modgate::{ChannelSupervisor, Result};

/// Command line arguments
#[derive(Parser)]
#[command(
    name = "modgate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus communication gateway",
    long_about = "Polls Modbus TCP/RTU field devices and publishes decoded \
                  values to a Redis bus; channels can also serve a register \
                  image in the slave role."
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/modgate.yaml")]
    config: String,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let config = GatewayConfig::load(&args.config)?;
    info!(
        path = %args.config,
        channels = config.channels.len(),
        "configuration loaded"
    );

    let bus = Arc::new(RedisBus::new(&config.redis_url, RedisBusConfig::default())?);
    let supervisor = Arc::new(ChannelSupervisor::new(bus, Arc::new(TracingSink)));

    for channel in config.channels {
        let index = channel.index;
        let name = channel.name.clone();
        if let Err(e) = supervisor.create(channel) {
            error!(channel = index, %name, error = %e, "channel rejected");
            continue;
        }
        if let Err(e) = supervisor.start(index).await {
            error!(channel = index, %name, error = %e, "channel failed to start");
        }
    }

    info!("gateway running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(modgate::GatewayError::from)?;

    info!("shutting down");
    supervisor.stop_all().await;
    info!("all channels stopped");
    Ok(())
}

/// Console logging via tracing; `RUST_LOG` wins over the CLI flag
fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

//! Modbus-TCP proxy (mbproxy)
//!
//! Lets many Modbus-TCP clients share one server that only accepts a single
//! connection.

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use mbproxy::{
    bootstrap::{self, Args},
    start_proxy, ProxyConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        ProxyConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply_to(&mut config);
    config.validate().context("Invalid configuration")?;

    // Validation mode: print the effective configuration and exit
    if args.validate {
        let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
        println!("{}", yaml);
        return Ok(());
    }

    bootstrap::initialize_logging(&args, &config)?;
    info!(
        "Starting mbproxy v{}: {} -> {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_address(),
        config.upstream.address
    );

    let mut runtime = start_proxy(&config)
        .await
        .context("Failed to start proxy")?;

    let result = tokio::select! {
        result = runtime.wait() => result,
        signal = common::wait_for_shutdown() => {
            info!("{} received, shutting down", signal);
            Ok(())
        }
    };

    runtime.shutdown().await;

    if let Err(e) = result {
        error!("Proxy stopped: {}", e);
        return Err(e).context("Proxy terminated");
    }
    Ok(())
}

//! Weather relay service.
//!
//! Configured entirely through environment variables (see `RelayConfig`).

use weather_relay::{run_relay, shutdown::setup_shutdown, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match RelayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let (_shutdown_tx, shutdown_rx) = setup_shutdown()?;

    if let Err(e) = run_relay(config, shutdown_rx).await {
        log::error!("Weather relay failed: {}", e);
        std::process::exit(1);
    }

    log::info!("Weather relay shut down, exiting");
    Ok(())
}

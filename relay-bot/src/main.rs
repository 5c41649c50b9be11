//! Relay Bot - Main entry point.

use anyhow::Result;
use relay_bot::start_bot;
use relay_common::config::Config;
use relay_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Relay Bot v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = start_bot(&config).await {
        tracing::error!(error = %e, "Relay bot stopped");
        return Err(e);
    }
    Ok(())
}

//! Colloquy Gateway - Main entry point.

use anyhow::Result;
use colloquy_common::config::Config;
use colloquy_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration, environment variables win over the file
    let config = Config::load_with_env()?;
    config.validate()?;

    init_logging(&config.observability.log_level, &config.observability.log_format);

    tracing::info!("Colloquy Gateway v{}", env!("CARGO_PKG_VERSION"));

    colloquy_gateway::start_server(&config).await
}

use std::sync::Arc;

use anyhow::Context;
use token_pulse::config::AppConfig;
use token_pulse::logging::init_logging;
use token_pulse::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let (config, config_path) = AppConfig::from_env().context("Failed to load configuration")?;

    let logging = Arc::new(init_logging(&config.logging).context("Failed to initialize logging")?);

    tracing::info!(
        config = ?config_path,
        hot_tokens = config.tokens.hot.len(),
        cold_tokens = config.tokens.cold.len(),
        "Starting token-pulse v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut container = ServiceContainer::new(config)
        .context("Failed to build services")?
        .with_logging(logging);
    if let Some(path) = config_path {
        container = container.with_config_path(path);
    }

    let container = Arc::new(container);
    container.run_until_shutdown().await?;

    tracing::info!("token-pulse stopped");
    Ok(())
}

//! Lynx Screener - A-share market data and batch screening service.

use anyhow::Result;
use lynx_common::config::Config;
use lynx_common::logging::init_logging;
use lynx_screener::ScreenerService;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_with_env()?;
    config.validate()?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Lynx Screener v{}", env!("CARGO_PKG_VERSION"));

    let service = ScreenerService::new(config);

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    service.start().await
}

#![deny(unused)]
//! MarketOps - multi-tenant marketing operations core.
//!
//! Loads configuration, installs logging and metrics, builds the long-lived
//! services once and serves the HTTP gateway.

use marketops_core::config::AppConfig;
use marketops_gateway::{AppState, GatewayConfig, GatewayServer};
use marketops_governance::{configure_tracing, setup_metrics_recorder, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    configure_tracing(&config.observability)?;
    tracing::info!("Starting MarketOps v{}", env!("CARGO_PKG_VERSION"));

    let metrics_handle = setup_metrics_recorder()?;

    let state = AppState::from_config(&config)?;
    if config.guardrail.low_cost_mode {
        tracing::info!(
            rpm = config.guardrail.rate_limit_rpm,
            monthly_cap_usd = config.guardrail.monthly_cap_usd,
            "Cost guardrail active"
        );
    }

    let gateway_config = GatewayConfig::from(&config.server);
    tracing::info!(
        host = %gateway_config.host,
        port = gateway_config.port,
        store = if config.store.sqlite_path.is_some() { "sqlite" } else { "memory" },
        "Gateway configured"
    );

    GatewayServer::new(gateway_config, state)
        .with_metrics(metrics_handle)
        .run()
        .await?;

    shutdown_tracing();
    Ok(())
}

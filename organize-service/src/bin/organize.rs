//! Organize service binary.
//!
//! Consumes node creation messages and publishes audit events until
//! interrupted.

use anyhow::Context;
use organize_service::{Dependencies, Organize, OrganizeConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "organize=info,organize_service=info,organize_events=info,organize_core=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = OrganizeConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(backend = ?config.backend, queue = %config.queue, "Starting organize service");

    let deps = Dependencies::from_config(&config)
        .await
        .context("Failed to connect backends")?;
    let mut app = Organize::build(&config, deps).context("Failed to assemble service")?;
    app.spawn_consumers();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    app.shutdown().await;
    Ok(())
}

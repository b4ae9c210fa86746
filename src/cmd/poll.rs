//! Headless polling — `agentboard poll`.

use anyhow::{Context, Result};

use agentboard::board::poller::{Poller, PollerHandle};
use agentboard::config::AppConfig;

use super::build_services;

pub async fn cmd_poll(config: AppConfig, once: bool) -> Result<()> {
    let services = build_services(&config, true).await?;
    let handle = PollerHandle::new(Poller::new(services.engine, config.poll_interval()));

    if once {
        let report = handle.run_once().await;
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize poll report")?
        );
        if let Some(err) = &report.last_error {
            tracing::warn!(failed = report.failed, last_error = %err, "Poll cycle had failures");
        }
        return Ok(());
    }

    handle.start().await;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Stopping poller...");
    handle.stop().await;
    Ok(())
}

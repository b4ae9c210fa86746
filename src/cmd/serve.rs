//! HTTP server plus background poller — `agentboard serve`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use agentboard::board::api::AppState;
use agentboard::board::auth::ExpiringStore;
use agentboard::board::github::DeviceFlow;
use agentboard::board::poller::{Poller, PollerHandle};
use agentboard::board::server::{ServerConfig, start_server};
use agentboard::config::AppConfig;

use super::build_services;

const DEVICE_CODE_CAPACITY: usize = 32;
/// GitHub device codes are valid for 15 minutes.
const DEVICE_CODE_TTL: Duration = Duration::from_secs(15 * 60);

pub async fn cmd_serve(config: AppConfig) -> Result<()> {
    let services = build_services(&config, false).await?;
    let poller = PollerHandle::new(Poller::new(services.engine.clone(), config.poll_interval()));

    let device_flow = config
        .github
        .client_id
        .as_deref()
        .map(|client_id| DeviceFlow::new(&config.github.login_base, client_id));
    if config.github.webhook_secret.is_none() {
        tracing::info!("No webhook secret configured; webhook endpoint will reject deliveries");
    }

    let state = Arc::new(AppState {
        engine: services.engine,
        poller: Arc::new(poller),
        db: services.db,
        ws_tx: services.events,
        webhook_secret: config.github.webhook_secret.clone(),
        device_flow,
        device_codes: Mutex::new(ExpiringStore::new(DEVICE_CODE_CAPACITY, DEVICE_CODE_TTL)),
    });

    let server = ServerConfig {
        host: config.server.host.clone(),
        port: config.server.port,
        permissive_cors: config.server.permissive_cors,
    };
    tracing::info!(
        projects = ?config.workflow.enabled_projects,
        interval_secs = config.poller.interval_secs,
        "Starting agentboard"
    );
    start_server(server, state, CancellationToken::new()).await
}

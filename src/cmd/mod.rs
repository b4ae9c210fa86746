//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `poll`   | `Poll`           |
//! | `init`   | `Init`           |
//! | `config` | `Config`         |

pub mod config;
pub mod init;
pub mod poll;
pub mod serve;

pub use config::cmd_config;
pub use init::cmd_init;
pub use poll::cmd_poll;
pub use serve::cmd_serve;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::sync::broadcast;

use agentboard::board::api::GITHUB_TOKEN_SETTING;
use agentboard::board::config_store::WorkflowConfigStore;
use agentboard::board::db::{BoardDb, DbHandle};
use agentboard::board::engine::TransitionEngine;
use agentboard::board::github::{GitHubClient, HttpGitHubClient};
use agentboard::board::tracker::PipelineTracker;
use agentboard::config::AppConfig;

const EVENT_BUFFER: usize = 256;

/// Command-line values that take precedence over file and environment.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub projects: Vec<String>,
    pub poll_interval_secs: Option<u64>,
    pub permissive_cors: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if !self.projects.is_empty() {
            config.workflow.enabled_projects = self.projects.clone();
        }
        if let Some(secs) = self.poll_interval_secs {
            config.poller.interval_secs = secs.max(1);
        }
        if self.permissive_cors {
            config.server.permissive_cors = true;
        }
    }
}

/// Everything the poller and the HTTP surface share.
pub struct Services {
    pub db: DbHandle,
    pub engine: Arc<TransitionEngine>,
    pub events: broadcast::Sender<String>,
}

/// Open the database, build the GitHub client and restore tracked runs.
///
/// The token comes from configuration, falling back to one stored by the
/// device flow. With `require_token` unset a missing token only warns, so
/// the server can still be used to complete the device flow.
pub async fn build_services(config: &AppConfig, require_token: bool) -> Result<Services> {
    let db = BoardDb::new(&config.storage.db_path).with_context(|| {
        format!("Failed to open database at {}", config.storage.db_path.display())
    })?;
    let db = DbHandle::new(db);

    let mut config = config.clone();
    if config.github.token.is_none() {
        config.github.token = db.call(|db| db.get_setting(GITHUB_TOKEN_SETTING)).await?;
    }
    let client_config = match config.github_client_config() {
        Some(client_config) => client_config,
        None if require_token => bail!(
            "No GitHub token configured. Set GITHUB_TOKEN, add [github] token to \
             agentboard.toml, or complete the device flow via `agentboard serve`"
        ),
        None => {
            tracing::warn!("No GitHub token configured; GitHub calls will fail until one is set");
            config.github.token = Some(String::new());
            config
                .github_client_config()
                .context("Failed to build GitHub client settings")?
        }
    };
    let github: Arc<dyn GitHubClient> = Arc::new(HttpGitHubClient::new(client_config)?);

    let configs = Arc::new(WorkflowConfigStore::new(
        config.workflow_defaults(),
        db.clone(),
        github.clone(),
    ));
    let tracker = Arc::new(PipelineTracker::with_db(db.clone()));
    let restored = tracker
        .load()
        .await
        .context("Failed to restore pipeline state")?;
    if restored > 0 {
        tracing::info!(restored, "Restored in-flight pipelines");
    }
    if config.workflow.enabled_projects.is_empty() {
        tracing::warn!("No projects enabled; set workflow.enabled_projects or pass --project");
    }

    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let engine = Arc::new(TransitionEngine::new(
        github,
        configs,
        tracker,
        db.clone(),
        events.clone(),
    ));
    Ok(Services { db, engine, events })
}

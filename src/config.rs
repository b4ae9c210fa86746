//! Application configuration.
//!
//! Values are layered, later layers winning:
//! 1. built-in defaults,
//! 2. `.agentboard/agentboard.toml`,
//! 3. environment (`.env` is loaded first via `dotenvy`),
//! 4. command-line flags, applied by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::board::config_store::WorkflowDefaults;
use crate::board::github::{
    DEFAULT_API_BASE, DEFAULT_GRAPHQL_URL, DEFAULT_LOGIN_BASE, GitHubClientConfig,
};
use crate::board::models::{
    AgentMappings, DEFAULT_COPILOT_ASSIGNEE, RepositoryRef, StatusColumn, validate_mappings,
};
use crate::board::retry::RetryConfig;

pub const CONFIG_DIR: &str = ".agentboard";
pub const CONFIG_FILE: &str = "agentboard.toml";

/// Directory holding configuration and the database for a working directory.
pub fn config_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubSection {
    pub token: Option<String>,
    pub api_base: String,
    pub graphql_url: String,
    pub login_base: String,
    /// OAuth App client ID for the device flow.
    pub client_id: Option<String>,
    pub request_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub webhook_secret: Option<String>,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            token: None,
            api_base: DEFAULT_API_BASE.to_string(),
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            login_base: DEFAULT_LOGIN_BASE.to_string(),
            client_id: None,
            request_timeout_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    /// `owner/name`, used when a project's items do not reveal a repository.
    pub default_repository: Option<String>,
    pub copilot_assignee: String,
    pub review_assignee: Option<String>,
    pub enabled_projects: Vec<String>,
    /// Replaces the built-in column→agents table for every project.
    pub agent_mappings: Option<AgentMappings>,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            default_repository: None,
            copilot_assignee: DEFAULT_COPILOT_ASSIGNEE.to_string(),
            review_assignee: None,
            enabled_projects: Vec::new(),
            agent_mappings: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSection {
    pub interval_secs: u64,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self { interval_secs: 15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub permissive_cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            permissive_cors: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(CONFIG_DIR).join("agentboard.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agentboard.toml")
    }

    /// Load `.agentboard/agentboard.toml` under `project_dir`, or defaults if
    /// the file does not exist.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = config_dir(project_dir).join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// File (explicit path or the default location), then `.env` and the
    /// process environment. Relative database paths are anchored at
    /// `project_dir`.
    pub fn resolve(project_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        if let Err(e) = dotenvy::from_path(project_dir.join(".env"))
            && !e.not_found()
        {
            tracing::warn!(error = %e, "Failed to load .env");
        }

        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(project_dir)?,
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        if config.storage.db_path.is_relative() {
            config.storage.db_path = project_dir.join(&config.storage.db_path);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize agentboard.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay environment variables. `lookup` is injected so tests do not
    /// touch the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("AGENTBOARD_GITHUB_TOKEN").or_else(|| get("GITHUB_TOKEN")) {
            self.github.token = Some(token);
        }
        if let Some(v) = get("AGENTBOARD_GITHUB_API_BASE") {
            self.github.api_base = v;
        }
        if let Some(v) = get("AGENTBOARD_GITHUB_GRAPHQL_URL") {
            self.github.graphql_url = v;
        }
        if let Some(v) = get("AGENTBOARD_GITHUB_CLIENT_ID") {
            self.github.client_id = Some(v);
        }
        if let Some(v) = get("AGENTBOARD_WEBHOOK_SECRET") {
            self.github.webhook_secret = Some(v);
        }
        if let Some(v) = get("AGENTBOARD_REQUEST_TIMEOUT_SECS") {
            self.github.request_timeout_secs = parse_env("AGENTBOARD_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("AGENTBOARD_RETRY_ATTEMPTS") {
            self.github.retry_attempts = parse_env("AGENTBOARD_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("AGENTBOARD_RETRY_BASE_DELAY_MS") {
            self.github.retry_base_delay_ms = parse_env("AGENTBOARD_RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = get("AGENTBOARD_DEFAULT_REPOSITORY") {
            self.workflow.default_repository = Some(v);
        }
        if let Some(v) = get("AGENTBOARD_COPILOT_ASSIGNEE") {
            self.workflow.copilot_assignee = v;
        }
        if let Some(v) = get("AGENTBOARD_REVIEW_ASSIGNEE") {
            self.workflow.review_assignee = Some(v);
        }
        if let Some(v) = get("AGENTBOARD_PROJECTS") {
            self.workflow.enabled_projects = split_list(&v);
        }
        if let Some(v) = get("AGENTBOARD_POLL_INTERVAL_SECS") {
            self.poller.interval_secs = parse_env("AGENTBOARD_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("AGENTBOARD_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("AGENTBOARD_PORT") {
            self.server.port = parse_env("AGENTBOARD_PORT", &v)?;
        }
        if let Some(v) = get("AGENTBOARD_DB_PATH") {
            self.storage.db_path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.poller.interval_secs == 0 {
            bail!("poller.interval_secs must be at least 1");
        }
        if self.github.retry_attempts == 0 {
            bail!("github.retry_attempts must be at least 1");
        }
        if let Some(repo) = &self.workflow.default_repository
            && RepositoryRef::parse(repo).is_none()
        {
            bail!("workflow.default_repository must look like owner/name, got '{}'", repo);
        }
        if self.workflow.copilot_assignee.trim().is_empty() {
            bail!("workflow.copilot_assignee must not be empty");
        }
        if let Some(mappings) = &self.workflow.agent_mappings
            && let Err(message) = validate_mappings(mappings, StatusColumn::from_default_name)
        {
            bail!("workflow.agent_mappings: {}", message);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poller.interval_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.github.retry_attempts,
            initial_delay: Duration::from_millis(self.github.retry_base_delay_ms),
            ..RetryConfig::default()
        }
    }

    /// Client settings, or `None` when no token is configured.
    pub fn github_client_config(&self) -> Option<GitHubClientConfig> {
        let token = self.github.token.as_deref()?;
        Some(GitHubClientConfig {
            token: token.to_string(),
            api_base: self.github.api_base.clone(),
            graphql_url: self.github.graphql_url.clone(),
            request_timeout: Duration::from_secs(self.github.request_timeout_secs),
            retry: self.retry_config(),
        })
    }

    pub fn workflow_defaults(&self) -> WorkflowDefaults {
        WorkflowDefaults {
            default_repository: self
                .workflow
                .default_repository
                .as_deref()
                .and_then(RepositoryRef::parse),
            copilot_assignee: self.workflow.copilot_assignee.clone(),
            review_assignee: self.workflow.review_assignee.clone(),
            agent_mappings: self.workflow.agent_mappings.clone(),
            enabled_projects: self.workflow.enabled_projects.clone(),
        }
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.github.token = copy.github.token.as_ref().map(|_| "********".to_string());
        copy.github.webhook_secret = copy
            .github
            .webhook_secret
            .as_ref()
            .map(|_| "********".to_string());
        copy
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {}: '{}'", key, value))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.github.api_base, "https://api.github.com");
        assert_eq!(config.workflow.copilot_assignee, "copilot-swe-agent");
        assert_eq!(config.poller.interval_secs, 15);
        assert_eq!(config.server.port, 3141);
        assert!(config.github_client_config().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = AppConfig::parse(
            r#"
[workflow]
default_repository = "acme/widgets"
enabled_projects = ["PVT_1", "PVT_2"]

[workflow.agent_mappings]
Ready = [{ slug = "speckit.plan" }]

[poller]
interval_secs = 60
"#,
        )
        .unwrap();
        assert_eq!(config.workflow.enabled_projects, vec!["PVT_1", "PVT_2"]);
        assert_eq!(config.poller.interval_secs, 60);
        assert_eq!(config.server.port, 3141);

        let defaults = config.workflow_defaults();
        assert_eq!(defaults.default_repository, Some(RepositoryRef::new("acme", "widgets")));
        let mappings = defaults.agent_mappings.unwrap();
        assert_eq!(mappings["Ready"][0].slug, "speckit.plan");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = AppConfig::parse("[server]\nport = 8080\n").unwrap();
        config
            .apply_env(env(&[
                ("GITHUB_TOKEN", "ghp_env"),
                ("AGENTBOARD_PORT", "9090"),
                ("AGENTBOARD_PROJECTS", "PVT_1, PVT_2,"),
                ("AGENTBOARD_RETRY_ATTEMPTS", "5"),
            ]))
            .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.workflow.enabled_projects, vec!["PVT_1", "PVT_2"]);

        let client = config.github_client_config().unwrap();
        assert_eq!(client.token, "ghp_env");
        assert_eq!(client.retry.max_attempts, 5);
    }

    #[test]
    fn test_prefixed_token_wins() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[
                ("GITHUB_TOKEN", "generic"),
                ("AGENTBOARD_GITHUB_TOKEN", "specific"),
            ]))
            .unwrap();
        assert_eq!(config.github.token.as_deref(), Some("specific"));
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(env(&[("AGENTBOARD_PORT", "not-a-port")]))
            .unwrap_err();
        assert!(err.to_string().contains("AGENTBOARD_PORT"));
    }

    #[test]
    fn test_validate_rejects_bad_repository() {
        let mut config = AppConfig::default();
        config.workflow.default_repository = Some("widgets".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mapping_for_unknown_column() {
        let config = AppConfig::parse(
            "[workflow.agent_mappings]\nQA = [{ slug = \"qa.agent\" }]\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("QA"));
    }

    #[test]
    fn test_save_and_load_roundtrip_via_project_dir() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(config_dir(dir.path())).unwrap();
        let mut config = AppConfig::default();
        config.workflow.review_assignee = Some("octo-reviewer".into());
        config
            .save(&config_dir(dir.path()).join(CONFIG_FILE))
            .unwrap();

        let loaded = AppConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.workflow.review_assignee.as_deref(), Some("octo-reviewer"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = AppConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = AppConfig::default();
        config.github.token = Some("ghp_secret".into());
        config.github.webhook_secret = Some("hunter2".into());
        let shown = toml::to_string(&config.redacted()).unwrap();
        assert!(!shown.contains("ghp_secret"));
        assert!(!shown.contains("hunter2"));
    }
}

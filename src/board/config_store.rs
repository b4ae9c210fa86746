//! Per-project workflow configuration: merge precedence, repository
//! resolution and an explicitly invalidated cache.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::db::DbHandle;
use super::github::GitHubClient;
use super::models::*;
use crate::errors::{GitHubErrorKind, WorkflowError};

/// Application-level defaults that sit under per-project overrides.
#[derive(Debug, Clone)]
pub struct WorkflowDefaults {
    pub default_repository: Option<RepositoryRef>,
    pub copilot_assignee: String,
    pub review_assignee: Option<String>,
    /// Global agent mappings; the built-in pipeline applies when unset.
    pub agent_mappings: Option<AgentMappings>,
    pub enabled_projects: Vec<String>,
}

impl Default for WorkflowDefaults {
    fn default() -> Self {
        Self {
            default_repository: None,
            copilot_assignee: DEFAULT_COPILOT_ASSIGNEE.to_string(),
            review_assignee: None,
            agent_mappings: None,
            enabled_projects: Vec::new(),
        }
    }
}

pub struct WorkflowConfigStore {
    defaults: WorkflowDefaults,
    db: DbHandle,
    github: Arc<dyn GitHubClient>,
    cache: RwLock<HashMap<String, Arc<WorkflowConfiguration>>>,
}

impl WorkflowConfigStore {
    pub fn new(defaults: WorkflowDefaults, db: DbHandle, github: Arc<dyn GitHubClient>) -> Self {
        Self {
            defaults,
            db,
            github,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled_projects(&self) -> &[String] {
        &self.defaults.enabled_projects
    }

    /// Effective configuration for a project. Cached until [`invalidate`](Self::invalidate).
    pub async fn get_effective_config(
        &self,
        project_id: &str,
    ) -> Result<Arc<WorkflowConfiguration>, WorkflowError> {
        if let Some(config) = self.cache.read().await.get(project_id) {
            return Ok(config.clone());
        }

        let pid = project_id.to_string();
        let (stored, override_mappings) = self
            .db
            .call(move |db| Ok((db.get_workflow_config(&pid)?, db.get_project_mappings(&pid)?)))
            .await
            .map_err(WorkflowError::Storage)?;

        let repository = self.resolve_repository(project_id, stored.as_ref()).await?;

        let mut config = WorkflowConfiguration::new(project_id, &repository);
        config.copilot_assignee = self.defaults.copilot_assignee.clone();
        config.review_assignee = self.defaults.review_assignee.clone();
        if let Some(stored) = &stored {
            config.enabled = stored.enabled;
        }
        config.agent_mappings = override_mappings
            .or_else(|| self.defaults.agent_mappings.clone())
            .unwrap_or_else(builtin_agent_mappings);

        let to_store = config.clone();
        self.db
            .call(move |db| db.upsert_workflow_config(&to_store))
            .await
            .map_err(WorkflowError::Storage)?;

        tracing::debug!(
            project_id,
            repository = %repository,
            statuses = config.agent_mappings.len(),
            "Resolved workflow configuration"
        );

        let config = Arc::new(config);
        self.cache
            .write()
            .await
            .insert(project_id.to_string(), config.clone());
        Ok(config)
    }

    pub async fn invalidate(&self, project_id: &str) {
        self.cache.write().await.remove(project_id);
    }

    /// Persist a project's agent-mapping override and drop its cached config.
    pub async fn set_project_mappings(
        &self,
        project_id: &str,
        mappings: AgentMappings,
    ) -> Result<(), WorkflowError> {
        let cached = self.cache.read().await.get(project_id).cloned();
        let checked = match &cached {
            Some(config) => validate_mappings(&mappings, |s| config.column_for(s)),
            None => validate_mappings(&mappings, StatusColumn::from_default_name),
        };
        checked.map_err(|message| WorkflowError::configuration(project_id, message))?;

        let pid = project_id.to_string();
        self.db
            .call(move |db| db.set_project_mappings(&pid, &mappings))
            .await
            .map_err(WorkflowError::Storage)?;
        self.invalidate(project_id).await;
        tracing::info!(project_id, "Agent mappings updated");
        Ok(())
    }

    /// Project items first, then the stored configuration, then the default
    /// repository. Never guesses beyond that: if the items cannot be read the
    /// error is returned and nothing is cached. A missing project falls
    /// through like a project without linked issues.
    async fn resolve_repository(
        &self,
        project_id: &str,
        stored: Option<&WorkflowConfiguration>,
    ) -> Result<RepositoryRef, WorkflowError> {
        match self.github.list_project_items(project_id).await {
            Ok(items) => {
                if let Some(repo) = items.into_iter().find_map(|i| i.repository) {
                    return Ok(repo);
                }
            }
            Err(e) if e.kind() == GitHubErrorKind::NotFound => {
                tracing::warn!(project_id, error = %e, "Project items not found, using configured repository");
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(stored) = stored
            && !stored.repository_owner.is_empty()
            && !stored.repository_name.is_empty()
        {
            return Ok(stored.repository());
        }

        self.defaults.default_repository.clone().ok_or_else(|| {
            WorkflowError::configuration(project_id, "no repository could be resolved for project")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::db::BoardDb;
    use crate::board::testing::FakeGitHubClient;
    use crate::errors::GitHubError;

    fn store_with(
        github: Arc<FakeGitHubClient>,
        defaults: WorkflowDefaults,
    ) -> (WorkflowConfigStore, DbHandle) {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        (WorkflowConfigStore::new(defaults, db.clone(), github), db)
    }

    #[tokio::test]
    async fn test_repository_from_project_items_wins() {
        let github = Arc::new(FakeGitHubClient::new());
        github.add_item(1, None, None);
        github.add_item(2, Some("Ready"), Some(RepositoryRef::new("acme", "widgets")));
        let defaults = WorkflowDefaults {
            default_repository: Some(RepositoryRef::new("fallback", "repo")),
            ..Default::default()
        };
        let (store, db) = store_with(github, defaults);

        let config = store.get_effective_config("PVT_1").await.unwrap();
        assert_eq!(config.repository(), RepositoryRef::new("acme", "widgets"));

        let stored = db.call(|db| db.get_workflow_config("PVT_1")).await.unwrap();
        assert_eq!(stored.unwrap().repository_name, "widgets");
    }

    #[tokio::test]
    async fn test_repository_from_stored_config_then_default() {
        let github = Arc::new(FakeGitHubClient::new());
        let defaults = WorkflowDefaults {
            default_repository: Some(RepositoryRef::new("fallback", "repo")),
            ..Default::default()
        };
        let (store, db) = store_with(github.clone(), defaults);

        let stored = WorkflowConfiguration::new("PVT_1", &RepositoryRef::new("stored", "repo"));
        db.call(move |db| db.upsert_workflow_config(&stored)).await.unwrap();
        let config = store.get_effective_config("PVT_1").await.unwrap();
        assert_eq!(config.repository_owner, "stored");

        let config = store.get_effective_config("PVT_2").await.unwrap();
        assert_eq!(config.repository_owner, "fallback");
    }

    #[tokio::test]
    async fn test_unresolvable_repository_is_configuration_error() {
        let github = Arc::new(FakeGitHubClient::new());
        github.fail_next("list_project_items", GitHubError::not_found("list project items", "PVT_1"));
        let (store, _db) = store_with(github, WorkflowDefaults::default());

        let err = store.get_effective_config("PVT_1").await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_transient_item_failure_is_not_cached_as_fallback() {
        let github = Arc::new(FakeGitHubClient::new());
        github.add_item(2, Some("Ready"), Some(RepositoryRef::new("acme", "widgets")));
        github.fail_next("list_project_items", GitHubError::transient("list project items", "502"));
        let defaults = WorkflowDefaults {
            default_repository: Some(RepositoryRef::new("fallback", "repo")),
            ..Default::default()
        };
        let (store, db) = store_with(github, defaults);

        let err = store.get_effective_config("PVT_1").await.unwrap_err();
        assert!(matches!(err, WorkflowError::GitHub(ref e) if e.is_transient()));
        let stored = db.call(|db| db.get_workflow_config("PVT_1")).await.unwrap();
        assert!(stored.is_none());

        let config = store.get_effective_config("PVT_1").await.unwrap();
        assert_eq!(config.repository(), RepositoryRef::new("acme", "widgets"));
    }

    #[tokio::test]
    async fn test_rejects_mappings_for_unknown_columns() {
        let github = Arc::new(FakeGitHubClient::new());
        let defaults = WorkflowDefaults {
            default_repository: Some(RepositoryRef::new("acme", "widgets")),
            ..Default::default()
        };
        let (store, db) = store_with(github, defaults);
        let mut mappings = AgentMappings::new();
        mappings.insert("QA".into(), vec![AgentAssignment::new("qa.agent")]);

        let err = store.set_project_mappings("PVT_1", mappings).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("QA"));
        let saved = db.call(|db| db.get_project_mappings("PVT_1")).await.unwrap();
        assert!(saved.is_none());

        let mut mappings = AgentMappings::new();
        mappings.insert("in review".into(), vec![AgentAssignment::new("copilot-review")]);
        store.set_project_mappings("PVT_1", mappings).await.unwrap();
    }

    #[tokio::test]
    async fn test_mapping_precedence() {
        let github = Arc::new(FakeGitHubClient::new());
        let mut global = AgentMappings::new();
        global.insert("Ready".into(), vec![AgentAssignment::new("global.agent")]);
        let defaults = WorkflowDefaults {
            default_repository: Some(RepositoryRef::new("acme", "widgets")),
            agent_mappings: Some(global),
            ..Default::default()
        };
        let (store, _db) = store_with(github.clone(), defaults);

        let config = store.get_effective_config("PVT_1").await.unwrap();
        assert_eq!(config.agents_for("Ready")[0].slug, "global.agent");
        assert!(config.agents_for("Backlog").is_empty());

        let mut project = AgentMappings::new();
        project.insert("Ready".into(), vec![AgentAssignment::new("project.agent")]);
        store.set_project_mappings("PVT_1", project).await.unwrap();
        let config = store.get_effective_config("PVT_1").await.unwrap();
        assert_eq!(config.agents_for("Ready")[0].slug, "project.agent");

        let (store, _db) = store_with(
            github,
            WorkflowDefaults {
                default_repository: Some(RepositoryRef::new("acme", "widgets")),
                ..Default::default()
            },
        );
        let config = store.get_effective_config("PVT_1").await.unwrap();
        assert_eq!(config.agents_for("Backlog")[0].slug, "speckit.specify");
    }

    #[tokio::test]
    async fn test_cache_is_only_invalidated_explicitly() {
        let github = Arc::new(FakeGitHubClient::new());
        let defaults = WorkflowDefaults {
            default_repository: Some(RepositoryRef::new("acme", "widgets")),
            ..Default::default()
        };
        let (store, db) = store_with(github.clone(), defaults);

        let first = store.get_effective_config("PVT_1").await.unwrap();
        let mut mappings = AgentMappings::new();
        mappings.insert("Ready".into(), vec![AgentAssignment::new("direct.write")]);
        db.call(move |db| db.set_project_mappings("PVT_1", &mappings))
            .await
            .unwrap();

        let cached = store.get_effective_config("PVT_1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &cached));
        let lookups = github
            .calls()
            .iter()
            .filter(|c| *c == "list_project_items")
            .count();
        assert_eq!(lookups, 1);

        store.invalidate("PVT_1").await;
        let fresh = store.get_effective_config("PVT_1").await.unwrap();
        assert_eq!(fresh.agents_for("Ready")[0].slug, "direct.write");
    }

    #[tokio::test]
    async fn test_rejects_empty_slug() {
        let github = Arc::new(FakeGitHubClient::new());
        let (store, _db) = store_with(github, WorkflowDefaults::default());
        let mut mappings = AgentMappings::new();
        mappings.insert("Ready".into(), vec![AgentAssignment::new("  ")]);
        let err = store.set_project_mappings("PVT_1", mappings).await.unwrap_err();
        assert!(err.is_configuration());
    }
}

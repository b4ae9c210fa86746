//! In-flight pipeline state, one entry per `(project, issue)`.
//!
//! Only the transition engine writes here. When a [`DbHandle`] is attached
//! every write goes to SQLite first, so a restart resumes where it left off.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::RwLock;

use super::db::DbHandle;
use super::models::{PipelineRunState, PrState, RunKey};

pub struct PipelineTracker {
    runs: RwLock<HashMap<RunKey, PipelineRunState>>,
    db: Option<DbHandle>,
}

impl PipelineTracker {
    pub fn new_in_memory() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    pub fn with_db(db: DbHandle) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            db: Some(db),
        }
    }

    /// Load persisted runs. Returns how many were restored.
    pub async fn load(&self) -> Result<usize> {
        let Some(db) = &self.db else { return Ok(0) };
        let persisted = db.call(|db| db.list_pipeline_runs()).await?;
        let mut runs = self.runs.write().await;
        runs.clear();
        for run in persisted {
            runs.insert(run.key(), run);
        }
        Ok(runs.len())
    }

    /// Track a new pipeline, replacing any state already held for the key.
    pub async fn start(&self, state: PipelineRunState) -> Result<()> {
        self.persist(&state).await?;
        self.runs.write().await.insert(state.key(), state);
        Ok(())
    }

    pub async fn get(&self, key: &RunKey) -> Option<PipelineRunState> {
        self.runs.read().await.get(key).cloned()
    }

    /// Hand the issue to the next agent in the same column. Returns the
    /// updated state, or `None` if the key is not tracked.
    pub async fn advance(
        &self,
        key: &RunKey,
        next_slug: &str,
        new_sha: Option<String>,
        pr_state: Option<PrState>,
    ) -> Result<Option<PipelineRunState>> {
        let Some(mut state) = self.get(key).await else {
            return Ok(None);
        };
        state.current_agent_slug = next_slug.to_string();
        state.status_index += 1;
        state.agent_assigned_sha = new_sha;
        state.assigned_pr_state = pr_state;
        state.agent_assigned_at = Utc::now();

        self.persist(&state).await?;
        self.runs.write().await.insert(key.clone(), state.clone());
        Ok(Some(state))
    }

    /// Record the main pull request once it shows up.
    pub async fn attach_pull_request(
        &self,
        key: &RunKey,
        pr_number: u64,
        branch: &str,
    ) -> Result<()> {
        let Some(mut state) = self.get(key).await else {
            return Ok(());
        };
        if state.main_pr_number == Some(pr_number) && state.main_branch.as_deref() == Some(branch) {
            return Ok(());
        }
        state.main_pr_number = Some(pr_number);
        state.main_branch = Some(branch.to_string());
        self.persist(&state).await?;
        self.runs.write().await.insert(key.clone(), state);
        Ok(())
    }

    /// Park a run after a failure that polling cannot fix.
    pub async fn block(&self, key: &RunKey, reason: &str) -> Result<bool> {
        let Some(mut state) = self.get(key).await else {
            return Ok(false);
        };
        state.blocked = Some(reason.to_string());
        self.persist(&state).await?;
        self.runs.write().await.insert(key.clone(), state);
        Ok(true)
    }

    /// Release a parked run. Returns `false` if it was not blocked.
    pub async fn unblock(&self, key: &RunKey) -> Result<bool> {
        let Some(mut state) = self.get(key).await.filter(PipelineRunState::is_blocked) else {
            return Ok(false);
        };
        state.blocked = None;
        self.persist(&state).await?;
        self.runs.write().await.insert(key.clone(), state);
        Ok(true)
    }

    pub async fn clear(&self, key: &RunKey) -> Result<bool> {
        if let Some(db) = &self.db {
            let (pid, issue) = (key.project_id.clone(), key.issue_number);
            db.call(move |db| db.delete_pipeline_run(&pid, issue)).await?;
        }
        Ok(self.runs.write().await.remove(key).is_some())
    }

    /// All tracked runs, ordered by project then issue number.
    pub async fn list(&self) -> Vec<PipelineRunState> {
        let mut runs: Vec<_> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| a.key().cmp(&b.key()));
        runs
    }

    pub async fn list_for_project(&self, project_id: &str) -> Vec<PipelineRunState> {
        let mut runs: Vec<_> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.issue_number);
        runs
    }

    async fn persist(&self, state: &PipelineRunState) -> Result<()> {
        if let Some(db) = &self.db {
            let state = state.clone();
            db.call(move |db| db.upsert_pipeline_run(&state)).await?;
        }
        Ok(())
    }
}

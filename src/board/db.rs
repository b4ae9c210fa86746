use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use super::models::*;

/// Async-safe handle to the board database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct BoardDb {
    conn: Connection,
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and create the schema.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS transitions (
                    transition_id TEXT PRIMARY KEY,
                    issue_id INTEGER NOT NULL,
                    project_id TEXT NOT NULL,
                    from_status TEXT,
                    to_status TEXT NOT NULL,
                    assigned_user TEXT,
                    triggered_by TEXT NOT NULL,
                    success INTEGER NOT NULL,
                    error_message TEXT,
                    timestamp TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    project_id TEXT NOT NULL,
                    issue_number INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    status_index INTEGER NOT NULL,
                    current_agent_slug TEXT NOT NULL,
                    agent_assigned_sha TEXT,
                    agent_assigned_at TEXT NOT NULL,
                    pipeline_started_at TEXT NOT NULL,
                    main_pr_number INTEGER,
                    main_branch TEXT,
                    assigned_pr_state TEXT,
                    project_item_id TEXT NOT NULL,
                    blocked TEXT,
                    PRIMARY KEY (project_id, issue_number)
                );

                CREATE TABLE IF NOT EXISTS workflow_configs (
                    project_id TEXT PRIMARY KEY,
                    config TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS project_settings (
                    project_id TEXT PRIMARY KEY,
                    agent_mappings TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_transitions_issue
                    ON transitions(project_id, issue_id, timestamp);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Transitions ───────────────────────────────────────────────────

    pub fn insert_transition(&self, t: &WorkflowTransition) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO transitions (transition_id, issue_id, project_id, from_status, to_status,
                     assigned_user, triggered_by, success, error_message, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    t.transition_id.to_string(),
                    t.issue_id as i64,
                    t.project_id,
                    t.from_status,
                    t.to_status,
                    t.assigned_user,
                    t.triggered_by.as_str(),
                    t.success,
                    t.error_message,
                    format_timestamp(&t.timestamp),
                ],
            )
            .context("Failed to insert transition")?;
        Ok(())
    }

    /// Audit trail for a project, oldest first, optionally for one issue.
    pub fn list_transitions(
        &self,
        project_id: &str,
        issue_number: Option<u64>,
        limit: usize,
    ) -> Result<Vec<WorkflowTransition>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT transition_id, issue_id, project_id, from_status, to_status, assigned_user,
                        triggered_by, success, error_message, timestamp
                 FROM transitions
                 WHERE project_id = ?1 AND (?2 IS NULL OR issue_id = ?2)
                 ORDER BY timestamp ASC, rowid ASC
                 LIMIT ?3",
            )
            .context("Failed to prepare list_transitions")?;
        let rows = stmt
            .query_map(
                params![project_id, issue_number.map(|n| n as i64), limit as i64],
                |row| {
                    Ok(TransitionRow {
                        transition_id: row.get(0)?,
                        issue_id: row.get(1)?,
                        project_id: row.get(2)?,
                        from_status: row.get(3)?,
                        to_status: row.get(4)?,
                        assigned_user: row.get(5)?,
                        triggered_by: row.get(6)?,
                        success: row.get(7)?,
                        error_message: row.get(8)?,
                        timestamp: row.get(9)?,
                    })
                },
            )
            .context("Failed to query transitions")?;
        let mut transitions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read transition row")?;
            transitions.push(r.into_transition()?);
        }
        Ok(transitions)
    }

    // ── Pipeline runs ─────────────────────────────────────────────────

    pub fn upsert_pipeline_run(&self, run: &PipelineRunState) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (project_id, issue_number, status, status_index,
                     current_agent_slug, agent_assigned_sha, agent_assigned_at, pipeline_started_at,
                     main_pr_number, main_branch, assigned_pr_state, project_item_id, blocked)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(project_id, issue_number) DO UPDATE SET
                     status = excluded.status,
                     status_index = excluded.status_index,
                     current_agent_slug = excluded.current_agent_slug,
                     agent_assigned_sha = excluded.agent_assigned_sha,
                     agent_assigned_at = excluded.agent_assigned_at,
                     pipeline_started_at = excluded.pipeline_started_at,
                     main_pr_number = excluded.main_pr_number,
                     main_branch = excluded.main_branch,
                     assigned_pr_state = excluded.assigned_pr_state,
                     project_item_id = excluded.project_item_id,
                     blocked = excluded.blocked",
                params![
                    run.project_id,
                    run.issue_number as i64,
                    run.status,
                    run.status_index as i64,
                    run.current_agent_slug,
                    run.agent_assigned_sha,
                    format_timestamp(&run.agent_assigned_at),
                    format_timestamp(&run.pipeline_started_at),
                    run.main_pr_number.map(|n| n as i64),
                    run.main_branch,
                    run.assigned_pr_state.map(|s| s.as_str()),
                    run.project_item_id,
                    run.blocked,
                ],
            )
            .context("Failed to upsert pipeline run")?;
        Ok(())
    }

    pub fn delete_pipeline_run(&self, project_id: &str, issue_number: u64) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM pipeline_runs WHERE project_id = ?1 AND issue_number = ?2",
                params![project_id, issue_number as i64],
            )
            .context("Failed to delete pipeline run")?;
        Ok(affected > 0)
    }

    pub fn list_pipeline_runs(&self) -> Result<Vec<PipelineRunState>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT project_id, issue_number, status, status_index, current_agent_slug,
                        agent_assigned_sha, agent_assigned_at, pipeline_started_at, main_pr_number,
                        main_branch, assigned_pr_state, project_item_id, blocked
                 FROM pipeline_runs ORDER BY project_id, issue_number",
            )
            .context("Failed to prepare list_pipeline_runs")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PipelineRunRow {
                    project_id: row.get(0)?,
                    issue_number: row.get(1)?,
                    status: row.get(2)?,
                    status_index: row.get(3)?,
                    current_agent_slug: row.get(4)?,
                    agent_assigned_sha: row.get(5)?,
                    agent_assigned_at: row.get(6)?,
                    pipeline_started_at: row.get(7)?,
                    main_pr_number: row.get(8)?,
                    main_branch: row.get(9)?,
                    assigned_pr_state: row.get(10)?,
                    project_item_id: row.get(11)?,
                    blocked: row.get(12)?,
                })
            })
            .context("Failed to query pipeline runs")?;
        let mut runs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read pipeline_run row")?;
            runs.push(r.into_run_state()?);
        }
        Ok(runs)
    }

    // ── Workflow configuration ────────────────────────────────────────

    pub fn get_workflow_config(&self, project_id: &str) -> Result<Option<WorkflowConfiguration>> {
        let Some(raw) = self.get_text(
            "SELECT config FROM workflow_configs WHERE project_id = ?1",
            project_id,
        )?
        else {
            return Ok(None);
        };
        let config = serde_json::from_str(&raw).context("Failed to parse stored workflow config")?;
        Ok(Some(config))
    }

    pub fn upsert_workflow_config(&self, config: &WorkflowConfiguration) -> Result<()> {
        let raw = serde_json::to_string(config).context("Failed to serialize workflow config")?;
        self.conn
            .execute(
                "INSERT INTO workflow_configs (project_id, config, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(project_id) DO UPDATE SET config = excluded.config, updated_at = datetime('now')",
                params![config.project_id, raw],
            )
            .context("Failed to upsert workflow config")?;
        Ok(())
    }

    // ── Project agent-mapping overrides ───────────────────────────────

    pub fn get_project_mappings(&self, project_id: &str) -> Result<Option<AgentMappings>> {
        let Some(raw) = self.get_text(
            "SELECT agent_mappings FROM project_settings WHERE project_id = ?1",
            project_id,
        )?
        else {
            return Ok(None);
        };
        let mappings = serde_json::from_str(&raw).context("Failed to parse agent mappings JSON")?;
        Ok(Some(mappings))
    }

    pub fn set_project_mappings(&self, project_id: &str, mappings: &AgentMappings) -> Result<()> {
        let raw = serde_json::to_string(mappings).context("Failed to serialize agent mappings")?;
        self.conn
            .execute(
                "INSERT INTO project_settings (project_id, agent_mappings, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(project_id) DO UPDATE SET agent_mappings = excluded.agent_mappings,
                     updated_at = datetime('now')",
                params![project_id, raw],
            )
            .context("Failed to upsert project agent mappings")?;
        Ok(())
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.get_text("SELECT value FROM settings WHERE key = ?1", key)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .context("Failed to upsert setting")?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("Failed to delete setting")?;
        Ok(())
    }

    fn get_text(&self, sql: &str, key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare lookup")?;
        let mut rows = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .context("Failed to run lookup")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read lookup row")?)),
            None => Ok(None),
        }
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", raw))
}

struct TransitionRow {
    transition_id: String,
    issue_id: i64,
    project_id: String,
    from_status: Option<String>,
    to_status: String,
    assigned_user: Option<String>,
    triggered_by: String,
    success: bool,
    error_message: Option<String>,
    timestamp: String,
}

impl TransitionRow {
    fn into_transition(self) -> Result<WorkflowTransition> {
        let triggered_by = TriggeredBy::from_str(&self.triggered_by)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse transition trigger")?;
        Ok(WorkflowTransition {
            transition_id: Uuid::parse_str(&self.transition_id)
                .context("Failed to parse transition id")?,
            issue_id: self.issue_id as u64,
            project_id: self.project_id,
            from_status: self.from_status,
            to_status: self.to_status,
            assigned_user: self.assigned_user,
            triggered_by,
            success: self.success,
            error_message: self.error_message,
            timestamp: parse_timestamp(&self.timestamp)?,
        })
    }
}

struct PipelineRunRow {
    project_id: String,
    issue_number: i64,
    status: String,
    status_index: i64,
    current_agent_slug: String,
    agent_assigned_sha: Option<String>,
    agent_assigned_at: String,
    pipeline_started_at: String,
    main_pr_number: Option<i64>,
    main_branch: Option<String>,
    assigned_pr_state: Option<String>,
    project_item_id: String,
    blocked: Option<String>,
}

impl PipelineRunRow {
    fn into_run_state(self) -> Result<PipelineRunState> {
        let assigned_pr_state = self
            .assigned_pr_state
            .as_deref()
            .map(PrState::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse assigned PR state")?;
        Ok(PipelineRunState {
            issue_number: self.issue_number as u64,
            project_id: self.project_id,
            status: self.status,
            status_index: self.status_index as usize,
            current_agent_slug: self.current_agent_slug,
            agent_assigned_sha: self.agent_assigned_sha,
            agent_assigned_at: parse_timestamp(&self.agent_assigned_at)?,
            pipeline_started_at: parse_timestamp(&self.pipeline_started_at)?,
            main_pr_number: self.main_pr_number.map(|n| n as u64),
            main_branch: self.main_branch,
            assigned_pr_state,
            project_item_id: self.project_item_id,
            blocked: self.blocked,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

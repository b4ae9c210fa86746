//! Transition engine: the only writer of pipeline state.
//!
//! Each call works on one issue end-to-end while holding that issue's lock,
//! so the poller, webhook nudges and operator requests never interleave on
//! the same `(project, issue)`. GitHub side effects happen first; tracker
//! state and the audit row are written only once the board reflects the new
//! status. If the agent assignment fails after a board move, the move is
//! rolled back.
//!
//! Failures that another poll cannot fix (permanent GitHub errors, missing
//! board options, unknown statuses) park the run. A parked run is skipped
//! until an operator moves the issue or the project's mappings change.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};

use super::config_store::WorkflowConfigStore;
use super::db::DbHandle;
use super::detector::{CompletionDetector, Detection, DetectionInput};
use super::github::{GitHubClient, IssueSnapshot, ProjectItem, PullRequestSnapshot};
use super::models::*;
use super::tracker::PipelineTracker;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::WorkflowError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Untracked,
    Waiting,
    AgentAdvanced { agent: String },
    StatusAdvanced { from: Option<String>, to: String },
    PipelineFinished { status: String },
    Blocked { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedProjectIssue {
    pub number: u64,
    pub html_url: String,
    pub item_id: String,
}

struct MoveRequest<'a> {
    key: &'a RunKey,
    item_id: &'a str,
    from: Option<&'a str>,
    to: &'a str,
    trigger: TriggeredBy,
    issue: &'a IssueSnapshot,
    pull_request: Option<&'a PullRequestSnapshot>,
    previous: Option<&'a PipelineRunState>,
}

pub struct TransitionEngine {
    github: Arc<dyn GitHubClient>,
    configs: Arc<WorkflowConfigStore>,
    tracker: Arc<PipelineTracker>,
    db: DbHandle,
    events: broadcast::Sender<String>,
    detector: CompletionDetector,
    locks: Mutex<HashMap<RunKey, Arc<Mutex<()>>>>,
}

impl TransitionEngine {
    pub fn new(
        github: Arc<dyn GitHubClient>,
        configs: Arc<WorkflowConfigStore>,
        tracker: Arc<PipelineTracker>,
        db: DbHandle,
        events: broadcast::Sender<String>,
    ) -> Self {
        Self {
            github,
            configs,
            tracker,
            db,
            events,
            detector: CompletionDetector::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn configs(&self) -> &Arc<WorkflowConfigStore> {
        &self.configs
    }

    pub fn tracker(&self) -> &Arc<PipelineTracker> {
        &self.tracker
    }

    /// Exclusive access to one issue's pipeline for the life of the guard.
    async fn lock_key(&self, key: &RunKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Check whether the tracked agent is done and advance if so.
    pub async fn process_issue(
        &self,
        key: &RunKey,
        trigger: TriggeredBy,
    ) -> Result<ProcessOutcome, WorkflowError> {
        let _guard = self.lock_key(key).await;
        let Some(run) = self.tracker.get(key).await else {
            return Ok(ProcessOutcome::Untracked);
        };
        if let Some(reason) = &run.blocked {
            return Ok(ProcessOutcome::Blocked {
                reason: reason.clone(),
            });
        }

        let result = self.check_run(key, run, trigger).await;
        if let Err(err) = &result
            && err.blocks_run()
        {
            self.park(key, err).await;
        }
        result
    }

    async fn check_run(
        &self,
        key: &RunKey,
        mut run: PipelineRunState,
        trigger: TriggeredBy,
    ) -> Result<ProcessOutcome, WorkflowError> {
        let config = self.configs.get_effective_config(&key.project_id).await?;
        let repo = config.repository();

        let issue = self.github.get_issue(&repo, key.issue_number).await?;
        let pull_request = self
            .github
            .get_pull_request_for_issue(&repo, key.issue_number)
            .await?;
        if let Some(pr) = &pull_request
            && run.main_pr_number.is_none()
        {
            self.tracker
                .attach_pull_request(key, pr.number, &pr.head_ref)
                .await
                .map_err(WorkflowError::Storage)?;
            run.main_pr_number = Some(pr.number);
            run.main_branch = Some(pr.head_ref.clone());
        }
        let agent_still_assigned = self
            .github
            .is_agent_assigned_to_issue(&repo, key.issue_number, &config.copilot_assignee)
            .await?;

        let detection = self.detector.evaluate(&DetectionInput {
            run: &run,
            issue: &issue,
            pull_request: pull_request.as_ref(),
            agent_still_assigned,
            agent_login: &config.copilot_assignee,
        });
        let signal = match detection {
            Detection::Complete(signal) => signal,
            Detection::Pending | Detection::FalsePositive => return Ok(ProcessOutcome::Waiting),
        };
        tracing::info!(
            project_id = %key.project_id,
            issue_number = key.issue_number,
            agent = %run.current_agent_slug,
            signal = signal.as_str(),
            "Agent finished"
        );

        self.advance(&config, &run, &issue, pull_request.as_ref(), trigger)
            .await
    }

    async fn advance(
        &self,
        config: &WorkflowConfiguration,
        run: &PipelineRunState,
        issue: &IssueSnapshot,
        pull_request: Option<&PullRequestSnapshot>,
        trigger: TriggeredBy,
    ) -> Result<ProcessOutcome, WorkflowError> {
        let key = run.key();
        if let Some(next) = config.agents_for(&run.status).get(run.status_index + 1) {
            return self.advance_within_column(config, &key, next, issue, pull_request).await;
        }

        let Some(column) = config.column_for(&run.status) else {
            return Err(WorkflowError::UnknownStatus {
                project_id: key.project_id.clone(),
                status: run.status.clone(),
            });
        };
        let Some(next_column) = column.next() else {
            self.tracker.clear(&key).await.map_err(WorkflowError::Storage)?;
            return Ok(ProcessOutcome::PipelineFinished {
                status: run.status.clone(),
            });
        };

        self.move_to_status(
            config,
            MoveRequest {
                key: &key,
                item_id: &run.project_item_id,
                from: Some(&run.status),
                to: config.status_name(next_column),
                trigger,
                issue,
                pull_request,
                previous: Some(run),
            },
        )
        .await
    }

    /// Next agent in the same column. Not a status transition, so no audit row.
    async fn advance_within_column(
        &self,
        config: &WorkflowConfiguration,
        key: &RunKey,
        next: &AgentAssignment,
        issue: &IssueSnapshot,
        pull_request: Option<&PullRequestSnapshot>,
    ) -> Result<ProcessOutcome, WorkflowError> {
        let instructions = next.policy().instructions(key.issue_number, &issue.title);
        self.github
            .assign_agent_to_issue(
                &config.repository(),
                key.issue_number,
                &config.copilot_assignee,
                &next.slug,
                &instructions,
            )
            .await?;

        let state = self
            .tracker
            .advance(
                key,
                &next.slug,
                pull_request.map(|pr| pr.head_sha.clone()),
                pull_request.map(|pr| pr.state),
            )
            .await
            .map_err(WorkflowError::Storage)?;

        if let Some(state) = state {
            tracing::info!(
                project_id = %key.project_id,
                issue_number = key.issue_number,
                agent = %next.slug,
                status_index = state.status_index,
                "Assigned next agent in column"
            );
            broadcast_message(
                &self.events,
                &WsMessage::AgentAssigned {
                    project_id: key.project_id.clone(),
                    issue_number: key.issue_number,
                    agent: next.slug.clone(),
                    status_index: state.status_index,
                },
            );
        }
        Ok(ProcessOutcome::AgentAdvanced {
            agent: next.slug.clone(),
        })
    }

    async fn move_to_status(
        &self,
        config: &WorkflowConfiguration,
        req: MoveRequest<'_>,
    ) -> Result<ProcessOutcome, WorkflowError> {
        let key = req.key;
        let project_id = key.project_id.as_str();

        let field = match self.github.get_status_field(project_id).await {
            Ok(field) => field,
            Err(e) => return Err(self.fail(&req, e.into()).await),
        };
        let Some(option) = field.option_for(req.to) else {
            let err = WorkflowError::configuration(
                project_id,
                format!("board has no status option named '{}'", req.to),
            );
            return Err(self.fail(&req, err).await);
        };
        if let Err(e) = self
            .github
            .move_project_item_to_status(project_id, req.item_id, &field.field_id, &option.id)
            .await
        {
            return Err(self.fail(&req, e.into()).await);
        }

        let first_agent = config.agents_for(req.to).first();
        if let Some(agent) = first_agent {
            let instructions = agent
                .policy()
                .instructions(key.issue_number, &req.issue.title);
            if let Err(e) = self
                .github
                .assign_agent_to_issue(
                    &config.repository(),
                    key.issue_number,
                    &config.copilot_assignee,
                    &agent.slug,
                    &instructions,
                )
                .await
            {
                if let Some(prev) = req.from.and_then(|from| field.option_for(from)) {
                    match self
                        .github
                        .move_project_item_to_status(project_id, req.item_id, &field.field_id, &prev.id)
                        .await
                    {
                        Ok(()) => tracing::warn!(
                            project_id,
                            issue_number = key.issue_number,
                            status = %prev.name,
                            "Agent assignment failed, board move rolled back"
                        ),
                        Err(rollback) => tracing::error!(
                            project_id,
                            issue_number = key.issue_number,
                            error = %rollback,
                            "Rollback of board move failed"
                        ),
                    }
                }
                return Err(self.fail(&req, e.into()).await);
            }
        }

        if config.column_for(req.to) == Some(StatusColumn::InReview)
            && let (Some(reviewer), Some(pr)) = (&config.review_assignee, req.pull_request)
            && let Err(e) = self
                .github
                .request_review(&config.repository(), pr.number, reviewer)
                .await
        {
            tracing::warn!(
                project_id,
                issue_number = key.issue_number,
                reviewer = %reviewer,
                error = %e,
                "Review request failed"
            );
        }

        let tracked = match first_agent {
            Some(agent) => {
                let now = Utc::now();
                let state = PipelineRunState {
                    issue_number: key.issue_number,
                    project_id: key.project_id.clone(),
                    status: req.to.to_string(),
                    status_index: 0,
                    current_agent_slug: agent.slug.clone(),
                    agent_assigned_sha: req.pull_request.map(|pr| pr.head_sha.clone()),
                    agent_assigned_at: now,
                    pipeline_started_at: req.previous.map_or(now, |p| p.pipeline_started_at),
                    main_pr_number: req
                        .pull_request
                        .map(|pr| pr.number)
                        .or_else(|| req.previous.and_then(|p| p.main_pr_number)),
                    main_branch: req
                        .pull_request
                        .map(|pr| pr.head_ref.clone())
                        .or_else(|| req.previous.and_then(|p| p.main_branch.clone())),
                    assigned_pr_state: req.pull_request.map(|pr| pr.state),
                    project_item_id: req.item_id.to_string(),
                    blocked: None,
                };
                self.tracker.start(state.clone()).await.map(|()| Some(state))
            }
            None => self.tracker.clear(key).await.map(|_| None),
        };
        let started = match tracked {
            Ok(started) => started,
            Err(e) => return Err(self.fail(&req, WorkflowError::Storage(e)).await),
        };

        let transition = WorkflowTransition::succeeded(
            key,
            req.from,
            req.to,
            first_agent.map(|_| config.copilot_assignee.as_str()),
            req.trigger,
        );
        self.record(&transition).await;
        tracing::info!(
            project_id,
            issue_number = key.issue_number,
            from = req.from.unwrap_or("-"),
            to = req.to,
            triggered_by = req.trigger.as_str(),
            agent = first_agent.map(|a| a.slug.as_str()).unwrap_or("-"),
            "Status transition"
        );
        broadcast_message(&self.events, &WsMessage::StatusChanged { transition });

        match started {
            Some(run) => {
                broadcast_message(&self.events, &WsMessage::PipelineStarted { run });
                Ok(ProcessOutcome::StatusAdvanced {
                    from: req.from.map(str::to_string),
                    to: req.to.to_string(),
                })
            }
            None => {
                broadcast_message(
                    &self.events,
                    &WsMessage::PipelineFinished {
                        project_id: key.project_id.clone(),
                        issue_number: key.issue_number,
                        final_status: req.to.to_string(),
                    },
                );
                Ok(ProcessOutcome::PipelineFinished {
                    status: req.to.to_string(),
                })
            }
        }
    }

    async fn park(&self, key: &RunKey, err: &WorkflowError) {
        let reason = err.to_string();
        match self.tracker.block(key, &reason).await {
            Ok(true) => {
                tracing::warn!(
                    project_id = %key.project_id,
                    issue_number = key.issue_number,
                    reason = %reason,
                    "Run blocked until moved manually or mappings change"
                );
                broadcast_message(
                    &self.events,
                    &WsMessage::PipelineBlocked {
                        project_id: key.project_id.clone(),
                        issue_number: key.issue_number,
                        reason,
                    },
                );
            }
            Ok(false) => {}
            Err(e) => tracing::error!(
                project_id = %key.project_id,
                issue_number = key.issue_number,
                error = %e,
                "Failed to mark run as blocked"
            ),
        }
    }

    /// Audit a failed transition attempt and hand the error back.
    async fn fail(&self, req: &MoveRequest<'_>, err: WorkflowError) -> WorkflowError {
        self.record_failure(req.key, req.from, req.to, req.trigger, &err)
            .await;
        err
    }

    async fn record_failure(
        &self,
        key: &RunKey,
        from: Option<&str>,
        to: &str,
        trigger: TriggeredBy,
        err: &WorkflowError,
    ) {
        if err.is_configuration() {
            tracing::warn!(project_id = %key.project_id, issue_number = key.issue_number, to, error = %err, "Transition skipped");
        } else {
            tracing::error!(project_id = %key.project_id, issue_number = key.issue_number, to, error = %err, "Transition failed");
        }
        let transition = WorkflowTransition::failed(key, from, to, trigger, &err.to_string());
        self.record(&transition).await;
        broadcast_message(&self.events, &WsMessage::TransitionFailed { transition });
    }

    async fn record(&self, transition: &WorkflowTransition) {
        let row = transition.clone();
        if let Err(e) = self.db.call(move |db| db.insert_transition(&row)).await {
            tracing::error!(
                project_id = %transition.project_id,
                issue_number = transition.issue_id,
                error = %e,
                "Failed to write audit row"
            );
        }
    }

    // ── Operator and discovery entry points ──────────────────────────

    /// Move an issue to any column, including backwards. A blocked run is
    /// replaced by the pipeline of the target column.
    pub async fn transition_manual(
        &self,
        project_id: &str,
        issue_number: u64,
        to_status: &str,
    ) -> Result<ProcessOutcome, WorkflowError> {
        let config = self.configs.get_effective_config(project_id).await?;
        let Some(column) = config.column_for(to_status) else {
            return Err(WorkflowError::UnknownStatus {
                project_id: project_id.to_string(),
                status: to_status.to_string(),
            });
        };
        let to = config.status_name(column);
        let key = RunKey::new(project_id, issue_number);
        let _guard = self.lock_key(&key).await;

        let (item, issue, pull_request) = match self.load_item(&config, issue_number).await {
            Ok(loaded) => loaded,
            Err(err) => {
                self.record_failure(&key, None, to, TriggeredBy::Manual, &err)
                    .await;
                return Err(err);
            }
        };
        let previous = self.tracker.get(&key).await;

        self.move_to_status(
            &config,
            MoveRequest {
                key: &key,
                item_id: &item.item_id,
                from: item.status.as_deref(),
                to,
                trigger: TriggeredBy::Manual,
                issue: &issue,
                pull_request: pull_request.as_ref(),
                previous: previous.as_ref(),
            },
        )
        .await
    }

    async fn load_item(
        &self,
        config: &WorkflowConfiguration,
        issue_number: u64,
    ) -> Result<(ProjectItem, IssueSnapshot, Option<PullRequestSnapshot>), WorkflowError> {
        let repo = config.repository();
        let item = self
            .github
            .list_project_items(&config.project_id)
            .await?
            .into_iter()
            .find(|i| i.issue_number == issue_number)
            .ok_or_else(|| WorkflowError::IssueNotOnProject {
                project_id: config.project_id.clone(),
                issue_number,
            })?;
        let issue = self.github.get_issue(&repo, issue_number).await?;
        let pull_request = self
            .github
            .get_pull_request_for_issue(&repo, issue_number)
            .await?;
        Ok((item, issue, pull_request))
    }

    /// Start pipelines for project items sitting in a mapped column without
    /// tracked state. Items without a status are left alone.
    pub async fn discover(&self, project_id: &str) -> Result<usize, WorkflowError> {
        let config = self.configs.get_effective_config(project_id).await?;
        if !config.enabled {
            return Ok(0);
        }
        let repo = config.repository();
        let items = self.github.list_project_items(project_id).await?;

        let mut started = 0;
        for item in items {
            let Some(status) = item.status.as_deref() else {
                continue;
            };
            if item.repository.as_ref().is_some_and(|r| *r != repo) {
                continue;
            }
            let Some(first) = config.agents_for(status).first() else {
                continue;
            };
            let key = RunKey::new(project_id, item.issue_number);
            let _guard = self.lock_key(&key).await;
            if self.tracker.get(&key).await.is_some() {
                continue;
            }
            match self.start_pipeline(&config, &key, &item, status, first).await {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!(
                    project_id,
                    issue_number = item.issue_number,
                    error = %e,
                    "Could not start pipeline"
                ),
            }
        }
        Ok(started)
    }

    async fn start_pipeline(
        &self,
        config: &WorkflowConfiguration,
        key: &RunKey,
        item: &ProjectItem,
        status: &str,
        agent: &AgentAssignment,
    ) -> Result<(), WorkflowError> {
        let repo = config.repository();
        let issue = self.github.get_issue(&repo, key.issue_number).await?;
        let pull_request = self
            .github
            .get_pull_request_for_issue(&repo, key.issue_number)
            .await?;
        let instructions = agent.policy().instructions(key.issue_number, &issue.title);
        self.github
            .assign_agent_to_issue(
                &repo,
                key.issue_number,
                &config.copilot_assignee,
                &agent.slug,
                &instructions,
            )
            .await?;

        let now = Utc::now();
        let run = PipelineRunState {
            issue_number: key.issue_number,
            project_id: key.project_id.clone(),
            status: config
                .column_for(status)
                .map_or(status, |c| config.status_name(c))
                .to_string(),
            status_index: 0,
            current_agent_slug: agent.slug.clone(),
            agent_assigned_sha: pull_request.as_ref().map(|pr| pr.head_sha.clone()),
            agent_assigned_at: now,
            pipeline_started_at: now,
            main_pr_number: pull_request.as_ref().map(|pr| pr.number),
            main_branch: pull_request.as_ref().map(|pr| pr.head_ref.clone()),
            assigned_pr_state: pull_request.as_ref().map(|pr| pr.state),
            project_item_id: item.item_id.clone(),
            blocked: None,
        };
        self.tracker
            .start(run.clone())
            .await
            .map_err(WorkflowError::Storage)?;
        tracing::info!(
            project_id = %key.project_id,
            issue_number = key.issue_number,
            agent = %agent.slug,
            status,
            "Pipeline started"
        );
        broadcast_message(&self.events, &WsMessage::PipelineStarted { run });
        Ok(())
    }

    /// Create an issue in the project's repository and add it to the board.
    /// It gets no status and no agent.
    pub async fn create_issue(
        &self,
        project_id: &str,
        title: &str,
        body: &str,
    ) -> Result<CreatedProjectIssue, WorkflowError> {
        let config = self.configs.get_effective_config(project_id).await?;
        let created = self
            .github
            .create_issue(&config.repository(), title, body)
            .await?;
        let item_id = self
            .github
            .add_issue_to_project(project_id, &created.node_id)
            .await?;

        tracing::info!(project_id, issue_number = created.number, "Issue created");
        broadcast_message(
            &self.events,
            &WsMessage::IssueCreated {
                project_id: project_id.to_string(),
                issue_number: created.number,
                html_url: created.html_url.clone(),
            },
        );
        Ok(CreatedProjectIssue {
            number: created.number,
            html_url: created.html_url,
            item_id,
        })
    }

    /// Replace a project's agent mappings and release its blocked runs.
    /// Returns how many runs were released.
    pub async fn set_project_mappings(
        &self,
        project_id: &str,
        mappings: AgentMappings,
    ) -> Result<usize, WorkflowError> {
        self.configs.set_project_mappings(project_id, mappings).await?;

        let mut released = 0;
        for run in self.tracker.list_for_project(project_id).await {
            if !run.is_blocked() {
                continue;
            }
            let key = run.key();
            let _guard = self.lock_key(&key).await;
            if self.tracker.unblock(&key).await.map_err(WorkflowError::Storage)? {
                released += 1;
            }
        }
        if released > 0 {
            tracing::info!(project_id, released, "Released blocked runs");
        }
        Ok(released)
    }

    pub async fn pipeline_statuses(&self, project_id: &str) -> Vec<PipelineRunState> {
        self.tracker.list_for_project(project_id).await
    }

    pub async fn transitions(
        &self,
        project_id: &str,
        issue_number: Option<u64>,
        limit: usize,
    ) -> Result<Vec<WorkflowTransition>, WorkflowError> {
        let pid = project_id.to_string();
        self.db
            .call(move |db| db.list_transitions(&pid, issue_number, limit))
            .await
            .map_err(WorkflowError::Storage)
    }
}

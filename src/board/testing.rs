//! Scripted in-memory [`GitHubClient`] for engine, poller and API tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::github::*;
use super::models::{PrState, RepositoryRef};
use crate::errors::{GitHubError, GitHubResult};

pub const STATUS_NAMES: [&str; 5] = ["Backlog", "Ready", "In Progress", "In Review", "Done"];

#[derive(Default)]
struct FakeState {
    issues: HashMap<u64, IssueSnapshot>,
    pull_requests: HashMap<u64, PullRequestSnapshot>,
    assigned: HashMap<u64, bool>,
    items: Vec<ProjectItem>,
    status_field: Option<StatusField>,
    failures: HashMap<String, VecDeque<GitHubError>>,
    calls: Vec<String>,
    assignments: Vec<(u64, String)>,
    moves: Vec<(u64, String)>,
    reviews: Vec<(u64, String)>,
    created: Vec<CreatedIssue>,
    next_issue_number: u64,
    holds: HashMap<String, Hold>,
}

/// Parks the next call of an operation until released.
#[derive(Clone, Default)]
pub struct Hold {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub struct FakeGitHubClient {
    state: Mutex<FakeState>,
}

impl FakeGitHubClient {
    pub fn new() -> Self {
        let options = STATUS_NAMES
            .iter()
            .map(|name| StatusOption {
                id: format!("opt_{}", name.to_lowercase().replace(' ', "_")),
                name: name.to_string(),
            })
            .collect();
        Self {
            state: Mutex::new(FakeState {
                status_field: Some(StatusField {
                    field_id: "PVTSSF_status".into(),
                    options,
                }),
                next_issue_number: 100,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_item(&self, issue_number: u64, status: Option<&str>, repo: Option<RepositoryRef>) {
        self.state().items.push(ProjectItem {
            item_id: format!("PVTI_{}", issue_number),
            issue_number,
            status: status.map(str::to_string),
            repository: repo,
        });
    }

    pub fn item_status(&self, issue_number: u64) -> Option<String> {
        self.state()
            .items
            .iter()
            .find(|i| i.issue_number == issue_number)
            .and_then(|i| i.status.clone())
    }

    pub fn remove_status_option(&self, name: &str) {
        if let Some(field) = self.state().status_field.as_mut() {
            field.options.retain(|o| o.name != name);
        }
    }

    pub fn set_pull_request(&self, issue_number: u64, pr_number: u64, state: PrState, sha: &str) {
        let mut st = self.state();
        let timeline = st
            .pull_requests
            .get(&issue_number)
            .map(|pr| pr.timeline.clone())
            .unwrap_or_default();
        st.pull_requests.insert(
            issue_number,
            PullRequestSnapshot {
                number: pr_number,
                node_id: format!("PR_{}", pr_number),
                state,
                head_ref: format!("copilot/issue-{}", issue_number),
                head_sha: sha.to_string(),
                timeline,
            },
        );
    }

    pub fn set_head_branch(&self, issue_number: u64, head_ref: &str) {
        if let Some(pr) = self.state().pull_requests.get_mut(&issue_number) {
            pr.head_ref = head_ref.to_string();
        }
    }

    pub fn comment_on_pull_request(&self, issue_number: u64, body: &str, at: DateTime<Utc>) {
        if let Some(pr) = self.state().pull_requests.get_mut(&issue_number) {
            pr.timeline.push(TimelineEvent {
                kind: TimelineEventKind::Commented,
                actor: Some("Copilot".into()),
                body: Some(body.to_string()),
                created_at: at,
            });
        }
    }

    pub fn set_agent_assigned(&self, issue_number: u64, assigned: bool) {
        self.state().assigned.insert(issue_number, assigned);
    }

    /// Make the next call of `operation` fail with `err`.
    pub fn fail_next(&self, operation: &str, err: GitHubError) {
        self.state()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(err);
    }

    /// Make the next call of `operation` wait on the returned [`Hold`].
    pub fn hold_next(&self, operation: &str) -> Hold {
        let hold = Hold::default();
        self.state().holds.insert(operation.to_string(), hold.clone());
        hold
    }

    async fn pause(&self, operation: &str) {
        let hold = self.state().holds.remove(operation);
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.release.notified().await;
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn assignments(&self) -> Vec<(u64, String)> {
        self.state().assignments.clone()
    }

    pub fn moves(&self) -> Vec<(u64, String)> {
        self.state().moves.clone()
    }

    pub fn reviews(&self) -> Vec<(u64, String)> {
        self.state().reviews.clone()
    }

    pub fn created(&self) -> Vec<CreatedIssue> {
        self.state().created.clone()
    }

    fn enter(&self, operation: &str) -> GitHubResult<std::sync::MutexGuard<'_, FakeState>> {
        let mut st = self.state();
        st.calls.push(operation.to_string());
        if let Some(err) = st.failures.get_mut(operation).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(st)
    }
}

#[async_trait]
impl GitHubClient for FakeGitHubClient {
    async fn get_issue(&self, _repo: &RepositoryRef, number: u64) -> GitHubResult<IssueSnapshot> {
        self.pause("get_issue").await;
        let st = self.enter("get_issue")?;
        Ok(st.issues.get(&number).cloned().unwrap_or_else(|| IssueSnapshot {
            number,
            node_id: format!("I_{}", number),
            title: format!("Issue {}", number),
            body: None,
            state: "open".into(),
            assignees: Vec::new(),
            timeline: Vec::new(),
        }))
    }

    async fn get_pull_request_for_issue(
        &self,
        _repo: &RepositoryRef,
        issue_number: u64,
    ) -> GitHubResult<Option<PullRequestSnapshot>> {
        let st = self.enter("get_pull_request_for_issue")?;
        Ok(st.pull_requests.get(&issue_number).cloned())
    }

    async fn is_agent_assigned_to_issue(
        &self,
        _repo: &RepositoryRef,
        issue_number: u64,
        _assignee: &str,
    ) -> GitHubResult<bool> {
        let st = self.enter("is_agent_assigned_to_issue")?;
        Ok(st.assigned.get(&issue_number).copied().unwrap_or(false))
    }

    async fn assign_agent_to_issue(
        &self,
        _repo: &RepositoryRef,
        issue_number: u64,
        _assignee: &str,
        slug: &str,
        _instructions: &str,
    ) -> GitHubResult<()> {
        let mut st = self.enter("assign_agent_to_issue")?;
        st.assigned.insert(issue_number, true);
        st.assignments.push((issue_number, slug.to_string()));
        Ok(())
    }

    async fn list_project_items(&self, _project_id: &str) -> GitHubResult<Vec<ProjectItem>> {
        let st = self.enter("list_project_items")?;
        Ok(st.items.clone())
    }

    async fn get_status_field(&self, project_id: &str) -> GitHubResult<StatusField> {
        let st = self.enter("get_status_field")?;
        st.status_field
            .clone()
            .ok_or_else(|| GitHubError::not_found("get status field", project_id))
    }

    async fn move_project_item_to_status(
        &self,
        _project_id: &str,
        item_id: &str,
        _field_id: &str,
        option_id: &str,
    ) -> GitHubResult<()> {
        let mut st = self.enter("move_project_item_to_status")?;
        let name = st
            .status_field
            .as_ref()
            .and_then(|f| f.options.iter().find(|o| o.id == option_id))
            .map(|o| o.name.clone())
            .ok_or_else(|| GitHubError::permanent("move project item", "unknown option"))?;
        let item = st
            .items
            .iter_mut()
            .find(|i| i.item_id == item_id)
            .ok_or_else(|| GitHubError::not_found("move project item", item_id))?;
        item.status = Some(name.clone());
        let issue_number = item.issue_number;
        st.moves.push((issue_number, name));
        Ok(())
    }

    async fn create_issue(
        &self,
        _repo: &RepositoryRef,
        title: &str,
        body: &str,
    ) -> GitHubResult<CreatedIssue> {
        let mut st = self.enter("create_issue")?;
        st.next_issue_number += 1;
        let number = st.next_issue_number;
        let created = CreatedIssue {
            number,
            node_id: format!("I_{}", number),
            html_url: format!("https://github.com/acme/widgets/issues/{}", number),
        };
        st.issues.insert(
            number,
            IssueSnapshot {
                number,
                node_id: created.node_id.clone(),
                title: title.to_string(),
                body: Some(body.to_string()),
                state: "open".into(),
                assignees: Vec::new(),
                timeline: Vec::new(),
            },
        );
        st.created.push(created.clone());
        Ok(created)
    }

    async fn add_issue_to_project(
        &self,
        _project_id: &str,
        issue_node_id: &str,
    ) -> GitHubResult<String> {
        let mut st = self.enter("add_issue_to_project")?;
        let number = st
            .created
            .iter()
            .find(|c| c.node_id == issue_node_id)
            .map(|c| c.number)
            .ok_or_else(|| GitHubError::not_found("add issue to project", issue_node_id))?;
        let item_id = format!("PVTI_{}", number);
        st.items.push(ProjectItem {
            item_id: item_id.clone(),
            issue_number: number,
            status: None,
            repository: None,
        });
        Ok(item_id)
    }

    async fn request_review(
        &self,
        _repo: &RepositoryRef,
        pr_number: u64,
        reviewer: &str,
    ) -> GitHubResult<()> {
        let mut st = self.enter("request_review")?;
        st.reviews.push((pr_number, reviewer.to_string()));
        Ok(())
    }
}

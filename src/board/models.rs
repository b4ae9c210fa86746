use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_STATUS_BACKLOG: &str = "Backlog";
pub const DEFAULT_STATUS_READY: &str = "Ready";
pub const DEFAULT_STATUS_IN_PROGRESS: &str = "In Progress";
pub const DEFAULT_STATUS_IN_REVIEW: &str = "In Review";
pub const DEFAULT_STATUS_DONE: &str = "Done";

pub const DEFAULT_COPILOT_ASSIGNEE: &str = "copilot-swe-agent";

/// Canonical board stages. Projects may rename them via the aliases in
/// [`WorkflowConfiguration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusColumn {
    Backlog,
    Ready,
    InProgress,
    InReview,
    Done,
}

impl StatusColumn {
    pub const ALL: [StatusColumn; 5] = [
        Self::Backlog,
        Self::Ready,
        Self::InProgress,
        Self::InReview,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Done => "done",
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Backlog => Some(Self::Ready),
            Self::Ready => Some(Self::InProgress),
            Self::InProgress => Some(Self::InReview),
            Self::InReview => Some(Self::Done),
            Self::Done => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Done
    }

    /// Column for one of the default board status names (case-insensitive).
    pub fn from_default_name(status: &str) -> Option<Self> {
        let status = status.trim();
        Self::ALL
            .into_iter()
            .find(|col| col.default_name().eq_ignore_ascii_case(status))
    }

    pub fn default_name(&self) -> &'static str {
        match self {
            Self::Backlog => DEFAULT_STATUS_BACKLOG,
            Self::Ready => DEFAULT_STATUS_READY,
            Self::InProgress => DEFAULT_STATUS_IN_PROGRESS,
            Self::InReview => DEFAULT_STATUS_IN_REVIEW,
            Self::Done => DEFAULT_STATUS_DONE,
        }
    }
}

impl fmt::Display for StatusColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid status column: {}", s)),
        }
    }
}

/// Who caused a status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Automatic,
    Manual,
    Detection,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::Detection => "detection",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggeredBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            "detection" => Ok(Self::Detection),
            _ => Err(format!("Invalid trigger: {}", s)),
        }
    }
}

/// Lifecycle state of a pull request as seen by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Draft,
    Open,
    Merged,
    Closed,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }

    /// True when the PR moved forward since `before`: left draft, or got
    /// merged/closed. `None` means no PR existed when the agent was assigned.
    pub fn progressed_from(&self, before: Option<PrState>) -> bool {
        match (before, self) {
            (_, Self::Draft) => false,
            (None, _) => true,
            (Some(Self::Draft), _) => true,
            (Some(Self::Open), Self::Merged | Self::Closed) => true,
            (Some(Self::Open), Self::Open) => false,
            (Some(prev), now) => prev != *now && matches!(prev, Self::Open | Self::Draft),
        }
    }
}

impl FromStr for PrState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "open" => Ok(Self::Open),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid pull request state: {}", s)),
        }
    }
}

// ── Agents ───────────────────────────────────────────────────────────

/// Output files the spec-kit agents are known to produce. These are hints
/// passed to the agent, never a completion gate.
const KNOWN_AGENT_OUTPUTS: &[(&str, &[&str])] = &[
    ("speckit.specify", &["spec.md"]),
    ("speckit.plan", &["plan.md", "research.md", "data-model.md"]),
    ("speckit.tasks", &["tasks.md"]),
];

/// How an agent's work is described to it and recognised when it reports back.
pub trait AgentOutputPolicy {
    fn slug(&self) -> &str;

    /// Files the agent is expected to write, if known.
    fn expected_outputs(&self) -> &[&'static str];

    /// Comment text an agent posts when its turn is finished.
    fn completion_marker(&self) -> String {
        format!("{}: Done!", self.slug())
    }

    fn is_completion_marker(&self, body: &str) -> bool {
        body.contains(&self.completion_marker())
    }

    /// Instructions sent along with the assignment.
    fn instructions(&self, issue_number: u64, issue_title: &str) -> String {
        let mut text = format!(
            "You are running the `{}` stage for issue #{}: {}.\n",
            self.slug(),
            issue_number,
            issue_title
        );
        let outputs = self.expected_outputs();
        if !outputs.is_empty() {
            text.push_str(&format!("Expected outputs: {}.\n", outputs.join(", ")));
        }
        text.push_str(&format!(
            "When finished, comment `{}` on the pull request.",
            self.completion_marker()
        ));
        text
    }
}

/// Agent with a known output contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAgent {
    pub slug: String,
    pub expected_outputs: &'static [&'static str],
}

/// Any other agent: completion is recognised by marker and PR signals only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAgent {
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentKind {
    Known(KnownAgent),
    Unknown(UnknownAgent),
}

impl AgentKind {
    pub fn for_slug(slug: &str) -> Self {
        match KNOWN_AGENT_OUTPUTS.iter().find(|(known, _)| *known == slug) {
            Some((_, outputs)) => Self::Known(KnownAgent {
                slug: slug.to_string(),
                expected_outputs: outputs,
            }),
            None => Self::Unknown(UnknownAgent {
                slug: slug.to_string(),
            }),
        }
    }
}

impl AgentOutputPolicy for AgentKind {
    fn slug(&self) -> &str {
        match self {
            Self::Known(agent) => &agent.slug,
            Self::Unknown(agent) => &agent.slug,
        }
    }

    fn expected_outputs(&self) -> &[&'static str] {
        match self {
            Self::Known(agent) => agent.expected_outputs,
            Self::Unknown(_) => &[],
        }
    }
}

/// One agent slot in a column's ordered pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub slug: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Reserved for per-agent settings; passed through untouched.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

impl AgentAssignment {
    pub fn new(slug: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            display_name: None,
            config: None,
        }
    }

    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    pub fn policy(&self) -> AgentKind {
        AgentKind::for_slug(&self.slug)
    }
}

pub type AgentMappings = BTreeMap<String, Vec<AgentAssignment>>;

/// Reject mappings the engine could never finish: blank names or slugs, and
/// statuses that are not one of the board columns.
pub fn validate_mappings(
    mappings: &AgentMappings,
    column_for: impl Fn(&str) -> Option<StatusColumn>,
) -> Result<(), String> {
    for (status, agents) in mappings {
        if status.trim().is_empty() {
            return Err("empty status name in mappings".to_string());
        }
        if column_for(status).is_none() {
            return Err(format!("'{}' is not a board column", status));
        }
        if agents.iter().any(|a| a.slug.trim().is_empty()) {
            return Err(format!("empty agent slug under '{}'", status));
        }
    }
    Ok(())
}

/// Built-in agent pipeline used when neither the project nor the global
/// configuration provides one.
pub fn builtin_agent_mappings() -> AgentMappings {
    let mut mappings = AgentMappings::new();
    mappings.insert(
        DEFAULT_STATUS_BACKLOG.to_string(),
        vec![AgentAssignment::new("speckit.specify").with_display_name("Spec Kit - Specify")],
    );
    mappings.insert(
        DEFAULT_STATUS_READY.to_string(),
        vec![
            AgentAssignment::new("speckit.plan").with_display_name("Spec Kit - Plan"),
            AgentAssignment::new("speckit.tasks").with_display_name("Spec Kit - Tasks"),
        ],
    );
    mappings.insert(
        DEFAULT_STATUS_IN_PROGRESS.to_string(),
        vec![AgentAssignment::new("speckit.implement").with_display_name("Spec Kit - Implement")],
    );
    mappings.insert(
        DEFAULT_STATUS_IN_REVIEW.to_string(),
        vec![AgentAssignment::new("copilot-review").with_display_name("Copilot Review")],
    );
    mappings
}

// ── Repository ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
}

impl RepositoryRef {
    pub fn new(owner: &str, name: &str) -> Self {
        Self {
            owner: owner.to_string(),
            name: name.to_string(),
        }
    }

    /// Parse `owner/name`.
    pub fn parse(slug: &str) -> Option<Self> {
        let (owner, name) = slug.trim().split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }
}

impl fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

// ── Workflow configuration ───────────────────────────────────────────

/// Effective workflow settings for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfiguration {
    pub project_id: String,
    pub repository_owner: String,
    pub repository_name: String,
    pub copilot_assignee: String,
    pub review_assignee: Option<String>,
    pub agent_mappings: AgentMappings,
    pub status_backlog: String,
    pub status_ready: String,
    pub status_in_progress: String,
    pub status_in_review: String,
    pub status_done: String,
    pub enabled: bool,
}

impl WorkflowConfiguration {
    pub fn new(project_id: &str, repository: &RepositoryRef) -> Self {
        Self {
            project_id: project_id.to_string(),
            repository_owner: repository.owner.clone(),
            repository_name: repository.name.clone(),
            copilot_assignee: DEFAULT_COPILOT_ASSIGNEE.to_string(),
            review_assignee: None,
            agent_mappings: builtin_agent_mappings(),
            status_backlog: DEFAULT_STATUS_BACKLOG.to_string(),
            status_ready: DEFAULT_STATUS_READY.to_string(),
            status_in_progress: DEFAULT_STATUS_IN_PROGRESS.to_string(),
            status_in_review: DEFAULT_STATUS_IN_REVIEW.to_string(),
            status_done: DEFAULT_STATUS_DONE.to_string(),
            enabled: true,
        }
    }

    pub fn repository(&self) -> RepositoryRef {
        RepositoryRef::new(&self.repository_owner, &self.repository_name)
    }

    pub fn status_name(&self, column: StatusColumn) -> &str {
        match column {
            StatusColumn::Backlog => &self.status_backlog,
            StatusColumn::Ready => &self.status_ready,
            StatusColumn::InProgress => &self.status_in_progress,
            StatusColumn::InReview => &self.status_in_review,
            StatusColumn::Done => &self.status_done,
        }
    }

    /// Map a board status name onto the canonical column (case-insensitive).
    pub fn column_for(&self, status: &str) -> Option<StatusColumn> {
        StatusColumn::ALL
            .into_iter()
            .find(|col| self.status_name(*col).eq_ignore_ascii_case(status.trim()))
    }

    pub fn next_status(&self, status: &str) -> Option<&str> {
        let next = self.column_for(status)?.next()?;
        Some(self.status_name(next))
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        self.column_for(status).is_some_and(|c| c.is_terminal())
    }

    /// Ordered agents mapped to a status (case-insensitive key match).
    pub fn agents_for(&self, status: &str) -> &[AgentAssignment] {
        self.agent_mappings
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(status.trim()))
            .map(|(_, agents)| agents.as_slice())
            .unwrap_or(&[])
    }
}

// ── In-flight pipeline state ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
    pub project_id: String,
    pub issue_number: u64,
}

impl RunKey {
    pub fn new(project_id: &str, issue_number: u64) -> Self {
        Self {
            project_id: project_id.to_string(),
            issue_number,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.project_id, self.issue_number)
    }
}

/// The agent currently working an issue, and what the world looked like
/// when it was assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunState {
    pub issue_number: u64,
    pub project_id: String,
    /// Board column the pipeline is running in.
    pub status: String,
    /// Position of `current_agent_slug` in the column's ordered agent list.
    pub status_index: usize,
    pub current_agent_slug: String,
    /// Head SHA of the main PR at assignment time, `None` if no PR existed.
    pub agent_assigned_sha: Option<String>,
    pub agent_assigned_at: DateTime<Utc>,
    pub pipeline_started_at: DateTime<Utc>,
    pub main_pr_number: Option<u64>,
    pub main_branch: Option<String>,
    pub assigned_pr_state: Option<PrState>,
    pub project_item_id: String,
    /// Why automatic processing stopped for this run. Set on failures that
    /// polling again cannot fix.
    #[serde(default)]
    pub blocked: Option<String>,
}

impl PipelineRunState {
    pub fn key(&self) -> RunKey {
        RunKey::new(&self.project_id, self.issue_number)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

// ── Audit trail ──────────────────────────────────────────────────────

/// One status transition attempt. Rows are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTransition {
    pub transition_id: Uuid,
    pub issue_id: u64,
    pub project_id: String,
    pub from_status: Option<String>,
    pub to_status: String,
    pub assigned_user: Option<String>,
    pub triggered_by: TriggeredBy,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowTransition {
    pub fn succeeded(
        key: &RunKey,
        from_status: Option<&str>,
        to_status: &str,
        assigned_user: Option<&str>,
        triggered_by: TriggeredBy,
    ) -> Self {
        Self {
            transition_id: Uuid::new_v4(),
            issue_id: key.issue_number,
            project_id: key.project_id.clone(),
            from_status: from_status.map(str::to_string),
            to_status: to_status.to_string(),
            assigned_user: assigned_user.map(str::to_string),
            triggered_by,
            success: true,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        key: &RunKey,
        from_status: Option<&str>,
        to_status: &str,
        triggered_by: TriggeredBy,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error_message: Some(error.to_string()),
            ..Self::succeeded(key, from_status, to_status, None, triggered_by)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkflowConfiguration {
        WorkflowConfiguration::new("PVT_1", &RepositoryRef::new("acme", "widgets"))
    }

    #[test]
    fn test_status_column_roundtrip() {
        for s in &["backlog", "ready", "in_progress", "in_review", "done"] {
            let parsed: StatusColumn = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("shipped".parse::<StatusColumn>().is_err());
    }

    #[test]
    fn test_status_column_order() {
        assert_eq!(StatusColumn::Backlog.next(), Some(StatusColumn::Ready));
        assert_eq!(StatusColumn::InReview.next(), Some(StatusColumn::Done));
        assert_eq!(StatusColumn::Done.next(), None);
        assert!(StatusColumn::Done.is_terminal());
    }

    #[test]
    fn test_triggered_by_serde() {
        assert_eq!(
            serde_json::to_string(&TriggeredBy::Detection).unwrap(),
            "\"detection\""
        );
        assert_eq!("manual".parse::<TriggeredBy>().unwrap(), TriggeredBy::Manual);
    }

    #[test]
    fn test_pr_state_progression() {
        assert!(PrState::Open.progressed_from(Some(PrState::Draft)));
        assert!(PrState::Merged.progressed_from(Some(PrState::Open)));
        assert!(PrState::Closed.progressed_from(Some(PrState::Draft)));
        assert!(PrState::Open.progressed_from(None));
        assert!(!PrState::Draft.progressed_from(None));
        assert!(!PrState::Draft.progressed_from(Some(PrState::Draft)));
        assert!(!PrState::Open.progressed_from(Some(PrState::Open)));
        assert!(!PrState::Merged.progressed_from(Some(PrState::Merged)));
    }

    #[test]
    fn test_known_and_unknown_agents_share_policy() {
        let known = AgentKind::for_slug("speckit.specify");
        assert!(matches!(known, AgentKind::Known(_)));
        assert_eq!(known.expected_outputs(), &["spec.md"]);

        let unknown = AgentKind::for_slug("my-custom-agent");
        assert!(matches!(unknown, AgentKind::Unknown(_)));
        assert!(unknown.expected_outputs().is_empty());

        assert!(unknown.is_completion_marker("my-custom-agent: Done!"));
        assert!(!unknown.is_completion_marker("speckit.plan: Done!"));
    }

    #[test]
    fn test_instructions_mention_outputs_and_marker() {
        let policy = AgentKind::for_slug("speckit.tasks");
        let text = policy.instructions(7, "Add OAuth2 flow");
        assert!(text.contains("#7"));
        assert!(text.contains("tasks.md"));
        assert!(text.contains("speckit.tasks: Done!"));

        let text = AgentKind::for_slug("speckit.implement").instructions(7, "x");
        assert!(!text.contains("Expected outputs"));
    }

    #[test]
    fn test_builtin_mappings_order() {
        let config = config();
        let ready: Vec<_> = config.agents_for("Ready").iter().map(|a| a.slug.as_str()).collect();
        assert_eq!(ready, vec!["speckit.plan", "speckit.tasks"]);
        assert_eq!(config.agents_for("in progress")[0].slug, "speckit.implement");
        assert!(config.agents_for("Done").is_empty());
        assert!(config.agents_for("Todo").is_empty());
    }

    #[test]
    fn test_column_aliases() {
        let mut config = config();
        config.status_ready = "Up Next".to_string();
        assert_eq!(config.column_for("up next"), Some(StatusColumn::Ready));
        assert_eq!(config.next_status("Backlog"), Some("Up Next"));
        assert_eq!(config.next_status("Up Next"), Some("In Progress"));
        assert_eq!(config.next_status("Done"), None);
        assert!(config.is_terminal("done"));
        assert_eq!(config.column_for("Todo"), None);
    }

    #[test]
    fn test_mappings_must_name_board_columns() {
        let mut mappings = builtin_agent_mappings();
        assert!(validate_mappings(&mappings, StatusColumn::from_default_name).is_ok());

        mappings.insert("QA".into(), vec![AgentAssignment::new("qa.agent")]);
        let err = validate_mappings(&mappings, StatusColumn::from_default_name).unwrap_err();
        assert!(err.contains("QA"));

        let mut config = config();
        config.status_ready = "Up Next".to_string();
        let mut renamed = AgentMappings::new();
        renamed.insert("up next".into(), vec![AgentAssignment::new("speckit.plan")]);
        assert!(validate_mappings(&renamed, |s| config.column_for(s)).is_ok());
        assert!(validate_mappings(&renamed, StatusColumn::from_default_name).is_err());

        let mut blank = AgentMappings::new();
        blank.insert("Ready".into(), vec![AgentAssignment::new(" ")]);
        assert!(validate_mappings(&blank, StatusColumn::from_default_name).is_err());
    }

    #[test]
    fn test_repository_ref_parse() {
        assert_eq!(
            RepositoryRef::parse("acme/widgets"),
            Some(RepositoryRef::new("acme", "widgets"))
        );
        assert_eq!(RepositoryRef::parse("acme"), None);
        assert_eq!(RepositoryRef::parse("acme/"), None);
        assert_eq!(RepositoryRef::parse("a/b/c"), None);
        assert_eq!(RepositoryRef::new("a", "b").to_string(), "a/b");
    }

    #[test]
    fn test_agent_assignment_deserialize_without_id() {
        let agent: AgentAssignment = serde_json::from_str(r#"{"slug": "speckit.plan"}"#).unwrap();
        assert_eq!(agent.slug, "speckit.plan");
        assert!(agent.display_name.is_none());
        assert!(agent.config.is_none());
    }

    #[test]
    fn test_failed_transition_carries_error() {
        let key = RunKey::new("PVT_1", 4);
        let t = WorkflowTransition::failed(&key, Some("Ready"), "In Progress", TriggeredBy::Automatic, "boom");
        assert!(!t.success);
        assert_eq!(t.error_message.as_deref(), Some("boom"));
        assert_eq!(t.issue_id, 4);
        assert!(t.assigned_user.is_none());
    }
}

//! Typed error hierarchy for agentboard.
//!
//! Two layers:
//! - `GitHubError` — a failed call against the GitHub capability, tagged with
//!   a [`GitHubErrorKind`] that drives retry and audit decisions
//! - `WorkflowError` — failures surfaced by configuration resolution and the
//!   transition engine

use std::time::Duration;

use thiserror::Error;

/// Classification of a GitHub call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitHubErrorKind {
    /// Rate limit, 5xx, timeout or connection failure. Retried with backoff,
    /// except timeouts, which wait for the next poll cycle.
    Transient,
    /// Any other 4xx, malformed identifiers, GraphQL errors, undecodable bodies.
    Permanent,
    /// The addressed issue, PR, project or field does not exist.
    NotFound,
}

impl GitHubErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::NotFound => "not_found",
        }
    }
}

/// A failed call against GitHub.
#[derive(Debug, Clone, Error)]
#[error("GitHub {operation} failed ({}): {message}", kind.as_str())]
pub struct GitHubError {
    pub kind: GitHubErrorKind,
    pub operation: String,
    pub message: String,
    pub status: Option<u16>,
    /// Server-requested delay from a `Retry-After` header, if any.
    pub retry_after: Option<Duration>,
    /// The request may have reached GitHub before the client gave up on it.
    pub timed_out: bool,
}

impl GitHubError {
    pub fn new(kind: GitHubErrorKind, operation: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.to_string(),
            message: message.into(),
            status: None,
            retry_after: None,
            timed_out: false,
        }
    }

    /// A call that got no answer in time. It is transient for the poll
    /// cycle but is not re-sent within it.
    pub fn timeout(operation: &str, message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::transient(operation, message)
        }
    }

    pub fn transient(operation: &str, message: impl Into<String>) -> Self {
        Self::new(GitHubErrorKind::Transient, operation, message)
    }

    pub fn permanent(operation: &str, message: impl Into<String>) -> Self {
        Self::new(GitHubErrorKind::Permanent, operation, message)
    }

    pub fn not_found(operation: &str, message: impl Into<String>) -> Self {
        Self::new(GitHubErrorKind::NotFound, operation, message)
    }

    /// Classify an HTTP status code returned by GitHub.
    pub fn from_status(operation: &str, status: u16, body: &str) -> Self {
        let kind = match status {
            429 | 500 | 502 | 503 | 504 => GitHubErrorKind::Transient,
            404 | 410 => GitHubErrorKind::NotFound,
            _ => GitHubErrorKind::Permanent,
        };
        Self {
            kind,
            operation: operation.to_string(),
            message: format!("status {}: {}", status, body),
            status: Some(status),
            retry_after: None,
            timed_out: false,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn kind(&self) -> GitHubErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == GitHubErrorKind::Transient
    }

    /// Whether the HTTP client may send the same request again right away.
    pub fn retries_in_loop(&self) -> bool {
        self.is_transient() && !self.timed_out
    }
}

pub type GitHubResult<T> = Result<T, GitHubError>;

/// Errors from configuration resolution and the transition engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Configuration error for project {project_id}: {message}")]
    Configuration { project_id: String, message: String },

    #[error("Unknown status '{status}' for project {project_id}")]
    UnknownStatus { project_id: String, status: String },

    #[error("Issue #{issue_number} is not an item of project {project_id}")]
    IssueNotOnProject {
        project_id: String,
        issue_number: u64,
    },

    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl WorkflowError {
    pub fn configuration(project_id: &str, message: impl Into<String>) -> Self {
        Self::Configuration {
            project_id: project_id.to_string(),
            message: message.into(),
        }
    }

    /// Configuration errors are not worth retrying until settings change.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::UnknownStatus { .. })
    }

    /// Failures that will not clear up by polling again. A run that hits one
    /// stays parked until an operator moves it or its project settings change.
    pub fn blocks_run(&self) -> bool {
        match self {
            Self::Configuration { .. } | Self::UnknownStatus { .. } => true,
            Self::IssueNotOnProject { .. } => true,
            Self::GitHub(e) => !e.is_transient(),
            Self::Storage(_) => false,
        }
    }
}

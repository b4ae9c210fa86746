//! Decides whether the agent currently assigned to an issue has finished.
//!
//! Three independent signals, checked in order:
//! 1. a finished marker on the issue or PR timeline after assignment,
//! 2. the main PR progressed (left draft, merged or closed),
//! 3. the agent unassigned itself *and* pushed: the PR head SHA must differ
//!    from the one recorded at assignment.
//!
//! Only signal 3 carries the SHA veto. Evaluation is a pure function of its
//! inputs, so repeated polls over the same snapshots give the same answer.

use serde::Serialize;

use super::github::{
    IssueSnapshot, PullRequestSnapshot, TimelineEvent, TimelineEventKind, login_matches,
};
use super::models::{AgentKind, AgentOutputPolicy, PipelineRunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSignal {
    FinishedMarker,
    PullRequestStateChange,
    AgentUnassigned,
}

impl CompletionSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FinishedMarker => "finished_marker",
            Self::PullRequestStateChange => "pull_request_state_change",
            Self::AgentUnassigned => "agent_unassigned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Complete(CompletionSignal),
    Pending,
    /// The agent dropped off the issue but left the PR head untouched.
    FalsePositive,
}

pub struct DetectionInput<'a> {
    pub run: &'a PipelineRunState,
    pub issue: &'a IssueSnapshot,
    pub pull_request: Option<&'a PullRequestSnapshot>,
    pub agent_still_assigned: bool,
    /// Account the agent works under; `copilot_work_finished` events from
    /// anyone else are ignored.
    pub agent_login: &'a str,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CompletionDetector;

impl CompletionDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn is_complete(&self, input: &DetectionInput<'_>) -> bool {
        matches!(self.evaluate(input), Detection::Complete(_))
    }

    pub fn evaluate(&self, input: &DetectionInput<'_>) -> Detection {
        let run = input.run;
        let policy = AgentKind::for_slug(&run.current_agent_slug);

        if self.finished_marker(input, &policy) {
            return Detection::Complete(CompletionSignal::FinishedMarker);
        }

        if let Some(pr) = input.pull_request.filter(|pr| is_main_pull_request(run, pr))
            && pr.state.progressed_from(run.assigned_pr_state)
        {
            return Detection::Complete(CompletionSignal::PullRequestStateChange);
        }

        if input.agent_still_assigned {
            return Detection::Pending;
        }

        match input.pull_request {
            Some(pr) if run.agent_assigned_sha.as_deref() != Some(pr.head_sha.as_str()) => {
                Detection::Complete(CompletionSignal::AgentUnassigned)
            }
            Some(pr) => {
                tracing::debug!(
                    project_id = %run.project_id,
                    issue_number = run.issue_number,
                    agent = %run.current_agent_slug,
                    head_sha = %pr.head_sha,
                    "Agent unassigned without new commits; not treating as complete"
                );
                Detection::FalsePositive
            }
            None => {
                tracing::debug!(
                    project_id = %run.project_id,
                    issue_number = run.issue_number,
                    agent = %run.current_agent_slug,
                    "Agent unassigned but no pull request exists; not treating as complete"
                );
                Detection::FalsePositive
            }
        }
    }

    fn finished_marker(&self, input: &DetectionInput<'_>, policy: &AgentKind) -> bool {
        let since = input.run.agent_assigned_at;
        let pr_events = input
            .pull_request
            .map(|pr| pr.timeline.as_slice())
            .unwrap_or(&[]);
        input
            .issue
            .timeline
            .iter()
            .chain(pr_events)
            .filter(|e| e.created_at > since)
            .any(|e| marks_finished(e, policy, input.agent_login))
    }
}

fn marks_finished(event: &TimelineEvent, policy: &AgentKind, agent_login: &str) -> bool {
    match event.kind {
        TimelineEventKind::CopilotWorkFinished => event
            .actor
            .as_deref()
            .is_some_and(|actor| login_matches(actor, agent_login)),
        TimelineEventKind::Commented => event
            .body
            .as_deref()
            .is_some_and(|body| policy.is_completion_marker(body)),
        _ => false,
    }
}

fn is_main_pull_request(run: &PipelineRunState, pr: &PullRequestSnapshot) -> bool {
    run.main_pr_number.is_none_or(|n| n == pr.number)
        && run.main_branch.as_deref().is_none_or(|b| b == pr.head_ref)
}

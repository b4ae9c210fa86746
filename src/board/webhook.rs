//! GitHub webhook intake: signature verification and event classification.
//!
//! Webhooks never drive transitions directly. A verified event is reduced to
//! a [`WebhookTarget`], matched against tracked runs, and turned into
//! [`Nudge`]s for the poller task.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use super::models::PipelineRunState;
use super::poller::Nudge;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

fn keyed_mac(secret: &str, body: &[u8]) -> Option<HmacSha256> {
    // HMAC takes keys of any length.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(mac)
}

/// `sha256=<hex>` as GitHub sends it.
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let digest = keyed_mac(secret, body)
        .map(|mac| hex::encode(mac.finalize().into_bytes()))
        .unwrap_or_default();
    format!("{}{}", SIGNATURE_PREFIX, digest)
}

/// Check an `X-Hub-Signature-256` header value against the body. The
/// comparison runs in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(received) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(received) = hex::decode(received) else {
        return false;
    };
    keyed_mac(secret, body).is_some_and(|mac| mac.verify_slice(&received).is_ok())
}

/// What a webhook event points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookTarget {
    Issue(u64),
    PullRequest(u64),
}

impl WebhookTarget {
    pub fn matches(&self, run: &PipelineRunState) -> bool {
        match *self {
            Self::Issue(n) => run.issue_number == n,
            Self::PullRequest(n) => run.main_pr_number == Some(n) || run.issue_number == n,
        }
    }
}

/// Classify an event. Unsupported events (including `ping`) yield `None`.
pub fn parse_event(event: &str, payload: &Value) -> Option<WebhookTarget> {
    match event {
        "issues" => number_at(payload, "issue").map(WebhookTarget::Issue),
        "issue_comment" => {
            let number = number_at(payload, "issue")?;
            // Comments on PRs arrive as issue_comment with a pull_request link.
            if payload["issue"].get("pull_request").is_some() {
                Some(WebhookTarget::PullRequest(number))
            } else {
                Some(WebhookTarget::Issue(number))
            }
        }
        "pull_request" | "pull_request_review" => {
            number_at(payload, "pull_request").map(WebhookTarget::PullRequest)
        }
        _ => None,
    }
}

fn number_at(payload: &Value, object: &str) -> Option<u64> {
    payload.get(object)?.get("number")?.as_u64()
}

/// Turn a target into nudges. Tracked runs are nudged directly. A plain issue
/// event for an untracked issue nudges every enabled project so the poller
/// can discover it; untracked pull requests are ignored.
pub fn nudges_for(
    target: WebhookTarget,
    runs: &[PipelineRunState],
    enabled_projects: &[String],
) -> Vec<Nudge> {
    let tracked: Vec<Nudge> = runs
        .iter()
        .filter(|r| target.matches(r))
        .map(|r| Nudge {
            project_id: r.project_id.clone(),
            issue_number: r.issue_number,
        })
        .collect();
    if !tracked.is_empty() {
        return tracked;
    }
    match target {
        WebhookTarget::Issue(n) => enabled_projects
            .iter()
            .map(|p| Nudge {
                project_id: p.clone(),
                issue_number: n,
            })
            .collect(),
        WebhookTarget::PullRequest(_) => Vec::new(),
    }
}

//! Live event feed. Every engine event is pushed to every connected client
//! as JSON; nothing a client sends is acted on.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::api::AppState;
use super::models::{PipelineRunState, WorkflowTransition};

// ── Event types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    PipelineStarted {
        run: PipelineRunState,
    },
    /// Next agent within the same column.
    AgentAssigned {
        project_id: String,
        issue_number: u64,
        agent: String,
        status_index: usize,
    },
    StatusChanged {
        transition: WorkflowTransition,
    },
    TransitionFailed {
        transition: WorkflowTransition,
    },
    PipelineFinished {
        project_id: String,
        issue_number: u64,
        final_status: String,
    },
    /// Automatic processing stopped until an operator steps in.
    PipelineBlocked {
        project_id: String,
        issue_number: u64,
        reason: String,
    },
    IssueCreated {
        project_id: String,
        issue_number: u64,
        html_url: String,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let events = state.ws_tx.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, events))
}

async fn stream_events(mut socket: WebSocket, mut events: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(json) => {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event feed client fell behind, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast an event to all connected clients. Having no
/// subscribers is not an error.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &WsMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize WsMessage");
        }
    }
}

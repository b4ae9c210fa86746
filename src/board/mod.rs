//! Board orchestration: assigns coding agents to GitHub Projects items per
//! status column and advances issues as agents finish.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐  HTTP/WS  ┌─────────────────────────────────────────────────┐
//! │ Operator │ ────────> │  server.rs  (axum Router, ServerConfig)         │
//! │ / GitHub │ <──────── │    └─ api.rs  (handlers, AppState, webhooks)    │
//! └──────────┘           │         │ nudge                                 │
//!                        │         v                                       │
//!                        │  poller.rs  (Poller, PollerHandle)              │
//!                        │         │ process_issue() per tracked run       │
//!                        │         v                                       │
//!                        │  engine.rs  (TransitionEngine)                  │
//!                        │    ├─ detector.rs  (CompletionDetector)         │
//!                        │    ├─ tracker.rs   (PipelineTracker)            │
//!                        │    ├─ config_store.rs (WorkflowConfigStore)     │
//!                        │    └─ github.rs    (GitHubClient trait + HTTP)  │
//!                        └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                            |
//! |------------|-----------------------------------------------------------|
//! | `models`   | Shared types: `WorkflowConfiguration`, `PipelineRunState` |
//! | `db`       | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)       |
//! | `retry`    | `RetryConfig` backoff for transient GitHub failures       |
//! | `auth`     | `ExpiringStore` for pending OAuth device codes            |
//! | `webhook`  | HMAC verification, event → `Nudge` mapping                |
//! | `ws`       | `WsMessage` enum + `broadcast_message()` helper           |
//!
//! ## One Poll Cycle
//!
//! 1. `Poller` lists tracked runs for enabled projects, ordered by project
//!    then issue number.
//! 2. For each, `TransitionEngine::process_issue()` fetches the issue, its
//!    linked PR and the agent assignment, and asks the detector whether the
//!    current agent is done.
//! 3. Done with agents left in the column: the next agent is assigned and the
//!    tracker advances. Done with the column exhausted: the item moves to the
//!    next status, the first agent there is assigned, and an audit row is
//!    written.
//! 4. Discovery then starts pipelines for items sitting in a mapped column
//!    that nobody tracks yet.

pub mod api;
pub mod auth;
pub mod config_store;
pub mod db;
pub mod detector;
pub mod engine;
pub mod github;
pub mod models;
pub mod poller;
pub mod retry;
pub mod server;
#[cfg(test)]
pub mod testing;
pub mod tracker;
pub mod webhook;
pub mod ws;

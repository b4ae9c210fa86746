//! Polling loop. Polling is the source of truth; webhook nudges only make
//! a specific issue get looked at sooner.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::engine::{ProcessOutcome, TransitionEngine};
use super::models::{RunKey, TriggeredBy};
use crate::errors::WorkflowError;

const NUDGE_BUFFER: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub processed: usize,
    pub agents_advanced: usize,
    pub status_transitions: usize,
    pub finished: usize,
    pub waiting: usize,
    pub blocked: usize,
    pub failed: usize,
    pub discovered: usize,
    pub cancelled: bool,
    pub last_error: Option<String>,
}

impl PollReport {
    fn tally(&mut self, outcome: &ProcessOutcome) {
        self.processed += 1;
        match outcome {
            ProcessOutcome::Untracked => {}
            ProcessOutcome::Waiting => self.waiting += 1,
            ProcessOutcome::Blocked { .. } => self.blocked += 1,
            ProcessOutcome::AgentAdvanced { .. } => self.agents_advanced += 1,
            ProcessOutcome::StatusAdvanced { .. } => self.status_transitions += 1,
            ProcessOutcome::PipelineFinished { .. } => self.finished += 1,
        }
    }

    fn record_error(&mut self, key: &RunKey, err: &WorkflowError) {
        self.failed += 1;
        self.last_error = Some(format!("{}: {}", key, err));
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerStatus {
    pub running: bool,
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<PollReport>,
}

/// Request to look at one issue right away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nudge {
    pub project_id: String,
    pub issue_number: u64,
}

pub struct Poller {
    engine: Arc<TransitionEngine>,
    interval: Duration,
}

impl Poller {
    pub fn new(engine: Arc<TransitionEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    fn is_enabled(&self, project_id: &str) -> bool {
        self.engine
            .configs()
            .enabled_projects()
            .iter()
            .any(|p| p == project_id)
    }

    /// One full cycle: every tracked issue of every enabled project, in
    /// project/issue order, then discovery of new work. Errors are per
    /// issue and never abort the cycle.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> PollReport {
        let mut report = PollReport::default();

        for run in self.engine.tracker().list().await {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            if !self.is_enabled(&run.project_id) {
                continue;
            }
            let key = run.key();
            match self.engine.process_issue(&key, TriggeredBy::Automatic).await {
                Ok(outcome) => report.tally(&outcome),
                Err(e) => {
                    log_failure(&key, &e);
                    report.record_error(&key, &e);
                }
            }
        }

        for project_id in self.engine.configs().enabled_projects() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return report;
            }
            match self.engine.discover(project_id).await {
                Ok(started) => report.discovered += started,
                Err(e) => {
                    tracing::warn!(project_id = %project_id, error = %e, "Discovery failed");
                    report.failed += 1;
                    report.last_error = Some(format!("{}: {}", project_id, e));
                }
            }
        }

        tracing::debug!(
            processed = report.processed,
            status_transitions = report.status_transitions,
            failed = report.failed,
            discovered = report.discovered,
            "Poll cycle complete"
        );
        report
    }

    /// Process one issue on behalf of a webhook. Untracked issues trigger
    /// discovery for their project instead.
    pub async fn handle_nudge(&self, nudge: &Nudge) -> Result<ProcessOutcome, WorkflowError> {
        if !self.is_enabled(&nudge.project_id) {
            return Ok(ProcessOutcome::Untracked);
        }
        let key = RunKey::new(&nudge.project_id, nudge.issue_number);
        let outcome = self.engine.process_issue(&key, TriggeredBy::Detection).await?;
        if outcome == ProcessOutcome::Untracked {
            self.engine.discover(&nudge.project_id).await?;
        }
        Ok(outcome)
    }
}

fn log_failure(key: &RunKey, err: &WorkflowError) {
    match err {
        WorkflowError::GitHub(e) if e.is_transient() => tracing::warn!(
            project_id = %key.project_id,
            issue_number = key.issue_number,
            error = %err,
            "Transient failure, will retry next cycle"
        ),
        e if e.is_configuration() => tracing::warn!(
            project_id = %key.project_id,
            issue_number = key.issue_number,
            error = %err,
            "Configuration problem, skipping until settings change"
        ),
        _ => tracing::error!(
            project_id = %key.project_id,
            issue_number = key.issue_number,
            error = %err,
            "Failed to process issue"
        ),
    }
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<mpsc::Receiver<Nudge>>,
}

/// Supervises the poller task.
pub struct PollerHandle {
    poller: Arc<Poller>,
    status: Arc<RwLock<PollerStatus>>,
    nudge_tx: mpsc::Sender<Nudge>,
    nudge_rx: Mutex<Option<mpsc::Receiver<Nudge>>>,
    task: Mutex<Option<RunningTask>>,
}

impl PollerHandle {
    pub fn new(poller: Poller) -> Self {
        let (nudge_tx, nudge_rx) = mpsc::channel(NUDGE_BUFFER);
        Self {
            poller: Arc::new(poller),
            status: Arc::new(RwLock::new(PollerStatus::default())),
            nudge_tx,
            nudge_rx: Mutex::new(Some(nudge_rx)),
            task: Mutex::new(None),
        }
    }

    /// Spawn the loop. Returns `false` if it is already running.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return false;
        }
        let Some(nudges) = self.nudge_rx.lock().await.take() else {
            return false;
        };
        let cancel = CancellationToken::new();
        self.status.write().await.running = true;
        let handle = tokio::spawn(run_loop(
            self.poller.clone(),
            self.status.clone(),
            nudges,
            cancel.clone(),
        ));
        *task = Some(RunningTask { cancel, handle });
        true
    }

    /// Cancel and wait for the loop. An issue being processed is finished first.
    pub async fn stop(&self) {
        let Some(running) = self.task.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        match running.handle.await {
            Ok(nudges) => *self.nudge_rx.lock().await = Some(nudges),
            Err(e) => tracing::error!(error = %e, "Poller task panicked"),
        }
        self.status.write().await.running = false;
    }

    pub async fn status(&self) -> PollerStatus {
        self.status.read().await.clone()
    }

    /// Queue a nudge. Returns `false` when the queue is full.
    pub fn nudge(&self, nudge: Nudge) -> bool {
        match self.nudge_tx.try_send(nudge) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping webhook nudge");
                false
            }
        }
    }

    /// Run a single cycle in the caller's task.
    pub async fn run_once(&self) -> PollReport {
        let report = self.poller.poll_once(&CancellationToken::new()).await;
        record_cycle(&self.status, &report).await;
        report
    }
}

async fn record_cycle(status: &RwLock<PollerStatus>, report: &PollReport) {
    let mut status = status.write().await;
    status.cycles += 1;
    status.last_cycle_at = Some(Utc::now());
    status.last_error = report.last_error.clone();
    status.last_report = Some(report.clone());
}

async fn run_loop(
    poller: Arc<Poller>,
    status: Arc<RwLock<PollerStatus>>,
    mut nudges: mpsc::Receiver<Nudge>,
    cancel: CancellationToken,
) -> mpsc::Receiver<Nudge> {
    let mut ticker = tokio::time::interval(poller.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(interval_secs = poller.interval.as_secs(), "Poller started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(nudge) = nudges.recv() => {
                match poller.handle_nudge(&nudge).await {
                    Ok(outcome) => tracing::debug!(
                        project_id = %nudge.project_id,
                        issue_number = nudge.issue_number,
                        ?outcome,
                        "Processed nudge"
                    ),
                    Err(e) => log_failure(&RunKey::new(&nudge.project_id, nudge.issue_number), &e),
                }
            }
            _ = ticker.tick() => {
                let report = poller.poll_once(&cancel).await;
                record_cycle(&status, &report).await;
            }
        }
    }

    tracing::info!("Poller stopped");
    nudges
}

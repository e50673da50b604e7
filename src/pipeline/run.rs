// pipeline/run.rs
// Run record and progress state machine for one analysis

use crate::error::PipelineError;
use crate::pipeline::embed::{BatchPhase, BatchProgress};
use crate::pipeline::orchestrator::AnalysisResult;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const TOTAL_STEPS: usize = 4;

/// Lifecycle of a run:
/// `pending -> embedding -> indexing -> clustering -> scoring -> completed`,
/// with `failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Embedding,
    Indexing,
    Clustering,
    Scoring,
    Completed,
    Failed,
}

impl RunStatus {
    /// The forward successor, if any
    pub fn next(self) -> Option<RunStatus> {
        match self {
            RunStatus::Pending => Some(RunStatus::Embedding),
            RunStatus::Embedding => Some(RunStatus::Indexing),
            RunStatus::Indexing => Some(RunStatus::Clustering),
            RunStatus::Clustering => Some(RunStatus::Scoring),
            RunStatus::Scoring => Some(RunStatus::Completed),
            RunStatus::Completed | RunStatus::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_transition_to(self, to: RunStatus) -> bool {
        self.next() == Some(to) || (to == RunStatus::Failed && !self.is_terminal())
    }

    /// 1-based stage number; `failed` has none of its own
    fn step(self) -> Option<usize> {
        match self {
            RunStatus::Pending => Some(0),
            RunStatus::Embedding => Some(1),
            RunStatus::Indexing => Some(2),
            RunStatus::Clustering => Some(3),
            RunStatus::Scoring | RunStatus::Completed => Some(4),
            RunStatus::Failed => None,
        }
    }

    /// Checkpoint reached on entering this state
    fn percentage(self) -> Option<f32> {
        match self {
            RunStatus::Pending | RunStatus::Embedding => Some(0.0),
            RunStatus::Indexing => Some(25.0),
            RunStatus::Clustering => Some(50.0),
            RunStatus::Scoring => Some(75.0),
            RunStatus::Completed => Some(100.0),
            RunStatus::Failed => None,
        }
    }

    pub fn step_name(self) -> &'static str {
        match self {
            RunStatus::Pending => "Waiting to start",
            RunStatus::Embedding => "Generating embeddings",
            RunStatus::Indexing => "Computing semantic neighbors",
            RunStatus::Clustering => "Clustering pages",
            RunStatus::Scoring => "Scoring proximity anomalies",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot move a run from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// What progress consumers see
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub status: RunStatus,
    pub step: usize,
    pub total_steps: usize,
    pub step_name: String,
    pub percentage: f32,
    pub message: String,
    /// Set once the run has failed
    pub error: Option<String>,
    /// Latest embedding batch event while embedding
    pub batch: Option<BatchProgress>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    fn pending() -> Self {
        Self {
            status: RunStatus::Pending,
            step: 0,
            total_steps: TOTAL_STEPS,
            step_name: RunStatus::Pending.step_name().to_string(),
            percentage: 0.0,
            message: "Queued".to_string(),
            error: None,
            batch: None,
            updated_at: Utc::now(),
        }
    }
}

/// The single mutable record of an analysis; changed only through transitions
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub project_id: String,
    progress: ProgressRecord,
    result: Option<Arc<AnalysisResult>>,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            progress: ProgressRecord::pending(),
            result: None,
            started_at: Utc::now(),
        }
    }

    pub fn status(&self) -> RunStatus {
        self.progress.status
    }

    pub fn progress(&self) -> &ProgressRecord {
        &self.progress
    }

    pub fn result(&self) -> Option<&Arc<AnalysisResult>> {
        self.result.as_ref()
    }

    /// Move to a stage state; `completed` and `failed` have their own entry points
    pub fn transition(&mut self, to: RunStatus, message: impl Into<String>) -> Result<(), TransitionError> {
        let from = self.progress.status;
        if to.is_terminal() || !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }
        self.apply(to, message.into());
        Ok(())
    }

    /// Attach the final result and finish
    pub fn complete(&mut self, result: Arc<AnalysisResult>) -> Result<(), TransitionError> {
        let from = self.progress.status;
        if !from.can_transition_to(RunStatus::Completed) {
            return Err(TransitionError {
                from,
                to: RunStatus::Completed,
            });
        }
        let message = format!(
            "Analysis finished: {} pages, {} clusters, {} anomalies",
            result.total_pages,
            result.clusters.len(),
            result.proximities.len()
        );
        self.result = Some(result);
        self.apply(RunStatus::Completed, message);
        Ok(())
    }

    /// Enter `failed`, keeping the last reached step and percentage
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        let from = self.progress.status;
        if !from.can_transition_to(RunStatus::Failed) {
            return Err(TransitionError {
                from,
                to: RunStatus::Failed,
            });
        }
        let error = error.into();
        self.progress.status = RunStatus::Failed;
        self.progress.step_name = RunStatus::Failed.step_name().to_string();
        self.progress.message = format!("Error: {}", error);
        self.progress.error = Some(error);
        self.progress.updated_at = Utc::now();
        Ok(())
    }

    /// Record an embedding batch event; ignored outside the embedding stage
    pub fn record_batch(&mut self, batch: BatchProgress) {
        if self.progress.status != RunStatus::Embedding {
            return;
        }
        self.progress.message = match batch.phase {
            BatchPhase::Started => format!(
                "Embedding batch {}/{} ({}/{} pages done)",
                batch.batch_index, batch.batch_count, batch.pages_completed, batch.pages_total
            ),
            BatchPhase::Finished => format!(
                "Batch {}/{} done ({}/{} pages)",
                batch.batch_index, batch.batch_count, batch.pages_completed, batch.pages_total
            ),
        };
        self.progress.batch = Some(batch);
        self.progress.updated_at = Utc::now();
    }

    fn apply(&mut self, to: RunStatus, message: String) {
        let progress = &mut self.progress;
        progress.status = to;
        progress.step = to.step().unwrap_or(progress.step);
        progress.percentage = to.percentage().unwrap_or(progress.percentage);
        progress.step_name = to.step_name().to_string();
        progress.message = message;
        if to != RunStatus::Embedding {
            progress.batch = None;
        }
        progress.updated_at = Utc::now();
    }
}

/// Shared handle to a run: the orchestrator writes, pollers read snapshots.
pub struct RunHandle {
    run: RwLock<PipelineRun>,
    cancel: AtomicBool,
    status_tx: watch::Sender<RunStatus>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run = self.run.read();
        f.debug_struct("RunHandle")
            .field("project_id", &run.project_id)
            .field("status", &run.status())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

impl RunHandle {
    pub fn new(project_id: impl Into<String>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(RunStatus::Pending);
        Arc::new(Self {
            run: RwLock::new(PipelineRun::new(project_id)),
            cancel: AtomicBool::new(false),
            status_tx,
        })
    }

    pub fn project_id(&self) -> String {
        self.run.read().project_id.clone()
    }

    /// Consistent copy of the progress record
    pub fn snapshot(&self) -> ProgressRecord {
        self.run.read().progress.clone()
    }

    pub fn status(&self) -> RunStatus {
        self.run.read().status()
    }

    pub fn result(&self) -> Option<Arc<AnalysisResult>> {
        self.run.read().result().cloned()
    }

    pub fn enter(&self, to: RunStatus, message: impl Into<String>) -> Result<(), TransitionError> {
        let message = message.into();
        self.run.write().transition(to, message.clone())?;
        info!("[{}] {}: {}", self.project_id(), to.step_name(), message);
        self.status_tx.send_replace(to);
        Ok(())
    }

    pub fn report_batch(&self, batch: BatchProgress) {
        self.run.write().record_batch(batch);
    }

    pub fn complete(&self, result: Arc<AnalysisResult>) -> Result<(), TransitionError> {
        self.run.write().complete(result)?;
        self.status_tx.send_replace(RunStatus::Completed);
        Ok(())
    }

    /// Mark the run failed; a run that already finished is left alone
    pub fn fail(&self, err: &PipelineError) {
        let outcome = self.run.write().fail(err.to_string());
        match outcome {
            Ok(()) => {
                error!("[{}] Analysis failed: {}", self.project_id(), err);
                self.status_tx.send_replace(RunStatus::Failed);
            }
            Err(e) => warn!("[{}] Ignoring late failure ({}): {}", self.project_id(), e, err),
        }
    }

    /// Ask the run to stop before its next stage or batch
    pub fn revoke(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    /// Resolve once the run reaches a terminal state
    pub async fn wait(&self) -> RunStatus {
        let mut rx = self.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }
}

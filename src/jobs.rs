//! Background analysis jobs
//!
//! A registry owns one run handle per project. Starting a job spawns the
//! analyzer on the tokio runtime and returns immediately; callers poll the
//! progress record or await the handle. Jobs can also be described by a
//! JSON request passed through the environment or stdin.

use crate::error::PipelineError;
use crate::pipeline::artifact::{check_project_id, ANALYSIS_FILE};
use crate::pipeline::ingest::{load_edges, load_pages, PageSet};
use crate::pipeline::orchestrator::{AnalysisResult, Analyzer};
use crate::pipeline::run::{ProgressRecord, RunHandle, RunStatus};
use crate::pipeline::score::AnalysisSummary;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("project {project_id} already has an active run ({status:?})")]
    AlreadyActive {
        project_id: String,
        status: RunStatus,
    },

    #[error("no run recorded for project {0}")]
    NotFound(String),

    #[error("invalid job request: {0}")]
    Request(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Job description read from `ANALYSIS_JOB` or stdin
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub project_id: String,
    pub pages_path: PathBuf,
    #[serde(default)]
    pub edges_path: Option<PathBuf>,
}

impl JobRequest {
    /// Load and validate the page and edge files the request points at
    pub fn load(&self) -> Result<PageSet, JobError> {
        let pages = load_pages(&self.pages_path)?;
        let edges = match &self.edges_path {
            Some(path) => load_edges(path)?,
            None => Vec::new(),
        };
        Ok(PageSet::new(pages, edges)?)
    }
}

/// Status document printed when a job finishes
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub success: bool,
    pub project_id: String,
    pub progress: ProgressRecord,
    pub summary: Option<AnalysisSummary>,
    pub error: Option<String>,
}

impl JobStatusResponse {
    pub fn from_handle(handle: &RunHandle) -> Self {
        let progress = handle.snapshot();
        let result = handle.result();
        Self {
            success: progress.status == RunStatus::Completed,
            project_id: handle.project_id(),
            summary: result.map(|r| r.summary.clone()),
            error: progress.error.clone(),
            progress,
        }
    }
}

/// Read a job request: `ANALYSIS_JOB` first, then stdin
pub fn read_job_request() -> Result<JobRequest, JobError> {
    let input_json = env::var("ANALYSIS_JOB")
        .or_else(|_| {
            use std::io::Read;
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .map(|_| input)
                .map_err(|e| e.to_string())
        })
        .map_err(|_| JobError::Request("set ANALYSIS_JOB or pipe JSON to stdin".to_string()))?;

    serde_json::from_str(&input_json).map_err(|e| JobError::Request(e.to_string()))
}

/// Tracks runs per project and executes them in the background
pub struct JobRegistry {
    analyzer: Arc<Analyzer>,
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
}

impl JobRegistry {
    pub fn new(analyzer: Analyzer) -> Self {
        Self {
            analyzer: Arc::new(analyzer),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Spawn a run for `project_id`.
    ///
    /// Must be called from within a tokio runtime. Ids that are not a single
    /// path segment are rejected. A finished run for the same project is
    /// replaced; an active one is left running and the request is rejected.
    pub fn start(&self, project_id: &str, pages: PageSet) -> Result<Arc<RunHandle>, JobError> {
        check_project_id(project_id)?;
        let handle = {
            let mut runs = self.runs.write();
            if let Some(existing) = runs.get(project_id) {
                let status = existing.status();
                if !status.is_terminal() {
                    return Err(JobError::AlreadyActive {
                        project_id: project_id.to_string(),
                        status,
                    });
                }
            }
            let handle = RunHandle::new(project_id);
            runs.insert(project_id.to_string(), handle.clone());
            handle
        };

        info!("[{}] Queued analysis of {} pages", project_id, pages.len());

        let analyzer = self.analyzer.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            // Failures are recorded on the handle
            let _ = analyzer.run(pages, &task_handle).await;
        });

        Ok(handle)
    }

    pub fn handle(&self, project_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.read().get(project_id).cloned()
    }

    pub fn progress(&self, project_id: &str) -> Result<ProgressRecord, JobError> {
        self.handle(project_id)
            .map(|h| h.snapshot())
            .ok_or_else(|| JobError::NotFound(project_id.to_string()))
    }

    /// Result of a completed run, falling back to the persisted document
    pub fn result(&self, project_id: &str) -> Result<Option<Arc<AnalysisResult>>, JobError> {
        if let Some(handle) = self.handle(project_id) {
            return Ok(handle.result());
        }
        let stored: Option<AnalysisResult> = self.analyzer.store().load_json(project_id, ANALYSIS_FILE)?;
        match stored {
            Some(result) => Ok(Some(Arc::new(result))),
            None => Err(JobError::NotFound(project_id.to_string())),
        }
    }

    /// Mark the active run revoked; it stops before its next stage or batch
    pub fn revoke(&self, project_id: &str) -> Result<(), JobError> {
        let handle = self
            .handle(project_id)
            .ok_or_else(|| JobError::NotFound(project_id.to_string()))?;
        if handle.status().is_terminal() {
            warn!("[{}] Revoke ignored, run already {:?}", project_id, handle.status());
        } else {
            info!("[{}] Revoking run", project_id);
            handle.revoke();
        }
        Ok(())
    }

    /// Await the terminal status of the project's run
    pub async fn wait(&self, project_id: &str) -> Result<RunStatus, JobError> {
        let handle = self
            .handle(project_id)
            .ok_or_else(|| JobError::NotFound(project_id.to_string()))?;
        Ok(handle.wait().await)
    }
}

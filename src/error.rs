// error.rs
// Error taxonomy shared by every pipeline phase

use crate::pipeline::run::TransitionError;
use thiserror::Error;

/// Result alias for pipeline-level operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Top-level failure of an analysis run.
///
/// `Input` and `Provider` are the two failures a caller is expected to see;
/// the remaining variants cover persistence and runtime plumbing.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or missing upstream data, detected before any stage starts
    #[error("invalid input: {0}")]
    Input(String),

    /// The vectorization provider failed, timed out or broke protocol
    #[error("embedding provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The run was revoked before the named stage could start
    #[error("run cancelled before {stage}")]
    Cancelled { stage: &'static str },

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// A blocking worker panicked or was aborted
    #[error("worker task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Task(err.to_string())
    }
}

/// Failure of a single call to the vectorization provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// The provider answered with a non-success status
    #[error("provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("could not decode provider response: {0}")]
    Decode(String),

    /// One vector per submitted item is part of the provider contract
    #[error("provider returned {got} vectors for {expected} items")]
    CountMismatch { expected: usize, got: usize },

    #[error("vector {index} has {got} dimensions, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
}

impl ProviderError {
    /// Short machine-readable kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Rejected { .. } => "rejected",
            ProviderError::Transport(_) => "transport",
            ProviderError::Decode(_) => "decode",
            ProviderError::CountMismatch { .. } | ProviderError::DimensionMismatch { .. } => {
                "protocol"
            }
        }
    }
}

/// A clustering or projection method could not produce an answer.
///
/// Never surfaced as a run failure; the clustering engine selects a fallback.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AlgorithmError {
    #[error("need at least {needed} points, got {got}")]
    TooFewPoints { needed: usize, got: usize },

    #[error("density clustering failed: {0}")]
    Density(String),

    #[error("manifold reduction failed: {0}")]
    Reduction(String),

    #[error("centroid clustering failed: {0}")]
    Centroid(String),

    #[error("linear projection failed: {0}")]
    Linear(String),

    #[error("{0} produced non-finite coordinates")]
    NonFinite(&'static str),
}

/// The neighbor index refused an insertion.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndexError {
    #[error("index holds {expected}-dim vectors, got {got}-dim rows")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Invalid environment configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}={value} is not a valid value: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

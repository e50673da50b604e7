// lib.rs
// Semantic proximity analysis of a crawled site: which pages read alike but sit far apart in the link graph

pub mod config;
pub mod error;
pub mod graph;
pub mod jobs;
pub mod pipeline;
pub mod provider;

pub use config::Settings;
pub use error::{PipelineError, Result};
pub use jobs::{JobError, JobRegistry};
pub use pipeline::{AnalysisResult, Analyzer, RunStatus};

// Pipeline module declarations
// Each phase is a separate module; the orchestrator sequences them

pub mod ingest;       // Phase 0: Load pages and link edges
pub mod embed;        // Phase 1: Batched embeddings via the provider
pub mod index;        // Phase 2: Semantic nearest neighbors
pub mod reduce;       // Manifold and linear reductions used by clustering
pub mod cluster;      // Phase 3: Clustering and 2-D projection
pub mod score;        // Phase 4: Proximity anomalies and coherence
pub mod artifact;     // Persisted embeddings and result documents
pub mod run;          // Run record and progress state machine
pub mod orchestrator; // Stage sequencing

pub use orchestrator::{AnalysisResult, Analyzer};
pub use run::{ProgressRecord, RunHandle, RunStatus};

//! Pipeline orchestration for binder design jobs.
//!
//! The [`PipelineController`] sequences [`StageDefinition`]s, fans each
//! stage out over the artifacts of the previous one, ranks the final
//! artifacts by confidence and publishes the top-K, recording the job's
//! lifecycle through a [`StatusReporter`].

pub mod config;
pub mod controller;
pub mod duration_serde;
pub mod events;
pub mod publish;
pub mod retry;
pub mod scorer;
pub mod selector;
pub mod stage;
pub mod status;
pub mod transfer;

pub use config::{load_stages, DesignParameters, JobDescriptor, PipelineConfig, ToolPaths};
pub use controller::{PipelineController, PipelineResult};
pub use events::{EventEmitter, PipelineEvent};
pub use publish::{
    materialize, name_results, MetricsDocument, ResultsSummary, ScoreEntry, SelectedResult,
};
pub use retry::{execute_with_retry, BackoffPolicy};
pub use scorer::{ConfidenceScorer, RemarkConfidenceScorer};
pub use selector::{rank, select_top_k};
pub use stage::{FanOut, PlannedInvocation, StageDefinition, StagePlan, StageReport, StageState};
pub use status::{JsonFileStatusStore, MemoryStatusStore, StatusReporter, StatusStore};
pub use transfer::{DirectoryPublisher, InputFetcher, LocalFetcher, ResultPublisher};

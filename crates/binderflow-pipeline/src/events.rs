//! Pipeline progress events.
//!
//! The controller emits [`PipelineEvent`]s on a [`tokio::sync::broadcast`]
//! channel so observers can follow a job without coupling to controller
//! internals. Emission never blocks and never fails the job.

use serde::{Deserialize, Serialize};

use crate::stage::StageReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobStarted {
        job_id: String,
        stage_count: usize,
    },
    StageStarted {
        job_id: String,
        stage: String,
        invocations: usize,
        skipped: usize,
    },
    InvocationCompleted {
        job_id: String,
        stage: String,
        /// 1-based position within the stage.
        index: usize,
        artifacts: usize,
        duration_ms: u64,
    },
    StageCompleted {
        job_id: String,
        stage: String,
        artifacts: usize,
        duration_ms: u64,
    },
    StageFailed {
        job_id: String,
        stage: String,
        error: String,
        /// Every stage of the job: completed, the failed one, then pending.
        stages: Vec<StageReport>,
    },
    ResultsMaterialized {
        job_id: String,
        results_dir: String,
        selected: usize,
    },
    JobCompleted {
        job_id: String,
        selected: usize,
        duration_ms: u64,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. Dropped if nobody listens.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

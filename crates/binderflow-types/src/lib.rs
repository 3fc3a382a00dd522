//! Shared types for the binderflow pipeline.
//!
//! This crate provides the foundational types used across all other binderflow crates:
//! - `BinderflowError` - unified error taxonomy
//! - `Job` / `JobStatus` / `StatusUpdate` - the job lifecycle record and its state machine
//! - `Artifact` / `Confidence` / `ScoredArtifact` - files flowing between stages
//! - `Cancellation` - cooperative cancellation shared by every in-flight invocation

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unified error type for all binderflow subsystems.
#[derive(Debug, thiserror::Error)]
pub enum BinderflowError {
    // === Stage Executor ===
    #[error("{description} could not be started: {message}")]
    LaunchFailed { description: String, message: String },

    #[error("{description} failed with exit code {exit_code}{}", format_streams(.stderr, .stdout))]
    ProcessFailed {
        description: String,
        exit_code: i32,
        stderr: String,
        stdout: String,
    },

    #[error("{description} timed out after {timeout_ms}ms{}", format_streams(.stderr, ""))]
    ProcessTimedOut {
        description: String,
        timeout_ms: u64,
        stderr: String,
    },

    #[error("{description} cancelled: {reason}")]
    Cancelled { description: String, reason: String },

    // === Artifact Collector ===
    #[error("Stage '{stage}' produced no artifacts matching '{pattern}' in {}", .directory.display())]
    NoArtifactsProduced {
        stage: String,
        directory: PathBuf,
        pattern: String,
    },

    // === Collaborators ===
    #[error("Failed to fetch input '{reference}': {message}")]
    FetchFailed { reference: String, message: String },

    #[error("Failed to publish '{}': {message}", .path.display())]
    PublishFailed { path: PathBuf, message: String },

    #[error("Failed to set job '{job_id}' to {status}: {message}")]
    StatusUpdateFailed {
        job_id: String,
        status: JobStatus,
        message: String,
    },

    #[error("Job '{job_id}' cannot transition from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    // === Generic ===
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

fn format_streams(stderr: &str, stdout: &str) -> String {
    let mut out = String::new();
    if !stderr.is_empty() {
        out.push_str("\nSTDERR: ");
        out.push_str(stderr);
    }
    if !stdout.is_empty() {
        out.push_str("\nSTDOUT: ");
        out.push_str(stdout);
    }
    out
}

impl BinderflowError {
    /// The taxonomy name of this error, embedded in user-visible failure messages.
    pub fn kind(&self) -> &'static str {
        match self {
            BinderflowError::LaunchFailed { .. } => "LaunchFailed",
            BinderflowError::ProcessFailed { .. } => "ProcessFailed",
            BinderflowError::ProcessTimedOut { .. } => "ProcessTimedOut",
            BinderflowError::Cancelled { .. } => "Cancelled",
            BinderflowError::NoArtifactsProduced { .. } => "NoArtifactsProduced",
            BinderflowError::FetchFailed { .. } => "FetchFailed",
            BinderflowError::PublishFailed { .. } => "PublishFailed",
            BinderflowError::StatusUpdateFailed { .. } => "StatusUpdateFailed",
            BinderflowError::InvalidTransition { .. } => "InvalidTransition",
            BinderflowError::Config(_) => "Config",
            BinderflowError::Io(_) => "Io",
            BinderflowError::Json(_) => "Json",
            BinderflowError::Other(_) => "Other",
        }
    }

    /// Returns `true` for failures of idempotent collaborator calls, the only
    /// operations the pipeline is allowed to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BinderflowError::FetchFailed { .. }
                | BinderflowError::PublishFailed { .. }
                | BinderflowError::StatusUpdateFailed { .. }
        )
    }

    /// Returns `true` if the error was caused by a cancellation request or a
    /// pipeline-level timeout.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BinderflowError::Cancelled { .. })
    }

    /// The message persisted with a `FAILED` job status.
    pub fn failure_message(&self) -> String {
        format!("Pipeline failed: [{}] {}", self.kind(), self)
    }
}

/// A convenience alias for `Result<T, BinderflowError>`.
pub type Result<T> = std::result::Result<T, BinderflowError>;

// ---------------------------------------------------------------------------
// JobStatus - lifecycle state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is a forward edge of `PENDING -> RUNNING -> {COMPLETED | FAILED}`.
    ///
    /// `PENDING -> FAILED` is allowed so a job that could not even be marked
    /// running still reaches a terminal state. Same-status writes are not
    /// transitions and return `false`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StatusUpdate / Job
// ---------------------------------------------------------------------------

/// A single conditional write against the status store, keyed by job identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub job_id: String,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    /// Build an update stamped with the current time. `completed_at` is set
    /// only for `COMPLETED`.
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            status,
            updated_at: now,
            completed_at: (status == JobStatus::Completed).then_some(now),
            error_message: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// The persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub input_ref: String,
    pub label: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    /// Create a `PENDING` job.
    pub fn new(
        id: impl Into<String>,
        input_ref: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            input_ref: input_ref.into(),
            label: label.into(),
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    /// Apply a status update to this record.
    ///
    /// Returns `Ok(false)` when the job already has the target status (the
    /// write is an idempotent no-op) and `Ok(true)` when the record changed.
    pub fn apply(&mut self, update: &StatusUpdate) -> Result<bool> {
        if update.job_id != self.id {
            return Err(BinderflowError::StatusUpdateFailed {
                job_id: update.job_id.clone(),
                status: update.status,
                message: format!("record belongs to job '{}'", self.id),
            });
        }
        if update.status == self.status {
            return Ok(false);
        }
        if !self.status.can_transition_to(update.status) {
            return Err(BinderflowError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                to: update.status,
            });
        }
        self.status = update.status;
        self.updated_at = update.updated_at;
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        if update.error_message.is_some() {
            self.error_message = update.error_message.clone();
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Artifact / Confidence / ScoredArtifact
// ---------------------------------------------------------------------------

/// Handle to a file produced by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    /// Name of the producing stage.
    pub stage: String,
    /// 0-based index of the input artifact (of the previous stage) whose
    /// invocation produced this file. `None` for gather stages and the job input.
    pub source_index: Option<usize>,
}

impl Artifact {
    pub fn new(
        path: impl Into<PathBuf>,
        stage: impl Into<String>,
        source_index: Option<usize>,
    ) -> Self {
        Self {
            path: path.into(),
            stage: stage.into(),
            source_index,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Confidence attached to a final-stage artifact.
///
/// `Unscored` marks an artifact whose output carried no usable confidence
/// annotation. It is distinct from a measured `0.0` and serializes as `null`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub enum Confidence {
    Scored(f64),
    Unscored,
}

impl Confidence {
    pub fn value(self) -> Option<f64> {
        match self {
            Confidence::Scored(v) => Some(v),
            Confidence::Unscored => None,
        }
    }

    pub fn is_scored(self) -> bool {
        matches!(self, Confidence::Scored(_))
    }

    /// Ranking order: higher scores first, every scored value before any
    /// unscored one, unscored values equal to each other.
    pub fn rank_cmp(&self, other: &Confidence) -> Ordering {
        match (self, other) {
            (Confidence::Scored(a), Confidence::Scored(b)) => b.total_cmp(a),
            (Confidence::Scored(_), Confidence::Unscored) => Ordering::Less,
            (Confidence::Unscored, Confidence::Scored(_)) => Ordering::Greater,
            (Confidence::Unscored, Confidence::Unscored) => Ordering::Equal,
        }
    }
}

impl From<Option<f64>> for Confidence {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => Confidence::Scored(v),
            _ => Confidence::Unscored,
        }
    }
}

impl From<Confidence> for Option<f64> {
    fn from(value: Confidence) -> Self {
        value.value()
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Scored(v) => write!(f, "{:.3}", v),
            Confidence::Unscored => f.write_str("unscored"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredArtifact {
    pub artifact: Artifact,
    pub confidence: Confidence,
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation handle.
///
/// Cloning yields another handle to the **same** state. Cancellation is
/// idempotent: only the first reason is kept.
#[derive(Clone, Debug)]
pub struct Cancellation {
    state: Arc<tokio::sync::watch::Sender<Option<String>>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (state, _) = tokio::sync::watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Request cancellation. Returns `true` if this call set the reason.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let first = self.state.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if first {
            tracing::warn!(reason = %reason, "Cancellation requested");
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.state.borrow().clone()
    }

    /// Resolves with the cancellation reason once [`cancel`](Self::cancel) is called.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.state.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            // The sender lives as long as `self`, so `changed` only errors
            // after every handle is gone.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Returns a `Cancelled` error for `description` if cancellation was requested.
    pub fn check(&self, description: &str) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(BinderflowError::Cancelled {
                description: description.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

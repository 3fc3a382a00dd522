//! Job status reporting.
//!
//! [`StatusStore`] is the durable record of a job's lifecycle; the
//! [`StatusReporter`] is the only writer the controller uses. It guards the
//! `PENDING -> RUNNING -> {COMPLETED | FAILED}` state machine locally, turns
//! repeated target statuses into no-ops, and retries failed writes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use binderflow_types::{BinderflowError, Job, JobStatus, Result, StatusUpdate};

use crate::retry::{execute_with_retry, with_deadline, BackoffPolicy};

/// Durable store of job records.
///
/// `upsert` is a single conditional write keyed by job id: it creates the
/// record if needed, is a no-op when the job already has the target status
/// (returning `Ok(false)`), and rejects moves out of a terminal state with
/// [`BinderflowError::InvalidTransition`].
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn upsert(&self, update: &StatusUpdate) -> Result<bool>;
    async fn get(&self, job_id: &str) -> Result<Option<Job>>;
}

fn apply_to(existing: Option<Job>, update: &StatusUpdate) -> Result<(Job, bool)> {
    let mut job = existing.unwrap_or_else(|| Job::new(update.job_id.clone(), "", ""));
    let changed = job.apply(update)?;
    Ok((job, changed))
}

// ---------------------------------------------------------------------------
// MemoryStatusStore
// ---------------------------------------------------------------------------

/// In-process store that keeps every applied write.
#[derive(Default)]
pub struct MemoryStatusStore {
    jobs: Mutex<HashMap<String, Job>>,
    history: Mutex<Vec<StatusUpdate>>,
    attempts: Mutex<Vec<JobStatus>>,
    failures: Mutex<HashMap<JobStatus, usize>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record, typically a `PENDING` job created by the submitter.
    pub fn insert(&self, job: Job) {
        lock(&self.jobs).insert(job.id.clone(), job);
    }

    /// Make the next `count` writes of `status` fail with `StatusUpdateFailed`.
    pub fn fail_on(&self, status: JobStatus, count: usize) {
        lock(&self.failures).insert(status, count);
    }

    /// Statuses of every applied (record-changing) write for `job_id`, in order.
    pub fn transitions(&self, job_id: &str) -> Vec<JobStatus> {
        lock(&self.history)
            .iter()
            .filter(|u| u.job_id == job_id)
            .map(|u| u.status)
            .collect()
    }

    /// Every applied write, in order.
    pub fn history(&self) -> Vec<StatusUpdate> {
        lock(&self.history).clone()
    }

    /// Target status of every write attempt, including failed ones.
    pub fn attempts(&self) -> Vec<JobStatus> {
        lock(&self.attempts).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn upsert(&self, update: &StatusUpdate) -> Result<bool> {
        lock(&self.attempts).push(update.status);

        if let Some(remaining) = lock(&self.failures).get_mut(&update.status) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BinderflowError::StatusUpdateFailed {
                    job_id: update.job_id.clone(),
                    status: update.status,
                    message: "injected store failure".into(),
                });
            }
        }

        let mut jobs = lock(&self.jobs);
        let (job, changed) = apply_to(jobs.get(&update.job_id).cloned(), update)?;
        if changed {
            lock(&self.history).push(update.clone());
        }
        jobs.insert(job.id.clone(), job);
        Ok(changed)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(lock(&self.jobs).get(job_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// JsonFileStatusStore
// ---------------------------------------------------------------------------

/// One pretty-printed JSON record per job under a directory.
///
/// Records are replaced atomically (write to a temporary file, then rename).
pub struct JsonFileStatusStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn record_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    /// Seed a record for `job`, replacing any existing one.
    pub async fn insert(&self, job: &Job) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        check_job_id(&job.id)?;
        self.write(job).await
    }

    async fn read(&self, job_id: &str) -> Result<Option<Job>> {
        let path = self.record_path(job_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, job: &Job) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(&job.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", job.id));
        tokio::fs::write(&tmp, serde_json::to_string_pretty(job)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Rejects job ids that cannot be used as a single path component.
pub(crate) fn check_job_id(job_id: &str) -> Result<()> {
    if job_id.is_empty() || job_id.contains(['/', '\\']) || job_id.starts_with('.') {
        return Err(BinderflowError::Config(format!(
            "job id '{}' is not a valid record name",
            job_id
        )));
    }
    Ok(())
}

#[async_trait]
impl StatusStore for JsonFileStatusStore {
    async fn upsert(&self, update: &StatusUpdate) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        check_job_id(&update.job_id)?;

        let store_error = |e: BinderflowError| BinderflowError::StatusUpdateFailed {
            job_id: update.job_id.clone(),
            status: update.status,
            message: e.to_string(),
        };

        let existing = self.read(&update.job_id).await.map_err(store_error)?;
        let (job, changed) = apply_to(existing, update)?;
        if changed {
            self.write(&job).await.map_err(store_error)?;
        }
        Ok(changed)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        check_job_id(job_id)?;
        self.read(job_id).await
    }
}

// ---------------------------------------------------------------------------
// StatusReporter
// ---------------------------------------------------------------------------

/// Writes one job's lifecycle transitions to a [`StatusStore`].
pub struct StatusReporter {
    store: Arc<dyn StatusStore>,
    job_id: String,
    current: Mutex<JobStatus>,
    retries: usize,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn StatusStore>, job_id: impl Into<String>) -> Self {
        Self {
            store,
            job_id: job_id.into(),
            current: Mutex::new(JobStatus::Pending),
            retries: 2,
            backoff: BackoffPolicy::default(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn with_retry(mut self, retries: usize, backoff: BackoffPolicy) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// Deadline for each write attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The last status successfully written by this reporter.
    pub fn current(&self) -> JobStatus {
        *lock(&self.current)
    }

    pub async fn running(&self) -> Result<()> {
        self.report(StatusUpdate::new(&self.job_id, JobStatus::Running)).await
    }

    pub async fn completed(&self) -> Result<()> {
        self.report(StatusUpdate::new(&self.job_id, JobStatus::Completed)).await
    }

    pub async fn failed(&self, message: &str) -> Result<()> {
        self.report(StatusUpdate::new(&self.job_id, JobStatus::Failed).with_error(message))
            .await
    }

    async fn report(&self, update: StatusUpdate) -> Result<()> {
        let current = self.current();
        if current == update.status {
            tracing::debug!(
                job_id = %self.job_id,
                status = %update.status,
                "Status unchanged, skipping write"
            );
            return Ok(());
        }
        if !current.can_transition_to(update.status) {
            return Err(BinderflowError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: current,
                to: update.status,
            });
        }

        let operation = format!("status {}", update.status);
        let changed = execute_with_retry(
            || {
                with_deadline(self.store.upsert(&update), self.timeout, || {
                    BinderflowError::StatusUpdateFailed {
                        job_id: self.job_id.clone(),
                        status: update.status,
                        message: format!(
                            "store did not respond within {}ms",
                            self.timeout.as_millis()
                        ),
                    }
                })
            },
            self.retries,
            &self.backoff,
            &operation,
        )
        .await?;

        *lock(&self.current) = update.status;
        tracing::info!(
            job_id = %self.job_id,
            status = %update.status,
            changed,
            error_message = update.error_message.as_deref().unwrap_or(""),
            "Job status updated"
        );
        Ok(())
    }
}

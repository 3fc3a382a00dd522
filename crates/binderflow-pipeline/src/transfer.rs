//! Input and result transfer.
//!
//! The controller only depends on the two traits; the filesystem
//! implementations here back the launcher binary and the test suites.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use binderflow_types::{BinderflowError, Result};

use crate::status::check_job_id;

/// Brings a job's input structure into the work tree.
#[async_trait]
pub trait InputFetcher: Send + Sync {
    /// Fetch `reference` into `dest_dir`, returning the local path.
    async fn fetch(&self, reference: &str, dest_dir: &Path) -> Result<PathBuf>;
}

/// Publishes materialized results, keyed by job id and file name.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    /// Publish every file in `results_dir`, returning the published locations.
    async fn publish(&self, job_id: &str, results_dir: &Path) -> Result<Vec<String>>;
}

/// Fetches plain paths and `file://` URIs by copying them to
/// `<dest_dir>/target.<ext>`.
#[derive(Debug, Clone, Default)]
pub struct LocalFetcher;

impl LocalFetcher {
    pub fn new() -> Self {
        Self
    }
}

fn local_path(reference: &str) -> PathBuf {
    PathBuf::from(reference.strip_prefix("file://").unwrap_or(reference))
}

#[async_trait]
impl InputFetcher for LocalFetcher {
    async fn fetch(&self, reference: &str, dest_dir: &Path) -> Result<PathBuf> {
        let fetch_error = |message: String| BinderflowError::FetchFailed {
            reference: reference.to_string(),
            message,
        };

        if reference.contains("://") && !reference.starts_with("file://") {
            return Err(fetch_error("unsupported URI scheme".into()));
        }
        let source = local_path(reference);
        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if !meta.is_file() {
            return Err(fetch_error("not a regular file".into()));
        }

        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pdb".to_string());
        let dest = dest_dir.join(format!("target.{}", ext));

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| fetch_error(format!("cannot create {}: {}", dest_dir.display(), e)))?;
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        tracing::info!(
            reference = %reference,
            path = %dest.display(),
            bytes = meta.len(),
            "Input fetched"
        );
        Ok(dest)
    }
}

/// Copies results to `<root>/results/<job_id>/<file>` and returns `file://` locations.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    root: PathBuf,
}

impl DirectoryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        check_job_id(job_id)?;
        Ok(self.root.join("results").join(job_id))
    }
}

#[async_trait]
impl ResultPublisher for DirectoryPublisher {
    async fn publish(&self, job_id: &str, results_dir: &Path) -> Result<Vec<String>> {
        let dest_dir = self.job_dir(job_id)?;
        let publish_error = |path: &Path, e: std::io::Error| BinderflowError::PublishFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(results_dir)
            .await
            .map_err(|e| publish_error(results_dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| publish_error(results_dir, e))?
        {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                files.push(entry.path());
            }
        }
        files.sort();

        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| publish_error(&dest_dir, e))?;

        let mut published = Vec::with_capacity(files.len());
        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let dest = dest_dir.join(name);
            tokio::fs::copy(&file, &dest)
                .await
                .map_err(|e| publish_error(&file, e))?;
            let location = std::path::absolute(&dest).unwrap_or(dest);
            published.push(format!("file://{}", location.display()));
        }

        tracing::info!(
            job_id = %job_id,
            files = published.len(),
            dest = %dest_dir.display(),
            "Results published"
        );
        Ok(published)
    }
}

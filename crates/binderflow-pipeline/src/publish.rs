//! Metrics document and atomic materialization of selected results.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use binderflow_types::{BinderflowError, Confidence, Result, ScoredArtifact};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::JobDescriptor;
use crate::stage::StageReport;

/// A selected artifact together with the name it is published under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedResult {
    /// Published name, `<prefix>_<n><ext>`.
    pub file: String,
    pub score: Confidence,
    /// Name of the artifact the result was copied from.
    pub source_file: String,
    #[serde(skip)]
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub file: String,
    pub stage: String,
    pub source_index: Option<usize>,
    pub score: Confidence,
    pub scored: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub count: usize,
    pub best_score: Option<f64>,
    pub mean_score: Option<f64>,
    /// Final-stage artifacts without a usable confidence annotation.
    pub unscored_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsDocument {
    pub job_id: String,
    pub label: String,
    pub timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub pipeline_version: String,
    pub per_stage_status: Vec<StageReport>,
    pub results_summary: ResultsSummary,
    pub selected_results: Vec<SelectedResult>,
    pub all_scores: Vec<ScoreEntry>,
    pub stage_parameters: BTreeMap<String, serde_json::Value>,
}

impl MetricsDocument {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        job: &JobDescriptor,
        started_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        pipeline_version: &str,
        stages: &[StageReport],
        selected: &[SelectedResult],
        all: &[ScoredArtifact],
        stage_parameters: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let scores: Vec<f64> = selected.iter().filter_map(|s| s.score.value()).collect();
        let best_score = scores.iter().copied().reduce(f64::max);
        let mean_score =
            (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);

        let all_scores = all
            .iter()
            .map(|s| ScoreEntry {
                file: s.artifact.file_name(),
                stage: s.artifact.stage.clone(),
                source_index: s.artifact.source_index,
                score: s.confidence,
                scored: s.confidence.is_scored(),
            })
            .collect();

        let duration_ms = (timestamp - started_at).num_milliseconds().max(0);

        Self {
            job_id: job.id.clone(),
            label: job.label.clone(),
            timestamp,
            started_at,
            duration_secs: duration_ms as f64 / 1000.0,
            pipeline_version: pipeline_version.to_string(),
            per_stage_status: stages.to_vec(),
            results_summary: ResultsSummary {
                count: selected.len(),
                best_score,
                mean_score,
                unscored_count: all.iter().filter(|s| !s.confidence.is_scored()).count(),
            },
            selected_results: selected.to_vec(),
            all_scores,
            stage_parameters,
        }
    }
}

/// Assign published names to the selected artifacts, in ranking order.
pub fn name_results(selected: &[ScoredArtifact], prefix: &str) -> Vec<SelectedResult> {
    selected
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let ext = s
                .artifact
                .path()
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            SelectedResult {
                file: format!("{}_{}{}", prefix, i + 1, ext),
                score: s.confidence,
                source_file: s.artifact.file_name(),
                source: s.artifact.path.clone(),
            }
        })
        .collect()
}

/// Write the selected results and the metrics document into `results_dir`.
///
/// Everything is first written to a sibling staging directory, which then
/// replaces `results_dir` with a single rename. On failure the staging
/// directory is removed and `results_dir` is left untouched. Returns the
/// materialized files, sorted.
pub async fn materialize(
    results_dir: &Path,
    results: &[SelectedResult],
    metrics: &MetricsDocument,
    metrics_file: &str,
) -> Result<Vec<PathBuf>> {
    let staging = staging_dir(results_dir)?;

    if let Err(e) = write_staging(&staging, results, metrics, metrics_file).await {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(e);
    }

    if tokio::fs::try_exists(results_dir).await? {
        tokio::fs::remove_dir_all(results_dir)
            .await
            .map_err(|e| materialize_error(results_dir, e))?;
    }
    if let Err(e) = tokio::fs::rename(&staging, results_dir).await {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(materialize_error(results_dir, e));
    }

    let mut files: Vec<PathBuf> = results.iter().map(|r| results_dir.join(&r.file)).collect();
    files.push(results_dir.join(metrics_file));
    files.sort();

    tracing::info!(
        results_dir = %results_dir.display(),
        results = results.len(),
        "Results materialized"
    );
    Ok(files)
}

fn staging_dir(results_dir: &Path) -> Result<PathBuf> {
    let name = results_dir.file_name().ok_or_else(|| {
        BinderflowError::Config(format!("invalid results directory {}", results_dir.display()))
    })?;
    let parent = results_dir.parent().unwrap_or_else(|| Path::new("."));
    Ok(parent.join(format!(".{}.staging", name.to_string_lossy())))
}

async fn write_staging(
    staging: &Path,
    results: &[SelectedResult],
    metrics: &MetricsDocument,
    metrics_file: &str,
) -> Result<()> {
    if tokio::fs::try_exists(staging).await? {
        tokio::fs::remove_dir_all(staging).await?;
    }
    tokio::fs::create_dir_all(staging)
        .await
        .map_err(|e| materialize_error(staging, e))?;

    for result in results {
        tokio::fs::copy(&result.source, staging.join(&result.file))
            .await
            .map_err(|e| materialize_error(&result.source, e))?;
    }

    let json = serde_json::to_string_pretty(metrics)?;
    tokio::fs::write(staging.join(metrics_file), json)
        .await
        .map_err(|e| materialize_error(staging, e))?;
    Ok(())
}

fn materialize_error(path: &Path, e: std::io::Error) -> BinderflowError {
    BinderflowError::Other(format!("Failed to materialize results at {}: {}", path.display(), e))
}

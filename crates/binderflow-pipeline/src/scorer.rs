//! Confidence extraction from predicted structures.

use async_trait::async_trait;
use binderflow_types::{Artifact, BinderflowError, Confidence, Result};
use regex::Regex;

/// Extracts a quality signal from a final-stage artifact.
///
/// Scoring never fails a job: anything that prevents a measurement yields
/// [`Confidence::Unscored`].
#[async_trait]
pub trait ConfidenceScorer: Send + Sync {
    async fn score(&self, artifact: &Artifact) -> Confidence;
}

/// Reads the first `REMARK` record carrying `<keyword> <value>`.
///
/// ```text
/// REMARK   1 CONFIDENCE 0.873
/// ```
pub struct RemarkConfidenceScorer {
    pattern: Regex,
}

impl RemarkConfidenceScorer {
    pub fn new(keyword: &str) -> Result<Self> {
        let source = format!(r"^REMARK\s(?:.*?\s)?{}\s+(\S+)", regex::escape(keyword));
        let pattern = Regex::new(&source).map_err(|e| {
            BinderflowError::Config(format!("invalid confidence keyword '{}': {}", keyword, e))
        })?;
        Ok(Self { pattern })
    }

    /// Score the text of a structure file.
    pub fn score_text(&self, text: &str) -> Option<f64> {
        text.lines().find_map(|line| {
            let caps = self.pattern.captures(line)?;
            let raw = caps.get(1)?.as_str();
            match raw.parse::<f64>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::debug!(line = %line, "Ignoring unparseable confidence value");
                    None
                }
            }
        })
    }
}

#[async_trait]
impl ConfidenceScorer for RemarkConfidenceScorer {
    async fn score(&self, artifact: &Artifact) -> Confidence {
        let bytes = match tokio::fs::read(artifact.path()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    file = %artifact.path().display(),
                    error = %e,
                    "Could not read artifact for scoring, treating as unscored"
                );
                return Confidence::Unscored;
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let confidence = Confidence::from(self.score_text(&text));
        if !confidence.is_scored() {
            tracing::warn!(
                file = %artifact.path().display(),
                "No confidence annotation found, treating as unscored"
            );
        }
        confidence
    }
}

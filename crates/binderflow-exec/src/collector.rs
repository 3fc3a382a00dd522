//! Artifact discovery: turns the files an invocation produced into [`Artifact`]s.

use std::path::{Path, PathBuf};

use binderflow_types::{Artifact, BinderflowError, Result};
use globset::{GlobBuilder, GlobMatcher};

/// A compiled output discovery pattern.
///
/// Patterns are matched against paths relative to the invocation's output
/// directory. `*` does not cross directory separators; `**` does.
#[derive(Debug, Clone)]
pub struct OutputPattern {
    source: String,
    matcher: GlobMatcher,
}

impl OutputPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| {
                BinderflowError::Config(format!("invalid output pattern '{}': {}", pattern, e))
            })?;
        Ok(Self {
            source: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, relative: &Path) -> bool {
        self.matcher.is_match(relative)
    }
}

/// Collect every file under `dir` matching `pattern` as an artifact of `stage`.
///
/// Results are sorted lexicographically by path so fan-out indexing and
/// ranking tie-breaks are reproducible. Zero matches (including a missing
/// directory) is a [`BinderflowError::NoArtifactsProduced`] error.
pub async fn collect_artifacts(
    dir: &Path,
    pattern: &OutputPattern,
    stage: &str,
    source_index: Option<usize>,
) -> Result<Vec<Artifact>> {
    let mut matches = Vec::new();
    if tokio::fs::try_exists(dir).await? {
        collect_matches(dir, dir, pattern, &mut matches).await?;
    }
    matches.sort();

    if matches.is_empty() {
        return Err(BinderflowError::NoArtifactsProduced {
            stage: stage.to_string(),
            directory: dir.to_path_buf(),
            pattern: pattern.as_str().to_string(),
        });
    }

    tracing::debug!(
        stage = %stage,
        dir = %dir.display(),
        pattern = %pattern.as_str(),
        count = matches.len(),
        "Collected artifacts"
    );

    Ok(matches
        .into_iter()
        .map(|path| Artifact::new(path, stage, source_index))
        .collect())
}

async fn collect_matches(
    base: &Path,
    current: &Path,
    pattern: &OutputPattern,
    matches: &mut Vec<PathBuf>,
) -> Result<()> {
    let meta = tokio::fs::metadata(current).await?;
    if meta.is_file() {
        if let Ok(rel) = current.strip_prefix(base) {
            if pattern.is_match(rel) {
                matches.push(current.to_path_buf());
            }
        }
    } else if meta.is_dir() {
        let mut read_dir = tokio::fs::read_dir(current).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            Box::pin(collect_matches(base, &entry.path(), pattern, matches)).await?;
        }
    }
    Ok(())
}

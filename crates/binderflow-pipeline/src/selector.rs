//! Ranking and top-K selection of scored artifacts.

use binderflow_types::ScoredArtifact;

/// Sort by confidence, highest first, unscored last.
///
/// The sort is stable, so equal scores (and unscored artifacts among
/// themselves) keep discovery order.
pub fn rank(mut scored: Vec<ScoredArtifact>) -> Vec<ScoredArtifact> {
    scored.sort_by(|a, b| a.confidence.rank_cmp(&b.confidence));
    scored
}

/// Select at most `k` artifacts in ranking order.
///
/// Unscored artifacts are only eligible when `include_unscored` is set, in
/// which case they rank after every scored artifact.
pub fn select_top_k(
    scored: &[ScoredArtifact],
    k: usize,
    include_unscored: bool,
) -> Vec<ScoredArtifact> {
    let eligible: Vec<ScoredArtifact> = scored
        .iter()
        .filter(|s| include_unscored || s.confidence.is_scored())
        .cloned()
        .collect();
    let mut ranked = rank(eligible);
    ranked.truncate(k);
    ranked
}

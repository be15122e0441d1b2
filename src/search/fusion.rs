//! Reciprocal Rank Fusion of the keyword and semantic rankings.
//!
//! score(d) = Σ 1/(k + rank(d)) over the rankings containing d, with 1-based
//! ranks. Items present in both rankings float to the top.

use std::collections::HashMap;

use crate::catalog::ItemId;

#[derive(Debug, Clone, PartialEq)]
pub struct FusedResult {
    pub id: ItemId,
    pub score: f32,
    /// 1-based rank in the keyword ranking
    pub keyword_rank: Option<usize>,
    /// 1-based rank in the semantic ranking
    pub semantic_rank: Option<usize>,
}

impl FusedResult {
    fn best_rank(&self) -> usize {
        self.keyword_rank
            .into_iter()
            .chain(self.semantic_rank)
            .min()
            .unwrap_or(usize::MAX)
    }
}

/// Fuses two rankings (best first) into one, sorted by RRF score.
pub fn rrf(keyword_ids: &[ItemId], semantic_ids: &[ItemId], k: f32) -> Vec<FusedResult> {
    let mut scores: HashMap<ItemId, FusedResult> = HashMap::new();

    for (rank, &id) in keyword_ids.iter().enumerate() {
        let rank = rank + 1;
        scores.insert(
            id,
            FusedResult {
                id,
                score: 1.0 / (k + rank as f32),
                keyword_rank: Some(rank),
                semantic_rank: None,
            },
        );
    }

    for (rank, &id) in semantic_ids.iter().enumerate() {
        let rank = rank + 1;
        let rrf_score = 1.0 / (k + rank as f32);

        scores
            .entry(id)
            .and_modify(|result| {
                result.score += rrf_score;
                result.semantic_rank = Some(rank);
            })
            .or_insert(FusedResult {
                id,
                score: rrf_score,
                keyword_rank: None,
                semantic_rank: Some(rank),
            });
    }

    // ties are broken by best single rank, then id, so output is stable
    let mut results: Vec<FusedResult> = scores.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.best_rank().cmp(&b.best_rank()))
            .then_with(|| a.id.cmp(&b.id))
    });

    results
}

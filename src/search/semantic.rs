//! Vector ranking by cosine distance.

use std::{cmp::Ordering, collections::HashSet};

use rayon::prelude::*;

use crate::catalog::{EmbeddingRecord, ItemId};

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// `1 - cosine similarity`. `None` on dimension mismatch or zero vectors.
pub fn cosine_distance(query: &[f32], target: &[f32]) -> Option<f32> {
    if query.len() != target.len() {
        return None;
    }

    let query_norm = l2_norm(query);
    let target_norm = l2_norm(target);
    if query_norm < f32::EPSILON || target_norm < f32::EPSILON {
        return None;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    Some(1.0 - dot_product / (query_norm * target_norm))
}

/// Nearest `candidates` to `query`, closest first, at most `limit`.
pub fn rank(
    query: &[f32],
    embeddings: &[EmbeddingRecord],
    candidates: &HashSet<ItemId>,
    limit: usize,
) -> Vec<(ItemId, f32)> {
    let mut results: Vec<(ItemId, f32)> = embeddings
        .par_iter()
        .filter(|record| candidates.contains(&record.item_id))
        .filter_map(|record| {
            cosine_distance(query, &record.vector).map(|distance| (record.item_id, distance))
        })
        .collect();

    results.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    results.truncate(limit);

    results
}

//! Keyword ranking over extracted text and detection labels.

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
};

use crate::catalog::{DetectionInstance, ItemId, TextRecord};

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "in", "on", "at", "to",
    "for", "of", "with", "by", "from", "as", "and", "or", "but", "not", "no", "so", "if", "then",
];

/// Lowercase terms of `text`, without 1-char terms and common stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
        .collect()
}

/// Share of the document's terms that are query terms.
///
/// `None` unless every query term occurs in the document.
pub fn text_rank(query_terms: &[String], doc_terms: &[String]) -> Option<f32> {
    if query_terms.is_empty() || doc_terms.is_empty() {
        return None;
    }

    let query: HashSet<&str> = query_terms.iter().map(String::as_str).collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for term in doc_terms {
        if query.contains(term.as_str()) {
            *counts.entry(term.as_str()).or_default() += 1;
        }
    }

    if counts.len() < query.len() {
        return None;
    }

    let occurrences: usize = counts.values().sum();
    Some(occurrences as f32 / doc_terms.len() as f32)
}

/// Ranks `candidates` against `query`.
///
/// An item scores its text rank plus the average confidence of its
/// detections whose label contains the query. Best first, at most `limit`.
pub fn rank(
    query: &str,
    texts: &[TextRecord],
    detections: &[DetectionInstance],
    candidates: &HashSet<ItemId>,
    limit: usize,
) -> Vec<(ItemId, f32)> {
    let mut scores: HashMap<ItemId, f32> = HashMap::new();

    let query_terms = tokenize(query);
    for record in texts {
        if !candidates.contains(&record.item_id) {
            continue;
        }
        if let Some(rank) = text_rank(&query_terms, &record.terms) {
            *scores.entry(record.item_id).or_default() += rank;
        }
    }

    let needle = query.trim().to_lowercase();
    if !needle.is_empty() {
        let mut confidences: HashMap<ItemId, (f32, usize)> = HashMap::new();
        for detection in detections {
            if candidates.contains(&detection.item_id)
                && detection.label.to_lowercase().contains(&needle)
            {
                let entry = confidences.entry(detection.item_id).or_default();
                entry.0 += detection.confidence;
                entry.1 += 1;
            }
        }

        for (id, (sum, count)) in confidences {
            *scores.entry(id).or_default() += sum / count as f32;
        }
    }

    let mut results: Vec<(ItemId, f32)> = scores.into_iter().collect();
    results.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    results.truncate(limit);

    results
}

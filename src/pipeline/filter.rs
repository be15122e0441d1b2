//! Suppression of noisy detections before they are persisted.
//!
//! Some labels (typically `person`) are reported many times per photo with
//! tiny or low-confidence boxes. For those labels only the strongest few
//! instances are kept; every other label passes through untouched.

use std::{cmp::Ordering, collections::HashSet};

use crate::{capabilities::Detection, catalog::BoundingBox, config::FilterConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct FilteredDetection {
    pub detection: Detection,
    /// `None` when the image area is unknown or not positive.
    pub area_ratio: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: Vec<FilteredDetection>,
    pub dropped: usize,
}

/// Fraction of the image covered by `bbox` after clamping it to the image.
pub fn area_ratio(bbox: &BoundingBox, width: u32, height: u32) -> Option<f32> {
    let (width, height) = (width as f32, height as f32);
    let image_area = width * height;
    if image_area <= 0.0 {
        return None;
    }

    let (x1, y1, x2, y2) = bbox.corners();
    let x1 = x1.clamp(0.0, width);
    let x2 = x2.clamp(0.0, width);
    let y1 = y1.clamp(0.0, height);
    let y2 = y2.clamp(0.0, height);

    let box_w = x2 - x1;
    let box_h = y2 - y1;
    if box_w <= 0.0 || box_h <= 0.0 {
        return Some(0.0);
    }

    Some(box_w * box_h / image_area)
}

pub struct DetectionFilter {
    noisy_labels: HashSet<String>,
    min_area_ratio: f32,
    min_confidence: f32,
    max_instances: usize,
}

impl DetectionFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            noisy_labels: config
                .noisy_labels
                .iter()
                .map(|label| label.to_lowercase())
                .collect(),
            min_area_ratio: config.min_area_ratio,
            min_confidence: config.min_confidence,
            max_instances: config.max_instances,
        }
    }

    pub fn is_noisy(&self, label: &str) -> bool {
        self.noisy_labels.contains(&label.to_lowercase())
    }

    /// Filters `detections` of an image of `dimensions` (width, height).
    ///
    /// Non-noisy detections come first in input order, followed by the
    /// surviving noisy ones grouped by label in order of first appearance,
    /// strongest first within a group.
    pub fn apply(
        &self,
        detections: Vec<Detection>,
        dimensions: Option<(u32, u32)>,
    ) -> FilterOutcome {
        let total = detections.len();

        let mut kept = Vec::with_capacity(total);
        let mut groups: Vec<(String, Vec<FilteredDetection>)> = Vec::new();

        for detection in detections {
            let ratio = dimensions.and_then(|(w, h)| area_ratio(&detection.bbox, w, h));
            let filtered = FilteredDetection {
                detection,
                area_ratio: ratio,
            };

            if !self.is_noisy(&filtered.detection.label) {
                kept.push(filtered);
                continue;
            }

            if ratio.is_some_and(|ratio| ratio < self.min_area_ratio)
                || filtered.detection.confidence < self.min_confidence
            {
                continue;
            }

            let key = filtered.detection.label.to_lowercase();
            match groups.iter_mut().find(|(label, _)| *label == key) {
                Some((_, group)) => group.push(filtered),
                None => groups.push((key, vec![filtered])),
            }
        }

        for (_, mut group) in groups {
            group.sort_by(|a, b| {
                b.detection
                    .confidence
                    .partial_cmp(&a.detection.confidence)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| {
                        b.area_ratio
                            .unwrap_or(0.0)
                            .partial_cmp(&a.area_ratio.unwrap_or(0.0))
                            .unwrap_or(Ordering::Equal)
                    })
            });

            if self.max_instances > 0 {
                group.truncate(self.max_instances);
            }
            kept.extend(group);
        }

        FilterOutcome {
            dropped: total - kept.len(),
            kept,
        }
    }
}

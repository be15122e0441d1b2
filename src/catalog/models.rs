use std::{fmt::Display, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ItemId = u64;

/// Length of a valid perceptual hash digest: 256 bits as hex.
pub const DIGEST_HEX_LEN: usize = 64;

/// Processing state of an item. Variants are declared in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    #[default]
    Pending,
    Preprocessing,
    DetectingObjects,
    Embedding,
    ExtractingText,
    DetectingFaces,
    Hashing,
    LinkingDuplicates,
    Completed,
    Partial,
    Failed,
}

impl ProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }

    pub fn is_running(&self) -> bool {
        !self.is_terminal() && *self != Self::Pending
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Preprocessing => "preprocessing",
            Self::DetectingObjects => "detecting_objects",
            Self::Embedding => "embedding",
            Self::ExtractingText => "extracting_text",
            Self::DetectingFaces => "detecting_faces",
            Self::Hashing => "hashing",
            Self::LinkingDuplicates => "linking_duplicates",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub path: PathBuf,
    pub filename: String,
    pub state: ProcessingState,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,

    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: Option<u64>,

    pub thumbnail_path: Option<PathBuf>,
    pub processed_path: Option<PathBuf>,

    pub error_message: Option<String>,
}

impl Item {
    /// Path the enrichment stages should read: the normalized copy when
    /// preprocessing produced one, the original asset otherwise.
    pub fn working_path(&self) -> &PathBuf {
        self.processed_path.as_ref().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemCreate {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_path: Option<PathBuf>,
}

/// Rectangle of a detection, in pixels.
///
/// Recognizers report either two corners or an origin with a size; both
/// shapes deserialize from the same field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoundingBox {
    Corners { x1: f32, y1: f32, x2: f32, y2: f32 },
    Sized { x: f32, y: f32, width: f32, height: f32 },
}

impl BoundingBox {
    /// `(x1, y1, x2, y2)` regardless of representation.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        match *self {
            BoundingBox::Corners { x1, y1, x2, y2 } => (x1, y1, x2, y2),
            BoundingBox::Sized {
                x,
                y,
                width,
                height,
            } => (x, y, x + width, y + height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionInstance {
    pub item_id: ItemId,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub area_ratio: Option<f32>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueTag {
    pub item_id: ItemId,
    pub label: String,
    /// Highest confidence among the label's detection instances.
    pub confidence: f32,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub item_id: ItemId,
    pub vector: Vec<f32>,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRecord {
    pub item_id: ItemId,
    pub text: String,
    pub language: String,
    /// Normalized tokens of `text`, used by keyword search.
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub item_id: ItemId,
    pub bbox: BoundingBox,
    pub vector: Vec<f32>,
    pub cluster_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashRecord {
    pub item_id: ItemId,
    pub digest: String,
    pub quality: Option<f32>,
}

impl HashRecord {
    pub fn is_valid(&self) -> bool {
        is_valid_digest(&self.digest)
    }
}

pub fn is_valid_digest(digest: &str) -> bool {
    digest.len() == DIGEST_HEX_LEN && digest.chars().all(|c| c.is_ascii_hexdigit())
}

/// Near-duplicate relation between two items.
///
/// Stored with `item_a < item_b` so that both orderings of a pair map to the
/// same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateLink {
    pub item_a: ItemId,
    pub item_b: ItemId,
    pub distance: u32,
}

impl DuplicateLink {
    pub fn new(first: ItemId, second: ItemId, distance: u32) -> Self {
        Self {
            item_a: first.min(second),
            item_b: first.max(second),
            distance,
        }
    }

    pub fn connects(&self, first: ItemId, second: ItemId) -> bool {
        (self.item_a, self.item_b) == (first.min(second), first.max(second))
    }

    pub fn involves(&self, id: ItemId) -> bool {
        self.item_a == id || self.item_b == id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCategory {
    pub label: String,
    pub category: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_and_terminality() {
        assert!(ProcessingState::Pending < ProcessingState::Preprocessing);
        assert!(ProcessingState::LinkingDuplicates < ProcessingState::Completed);
        assert!(ProcessingState::Partial.is_terminal());
        assert!(!ProcessingState::Hashing.is_terminal());
        assert!(ProcessingState::Hashing.is_running());
        assert!(!ProcessingState::Pending.is_running());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ProcessingState::DetectingObjects).unwrap();
        assert_eq!(json, "\"detecting_objects\"");
        assert_eq!(ProcessingState::DetectingObjects.to_string(), "detecting_objects");
    }

    #[test]
    fn test_bbox_both_shapes_deserialize() {
        let corners: BoundingBox =
            serde_json::from_str(r#"{"x1": 1, "y1": 2, "x2": 11, "y2": 22}"#).unwrap();
        let sized: BoundingBox =
            serde_json::from_str(r#"{"x": 1, "y": 2, "width": 10, "height": 20}"#).unwrap();

        assert_eq!(corners.corners(), (1.0, 2.0, 11.0, 22.0));
        assert_eq!(sized.corners(), corners.corners());
    }

    #[test]
    fn test_duplicate_link_is_order_independent() {
        let ab = DuplicateLink::new(7, 3, 4);
        let ba = DuplicateLink::new(3, 7, 4);

        assert_eq!(ab, ba);
        assert_eq!((ab.item_a, ab.item_b), (3, 7));
        assert!(ab.connects(7, 3));
        assert!(ab.involves(7));
        assert!(!ab.involves(5));
    }

    #[test]
    fn test_digest_validity() {
        let valid = "ab".repeat(32);
        assert!(is_valid_digest(&valid));
        assert!(!is_valid_digest(&"ab".repeat(31)));
        assert!(!is_valid_digest(&"0".repeat(512)));
        assert!(!is_valid_digest(&"zz".repeat(32)));
    }
}

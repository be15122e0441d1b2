//! Persistence for items and everything the pipeline derives from them.
//!
//! - `models`: row types (items, detections, embeddings, hashes, links...)
//! - `backend`: JSON snapshot backend, every write except stage progress is committed on its own

mod backend;
pub mod models;

use std::path::Path;

pub use backend::BackendJson;
pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("item {0} not found")]
    NotFound(ItemId),

    #[error("item with path {0} already exists at id {1}")]
    AlreadyExists(String, ItemId),

    #[error("path {0} appears twice in one batch")]
    DuplicatePath(String),

    #[error("invalid perceptual hash for item {item_id}: expected 64 hex characters, got {len}")]
    InvalidDigest { item_id: ItemId, len: usize },

    #[error("catalog lock poisoned")]
    Poisoned,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Outcome of registering a label → category mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryInsert {
    Created,
    Unchanged,
    /// The label already maps to another category; it is left untouched.
    Conflict { existing: String },
}

pub trait Catalog: Send + Sync {
    // items
    fn create_item(&self, create: ItemCreate) -> Result<Item, CatalogError>;
    /// Creates every item in one write. Fails without creating anything if
    /// a path is already known.
    fn create_items(&self, creates: Vec<ItemCreate>) -> Result<Vec<Item>, CatalogError>;
    fn item(&self, id: ItemId) -> Result<Option<Item>, CatalogError>;
    fn item_by_path(&self, path: &Path) -> Result<Option<Item>, CatalogError>;
    fn items(&self) -> Result<Vec<Item>, CatalogError>;
    fn update_item(&self, id: ItemId, update: ItemUpdate) -> Result<Item, CatalogError>;
    /// Moves the item to `state`. Terminal states also stamp `processed_at`.
    fn set_state(
        &self,
        id: ItemId,
        state: ProcessingState,
        error_message: Option<String>,
    ) -> Result<Item, CatalogError>;

    /// Drops every enrichment row of the item, duplicate links included.
    fn clear_enrichment(&self, id: ItemId) -> Result<(), CatalogError>;

    // detections
    fn insert_detections(
        &self,
        id: ItemId,
        tags: Vec<UniqueTag>,
        instances: Vec<DetectionInstance>,
    ) -> Result<(), CatalogError>;
    fn detections(&self, id: ItemId) -> Result<Vec<DetectionInstance>, CatalogError>;
    fn all_detections(&self) -> Result<Vec<DetectionInstance>, CatalogError>;
    fn unique_tags(&self, id: ItemId) -> Result<Vec<UniqueTag>, CatalogError>;

    // embeddings
    fn put_embedding(&self, record: EmbeddingRecord) -> Result<(), CatalogError>;
    fn embeddings(&self) -> Result<Vec<EmbeddingRecord>, CatalogError>;

    // text
    fn put_text(&self, record: TextRecord) -> Result<(), CatalogError>;
    fn text(&self, id: ItemId) -> Result<Option<TextRecord>, CatalogError>;
    fn texts(&self) -> Result<Vec<TextRecord>, CatalogError>;

    // faces
    fn insert_faces(&self, id: ItemId, faces: Vec<FaceRecord>) -> Result<(), CatalogError>;
    fn faces(&self, id: ItemId) -> Result<Vec<FaceRecord>, CatalogError>;

    // hashes
    /// Rejects digests that are not exactly 64 hex characters.
    fn put_hash(&self, record: HashRecord) -> Result<(), CatalogError>;
    fn hash(&self, id: ItemId) -> Result<Option<HashRecord>, CatalogError>;
    fn hashes(&self) -> Result<Vec<HashRecord>, CatalogError>;
    fn invalid_hashes(&self) -> Result<Vec<HashRecord>, CatalogError>;
    /// Deletes invalid digests and returns what was removed.
    fn purge_invalid_hashes(&self) -> Result<Vec<HashRecord>, CatalogError>;

    // duplicates
    /// Inserts the link unless the pair is already linked. Returns whether
    /// a row was written.
    fn insert_link(&self, link: DuplicateLink) -> Result<bool, CatalogError>;
    fn links_for(&self, id: ItemId) -> Result<Vec<DuplicateLink>, CatalogError>;
    fn links(&self) -> Result<Vec<DuplicateLink>, CatalogError>;

    // categories
    fn category_for(&self, label: &str) -> Result<Option<String>, CatalogError>;
    fn categories(&self) -> Result<Vec<TagCategory>, CatalogError>;
    fn insert_category(&self, label: &str, category: &str)
        -> Result<CategoryInsert, CatalogError>;
}

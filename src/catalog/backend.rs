use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
    time::Instant,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::storage::StorageManager;

use super::{
    Catalog, CatalogError, CategoryInsert, DetectionInstance, DuplicateLink, EmbeddingRecord,
    FaceRecord, HashRecord, Item, ItemCreate, ItemId, ItemUpdate, ProcessingState, TagCategory,
    TextRecord, UniqueTag,
};

const CATALOG_FILE: &str = "catalog.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    next_id: ItemId,
    items: BTreeMap<ItemId, Item>,
    #[serde(default)]
    detections: Vec<DetectionInstance>,
    #[serde(default)]
    unique_tags: Vec<UniqueTag>,
    #[serde(default)]
    embeddings: BTreeMap<ItemId, EmbeddingRecord>,
    #[serde(default)]
    texts: BTreeMap<ItemId, TextRecord>,
    #[serde(default)]
    faces: Vec<FaceRecord>,
    #[serde(default)]
    hashes: BTreeMap<ItemId, HashRecord>,
    #[serde(default)]
    links: Vec<DuplicateLink>,
    /// Keyed by lowercased label.
    #[serde(default)]
    categories: BTreeMap<String, TagCategory>,

    /// Item id by source path, rebuilt on load.
    #[serde(skip)]
    paths: HashMap<PathBuf, ItemId>,
    /// Bumped on every change, snapshots of older generations are dropped.
    #[serde(skip)]
    generation: u64,
}

impl Tables {
    fn reindex(&mut self) {
        self.paths = self
            .items
            .values()
            .map(|item| (item.path.clone(), item.id))
            .collect();
    }

    fn insert_item(&mut self, create: ItemCreate) -> Item {
        self.next_id += 1;
        let id = self.next_id;

        let filename = create
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let item = Item {
            id,
            path: create.path,
            filename,
            state: ProcessingState::Pending,
            created_at: create.created_at.unwrap_or_else(Utc::now),
            processed_at: None,
            width: None,
            height: None,
            file_size: create.file_size,
            thumbnail_path: None,
            processed_path: None,
            error_message: None,
        };

        self.paths.insert(item.path.clone(), id);
        self.items.insert(id, item.clone());
        item
    }

    fn item_mut(&mut self, id: ItemId) -> Result<&mut Item, CatalogError> {
        self.items.get_mut(&id).ok_or(CatalogError::NotFound(id))
    }

    fn ensure_item(&self, id: ItemId) -> Result<(), CatalogError> {
        if self.items.contains_key(&id) {
            Ok(())
        } else {
            Err(CatalogError::NotFound(id))
        }
    }
}

/// Catalog kept in memory and snapshotted to `catalog.json` after every
/// write, except for pipeline progress which is only kept in memory until
/// the next snapshot.
///
/// Writes validate before they mutate, so a rejected write changes nothing.
/// A failed snapshot leaves memory ahead of disk until the next one succeeds.
#[derive(Clone)]
pub struct BackendJson {
    tables: Arc<RwLock<Tables>>,
    store: Option<Arc<dyn StorageManager>>,
    /// Generation of the snapshot on disk.
    persisted: Arc<Mutex<u64>>,
}

impl BackendJson {
    pub fn load(store: Arc<dyn StorageManager>) -> Result<Self, CatalogError> {
        let now = Instant::now();

        let tables = if store.exists(CATALOG_FILE) {
            let mut tables: Tables = serde_json::from_slice(&store.read(CATALOG_FILE)?)?;
            tables.reindex();
            tables
        } else {
            log::info!("Creating new catalog at {}", store.path_of(CATALOG_FILE).display());
            let tables = Tables::default();
            store.write(CATALOG_FILE, &serde_json::to_vec(&tables)?)?;
            tables
        };

        log::debug!(
            "loaded catalog with {} items in {:?}",
            tables.items.len(),
            now.elapsed()
        );

        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            store: Some(store),
            persisted: Arc::new(Mutex::new(0)),
        })
    }

    /// Catalog that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            store: None,
            persisted: Arc::new(Mutex::new(0)),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, CatalogError> {
        let tables = self.tables.read().map_err(|_| CatalogError::Poisoned)?;
        Ok(f(&tables))
    }

    /// Applies `f` in memory only.
    fn update<R>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R, CatalogError>,
    ) -> Result<R, CatalogError> {
        let mut tables = self.tables.write().map_err(|_| CatalogError::Poisoned)?;
        let result = f(&mut tables)?;
        tables.generation += 1;
        Ok(result)
    }

    /// Applies `f` and writes the snapshot.
    fn commit<R>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R, CatalogError>,
    ) -> Result<R, CatalogError> {
        let result = self.update(f)?;
        self.persist()?;
        Ok(result)
    }

    /// Serializes under the read lock, so readers are not blocked, then
    /// writes unless a newer snapshot already made it to disk.
    fn persist(&self) -> Result<(), CatalogError> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let (generation, data) = self.read(|tables| {
            serde_json::to_vec(tables).map(|data| (tables.generation, data))
        })??;

        let mut persisted = self.persisted.lock().map_err(|_| CatalogError::Poisoned)?;
        if generation > *persisted {
            store.write(CATALOG_FILE, &data)?;
            *persisted = generation;
        }
        Ok(())
    }
}

impl Catalog for BackendJson {
    fn create_item(&self, create: ItemCreate) -> Result<Item, CatalogError> {
        self.commit(|tables| {
            if let Some(existing) = tables.paths.get(&create.path) {
                return Err(CatalogError::AlreadyExists(
                    create.path.display().to_string(),
                    *existing,
                ));
            }
            Ok(tables.insert_item(create))
        })
    }

    fn create_items(&self, creates: Vec<ItemCreate>) -> Result<Vec<Item>, CatalogError> {
        if creates.is_empty() {
            return Ok(vec![]);
        }

        self.commit(|tables| {
            let mut seen = HashSet::new();
            for create in &creates {
                if let Some(existing) = tables.paths.get(&create.path) {
                    return Err(CatalogError::AlreadyExists(
                        create.path.display().to_string(),
                        *existing,
                    ));
                }
                if !seen.insert(&create.path) {
                    return Err(CatalogError::DuplicatePath(
                        create.path.display().to_string(),
                    ));
                }
            }

            Ok(creates
                .into_iter()
                .map(|create| tables.insert_item(create))
                .collect())
        })
    }

    fn item(&self, id: ItemId) -> Result<Option<Item>, CatalogError> {
        self.read(|tables| tables.items.get(&id).cloned())
    }

    fn item_by_path(&self, path: &Path) -> Result<Option<Item>, CatalogError> {
        self.read(|tables| {
            tables
                .paths
                .get(path)
                .and_then(|id| tables.items.get(id))
                .cloned()
        })
    }

    fn items(&self) -> Result<Vec<Item>, CatalogError> {
        self.read(|tables| tables.items.values().cloned().collect())
    }

    fn update_item(&self, id: ItemId, update: ItemUpdate) -> Result<Item, CatalogError> {
        self.commit(|tables| {
            let item = tables.item_mut(id)?;

            if let Some(width) = update.width {
                item.width = Some(width);
            }
            if let Some(height) = update.height {
                item.height = Some(height);
            }
            if let Some(file_size) = update.file_size {
                item.file_size = Some(file_size);
            }
            if let Some(thumbnail_path) = update.thumbnail_path {
                item.thumbnail_path = Some(thumbnail_path);
            }
            if let Some(processed_path) = update.processed_path {
                item.processed_path = Some(processed_path);
            }

            Ok(item.clone())
        })
    }

    fn set_state(
        &self,
        id: ItemId,
        state: ProcessingState,
        error_message: Option<String>,
    ) -> Result<Item, CatalogError> {
        let apply = |tables: &mut Tables| -> Result<Item, CatalogError> {
            let item = tables.item_mut(id)?;
            item.state = state;
            if error_message.is_some() {
                item.error_message = error_message;
            }
            if state.is_terminal() {
                item.processed_at = Some(Utc::now());
            }
            Ok(item.clone())
        };

        // stage progress is not worth a snapshot
        if state.is_running() {
            self.update(apply)
        } else {
            self.commit(apply)
        }
    }

    fn clear_enrichment(&self, id: ItemId) -> Result<(), CatalogError> {
        self.commit(|tables| {
            let item = tables.item_mut(id)?;
            item.error_message = None;
            item.processed_at = None;

            tables.detections.retain(|row| row.item_id != id);
            tables.unique_tags.retain(|row| row.item_id != id);
            tables.embeddings.remove(&id);
            tables.texts.remove(&id);
            tables.faces.retain(|row| row.item_id != id);
            tables.hashes.remove(&id);
            tables.links.retain(|link| !link.involves(id));
            Ok(())
        })
    }

    fn insert_detections(
        &self,
        id: ItemId,
        tags: Vec<UniqueTag>,
        instances: Vec<DetectionInstance>,
    ) -> Result<(), CatalogError> {
        self.commit(|tables| {
            tables.ensure_item(id)?;

            for tag in tags {
                match tables
                    .unique_tags
                    .iter_mut()
                    .find(|row| row.item_id == id && row.label == tag.label)
                {
                    Some(row) => *row = tag,
                    None => tables.unique_tags.push(tag),
                }
            }
            tables.detections.extend(instances);
            Ok(())
        })
    }

    fn detections(&self, id: ItemId) -> Result<Vec<DetectionInstance>, CatalogError> {
        self.read(|tables| {
            tables
                .detections
                .iter()
                .filter(|row| row.item_id == id)
                .cloned()
                .collect()
        })
    }

    fn all_detections(&self) -> Result<Vec<DetectionInstance>, CatalogError> {
        self.read(|tables| tables.detections.clone())
    }

    fn unique_tags(&self, id: ItemId) -> Result<Vec<UniqueTag>, CatalogError> {
        self.read(|tables| {
            tables
                .unique_tags
                .iter()
                .filter(|row| row.item_id == id)
                .cloned()
                .collect()
        })
    }

    fn put_embedding(&self, record: EmbeddingRecord) -> Result<(), CatalogError> {
        self.commit(|tables| {
            tables.ensure_item(record.item_id)?;
            tables.embeddings.insert(record.item_id, record);
            Ok(())
        })
    }

    fn embeddings(&self) -> Result<Vec<EmbeddingRecord>, CatalogError> {
        self.read(|tables| tables.embeddings.values().cloned().collect())
    }

    fn put_text(&self, record: TextRecord) -> Result<(), CatalogError> {
        self.commit(|tables| {
            tables.ensure_item(record.item_id)?;
            tables.texts.insert(record.item_id, record);
            Ok(())
        })
    }

    fn text(&self, id: ItemId) -> Result<Option<TextRecord>, CatalogError> {
        self.read(|tables| tables.texts.get(&id).cloned())
    }

    fn texts(&self) -> Result<Vec<TextRecord>, CatalogError> {
        self.read(|tables| tables.texts.values().cloned().collect())
    }

    fn insert_faces(&self, id: ItemId, faces: Vec<FaceRecord>) -> Result<(), CatalogError> {
        self.commit(|tables| {
            tables.ensure_item(id)?;
            tables.faces.extend(faces);
            Ok(())
        })
    }

    fn faces(&self, id: ItemId) -> Result<Vec<FaceRecord>, CatalogError> {
        self.read(|tables| {
            tables
                .faces
                .iter()
                .filter(|row| row.item_id == id)
                .cloned()
                .collect()
        })
    }

    fn put_hash(&self, record: HashRecord) -> Result<(), CatalogError> {
        if !record.is_valid() {
            return Err(CatalogError::InvalidDigest {
                item_id: record.item_id,
                len: record.digest.len(),
            });
        }

        self.commit(|tables| {
            tables.ensure_item(record.item_id)?;
            tables.hashes.insert(record.item_id, record);
            Ok(())
        })
    }

    fn hash(&self, id: ItemId) -> Result<Option<HashRecord>, CatalogError> {
        self.read(|tables| tables.hashes.get(&id).cloned())
    }

    fn hashes(&self) -> Result<Vec<HashRecord>, CatalogError> {
        self.read(|tables| tables.hashes.values().cloned().collect())
    }

    fn invalid_hashes(&self) -> Result<Vec<HashRecord>, CatalogError> {
        self.read(|tables| {
            tables
                .hashes
                .values()
                .filter(|record| !record.is_valid())
                .cloned()
                .collect()
        })
    }

    fn purge_invalid_hashes(&self) -> Result<Vec<HashRecord>, CatalogError> {
        self.commit(|tables| {
            let (invalid, valid): (Vec<_>, Vec<_>) = std::mem::take(&mut tables.hashes)
                .into_values()
                .partition(|record| !record.is_valid());

            tables.hashes = valid
                .into_iter()
                .map(|record| (record.item_id, record))
                .collect();
            Ok(invalid)
        })
    }

    fn insert_link(&self, link: DuplicateLink) -> Result<bool, CatalogError> {
        self.commit(|tables| {
            if tables
                .links
                .iter()
                .any(|existing| existing.connects(link.item_a, link.item_b))
            {
                return Ok(false);
            }
            tables.links.push(link);
            Ok(true)
        })
    }

    fn links_for(&self, id: ItemId) -> Result<Vec<DuplicateLink>, CatalogError> {
        self.read(|tables| {
            tables
                .links
                .iter()
                .filter(|link| link.involves(id))
                .copied()
                .collect()
        })
    }

    fn links(&self) -> Result<Vec<DuplicateLink>, CatalogError> {
        self.read(|tables| tables.links.clone())
    }

    fn category_for(&self, label: &str) -> Result<Option<String>, CatalogError> {
        let key = label.to_lowercase();
        self.read(|tables| tables.categories.get(&key).map(|c| c.category.clone()))
    }

    fn categories(&self) -> Result<Vec<TagCategory>, CatalogError> {
        self.read(|tables| tables.categories.values().cloned().collect())
    }

    fn insert_category(&self, label: &str, category: &str) -> Result<CategoryInsert, CatalogError> {
        let key = label.to_lowercase();

        // avoid rewriting the snapshot for a no-op
        let existing = self.read(|tables| tables.categories.get(&key).cloned())?;
        if let Some(existing) = existing {
            return Ok(if existing.category == category {
                CategoryInsert::Unchanged
            } else {
                CategoryInsert::Conflict {
                    existing: existing.category,
                }
            });
        }

        self.commit(|tables| {
            tables.categories.insert(
                key,
                TagCategory {
                    label: label.to_string(),
                    category: category.to_string(),
                },
            );
            Ok(CategoryInsert::Created)
        })
    }
}

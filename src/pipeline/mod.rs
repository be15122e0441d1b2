//! Per-item enrichment pipeline.
//!
//! An item goes through every [`Stage`] in order. A failing stage is logged
//! and recorded, then the next one runs anyway; the outcomes decide the
//! final state (`completed`, `partial` or `failed`).

pub mod claims;
pub mod duplicates;
pub mod filter;
pub mod stage;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::{
    capabilities::ModelService,
    catalog::{
        Catalog, CatalogError, DetectionInstance, EmbeddingRecord, FaceRecord, HashRecord, Item,
        ItemId, ItemUpdate, ProcessingState, TextRecord, UniqueTag,
    },
    config::Config,
    images,
    search::keyword,
    storage::StorageManager,
};

pub use claims::Claims;
pub use duplicates::DuplicateLinker;
pub use filter::DetectionFilter;
pub use stage::{terminal_state, PipelineReport, Stage, StageError, StageOutcome, StageReport};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    #[error("item {0} is already being processed")]
    AlreadyRunning(ItemId),

    #[error("processing of item {0} was cancelled")]
    Cancelled(ItemId),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl PipelineError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            PipelineError::ItemNotFound(_) | PipelineError::Cancelled(_)
        )
    }
}

/// Data carried from one stage to the next.
struct RunContext {
    item: Item,
    dimensions: Option<(u32, u32)>,
}

pub struct Orchestrator {
    catalog: Arc<dyn Catalog>,
    models: Arc<ModelService>,
    filter: DetectionFilter,
    linker: DuplicateLinker,
    claims: Claims,
    thumbnails: Arc<dyn StorageManager>,
    processed: Arc<dyn StorageManager>,
    thumbnail_size: u32,
    ocr_language: String,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        catalog: Arc<dyn Catalog>,
        models: Arc<ModelService>,
        thumbnails: Arc<dyn StorageManager>,
        processed: Arc<dyn StorageManager>,
    ) -> Self {
        Self {
            catalog,
            models,
            filter: DetectionFilter::new(&config.filter),
            linker: DuplicateLinker::new(config.duplicates.hamming_threshold),
            claims: Claims::default(),
            thumbnails,
            processed,
            thumbnail_size: config.library.thumbnail_size,
            ocr_language: config.models.ocr_language.clone(),
        }
    }

    /// Runs every stage for `id` and persists the final state.
    pub fn process(&self, id: ItemId) -> Result<PipelineReport, PipelineError> {
        self.process_until(id, &AtomicBool::new(false))
    }

    /// Like [`process`](Self::process), but once `cancel` is set the run
    /// stops before the next stage and leaves the item `failed`.
    pub fn process_until(
        &self,
        id: ItemId,
        cancel: &AtomicBool,
    ) -> Result<PipelineReport, PipelineError> {
        let Some(_claim) = self.claims.try_claim(id) else {
            return Err(PipelineError::AlreadyRunning(id));
        };

        let now = Instant::now();

        let item = self
            .catalog
            .item(id)?
            .ok_or(PipelineError::ItemNotFound(id))?;

        log::info!("processing item {id} ({})", item.path.display());

        if let Err(e) = self.catalog.clear_enrichment(id) {
            log::error!("failed to clear previous results of item {id}: {e}");
            if let Err(e) = self
                .catalog
                .set_state(id, ProcessingState::Failed, Some(e.to_string()))
            {
                log::error!("failed to mark item {id} as failed: {e}");
            }
            return Err(e.into());
        }

        let mut ctx = RunContext {
            item,
            dimensions: None,
        };
        let mut outcomes = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            if cancel.load(Ordering::Relaxed) {
                let message = format!("cancelled before {stage}");
                log::warn!("item {id}: {message}");
                self.catalog
                    .set_state(id, ProcessingState::Failed, Some(message))?;
                return Err(PipelineError::Cancelled(id));
            }

            let result = self
                .catalog
                .set_state(id, stage.state(), None)
                .map_err(StageError::from)
                .and_then(|_| self.run_stage(stage, &mut ctx));

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::warn!("item {id}: {stage} failed: {e}");
                    StageOutcome::Failed(e)
                }
            };
            if let StageOutcome::Skipped(reason) = &outcome {
                log::debug!("item {id}: {stage} skipped: {reason}");
            }

            outcomes.push((stage, outcome));
        }

        let report = PipelineReport {
            item_id: id,
            state: terminal_state(&outcomes),
            outcomes,
        };

        self.catalog
            .set_state(id, report.state, report.error_summary())?;

        log::info!(
            "item {id} finished as {} in {:?}",
            report.state,
            now.elapsed()
        );

        Ok(report)
    }

    /// Marks `id` failed when a run died midway and left it in a stage
    /// state. Items claimed by a live run are left to that run.
    pub fn mark_failed(&self, id: ItemId, message: &str) -> Result<(), PipelineError> {
        if self.claims.is_claimed(id) {
            return Ok(());
        }

        match self.catalog.item(id)? {
            Some(item) if item.state.is_running() => {
                self.catalog
                    .set_state(id, ProcessingState::Failed, Some(message.to_string()))?;
            }
            _ => {}
        }
        Ok(())
    }

    fn run_stage(&self, stage: Stage, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        match stage {
            Stage::Preprocessing => self.preprocess(ctx),
            Stage::DetectingObjects => self.detect_objects(ctx),
            Stage::Embedding => self.embed(ctx),
            Stage::ExtractingText => self.extract_text(ctx),
            Stage::DetectingFaces => self.detect_faces(ctx),
            Stage::Hashing => self.hash(ctx),
            Stage::LinkingDuplicates => self.link_duplicates(ctx),
        }
    }

    fn preprocess(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        let id = ctx.item.id;
        let result = if images::needs_conversion(&ctx.item.path) {
            let capabilities = self.models.capabilities()?;
            let converted = capabilities.converter.convert(&ctx.item.path)?;
            log::debug!("item {id}: converted to jpeg ({} bytes)", converted.len());

            images::preprocess_converted(
                id,
                &ctx.item.path,
                &converted,
                self.thumbnails.as_ref(),
                self.processed.as_ref(),
                self.thumbnail_size,
            )?
        } else {
            images::preprocess(
                id,
                &ctx.item.path,
                self.thumbnails.as_ref(),
                self.processed.as_ref(),
                self.thumbnail_size,
            )?
        };

        ctx.item = self.catalog.update_item(
            id,
            ItemUpdate {
                width: Some(result.width),
                height: Some(result.height),
                file_size: Some(result.file_size),
                thumbnail_path: Some(result.thumbnail_path),
                processed_path: result.processed_path,
            },
        )?;
        ctx.dimensions = Some((result.width, result.height));

        Ok(StageOutcome::Succeeded(StageReport::Preprocessed {
            width: result.width,
            height: result.height,
        }))
    }

    fn detect_objects(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        let capabilities = self.models.capabilities()?;
        let id = ctx.item.id;
        let path = ctx.item.working_path();

        let detections = capabilities.objects.detect(path)?;

        let dimensions = match ctx.dimensions {
            Some(dimensions) => Some(dimensions),
            None => match images::dimensions(path) {
                Ok(dimensions) => Some(dimensions),
                Err(e) => {
                    log::debug!("item {id}: unknown dimensions, area check disabled: {e}");
                    None
                }
            },
        };

        let outcome = self.filter.apply(detections, dimensions);
        if outcome.dropped > 0 {
            log::debug!("item {id}: filtered out {} detections", outcome.dropped);
        }

        let mut categories: HashMap<String, Option<String>> = HashMap::new();
        let mut tags: Vec<UniqueTag> = Vec::new();
        let mut instances = Vec::with_capacity(outcome.kept.len());

        for filtered in &outcome.kept {
            let detection = &filtered.detection;

            let category = match categories.get(&detection.label) {
                Some(category) => category.clone(),
                None => {
                    let category = self.catalog.category_for(&detection.label)?;
                    categories.insert(detection.label.clone(), category.clone());
                    category
                }
            };

            match tags.iter_mut().find(|tag| tag.label == detection.label) {
                Some(tag) => tag.confidence = tag.confidence.max(detection.confidence),
                None => tags.push(UniqueTag {
                    item_id: id,
                    label: detection.label.clone(),
                    confidence: detection.confidence,
                    category: category.clone(),
                }),
            }

            instances.push(DetectionInstance {
                item_id: id,
                label: detection.label.clone(),
                confidence: detection.confidence,
                bbox: detection.bbox,
                area_ratio: filtered.area_ratio,
                category,
            });
        }

        let report = StageReport::Detected {
            kept: instances.len(),
            dropped: outcome.dropped,
            labels: tags.len(),
        };
        self.catalog.insert_detections(id, tags, instances)?;

        Ok(StageOutcome::Succeeded(report))
    }

    fn embed(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        let capabilities = self.models.capabilities()?;
        let embedder = &capabilities.image_embedder;

        let vector = embedder.embed_image(ctx.item.working_path())?;
        let dimensions = vector.len();

        self.catalog.put_embedding(EmbeddingRecord {
            item_id: ctx.item.id,
            vector,
            model_version: embedder.model_version().to_string(),
        })?;

        Ok(StageOutcome::Succeeded(StageReport::Embedded { dimensions }))
    }

    fn extract_text(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        let capabilities = self.models.capabilities()?;

        let text = capabilities
            .text
            .extract_text(ctx.item.working_path())?
            .map(|text| text.trim().to_string())
            .unwrap_or_default();

        // no text is still a successful extraction
        if !text.is_empty() {
            self.catalog.put_text(TextRecord {
                item_id: ctx.item.id,
                terms: keyword::tokenize(&text),
                language: self.ocr_language.clone(),
                text: text.clone(),
            })?;
        }

        Ok(StageOutcome::Succeeded(StageReport::TextExtracted {
            chars: text.chars().count(),
        }))
    }

    fn detect_faces(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        let capabilities = self.models.capabilities()?;
        let id = ctx.item.id;

        let faces: Vec<FaceRecord> = capabilities
            .faces
            .detect_faces(ctx.item.working_path())?
            .into_iter()
            .map(|face| FaceRecord {
                item_id: id,
                bbox: face.bbox,
                vector: face.embedding,
                cluster_id: None,
            })
            .collect();

        let count = faces.len();
        if count > 0 {
            self.catalog.insert_faces(id, faces)?;
        }

        Ok(StageOutcome::Succeeded(StageReport::FacesDetected { count }))
    }

    fn hash(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        let capabilities = self.models.capabilities()?;

        let output = capabilities.hasher.hash(ctx.item.working_path())?;
        let digest = output.digest.trim().to_lowercase();
        if digest.is_empty() {
            return Ok(StageOutcome::Skipped("hasher returned no digest".to_string()));
        }

        self.catalog.put_hash(HashRecord {
            item_id: ctx.item.id,
            digest,
            quality: output.quality,
        })?;

        Ok(StageOutcome::Succeeded(StageReport::Hashed))
    }

    fn link_duplicates(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        match self.linker.link(self.catalog.as_ref(), ctx.item.id)? {
            Some(report) => Ok(StageOutcome::Succeeded(StageReport::Linked {
                compared: report.compared,
                created: report.created.len(),
            })),
            None => Ok(StageOutcome::Skipped("item has no hash".to_string())),
        }
    }
}

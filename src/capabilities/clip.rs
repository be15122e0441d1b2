//! CLIP embeddings through fastembed.
//!
//! The vision and text halves of ViT-B/32 share one embedding space, so a
//! query embedded with [`ClipText`] can be compared against photos embedded
//! with [`ClipImage`].

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions,
    TextEmbedding,
};

use super::{normalize, CapabilityError, ImageEmbedder, TextEmbedder};

pub const MODEL_VERSION: &str = "clip-vit-b-32";

fn models_dir(cache_dir: &Path) -> Result<PathBuf, CapabilityError> {
    let models_dir = cache_dir.join("models");
    std::fs::create_dir_all(&models_dir).map_err(|e| {
        CapabilityError::InitFailed(format!("Failed to create models directory: {}", e))
    })?;
    Ok(models_dir)
}

/// Uses a Mutex because fastembed's embed() requires &mut self. The model
/// is loaded on first use; a failed load is retried on the next call.
pub struct ClipImage {
    cache_dir: PathBuf,
    model: Mutex<Option<ImageEmbedding>>,
}

impl ClipImage {
    /// Downloads the model into `cache_dir/models` on first use.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            model: Mutex::new(None),
        }
    }

    fn load(&self) -> Result<ImageEmbedding, CapabilityError> {
        log::info!("Loading CLIP image model");
        let options = ImageInitOptions::new(ImageEmbeddingModel::ClipVitB32)
            .with_cache_dir(models_dir(&self.cache_dir)?)
            .with_show_download_progress(true);

        ImageEmbedding::try_new(options).map_err(|e| CapabilityError::InitFailed(e.to_string()))
    }
}

impl ImageEmbedder for ClipImage {
    fn load_model(&self) -> Result<(), CapabilityError> {
        let mut guard = self.model.lock().map_err(|_| CapabilityError::Poisoned)?;
        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        Ok(())
    }

    fn embed_image(&self, image: &Path) -> Result<Vec<f32>, CapabilityError> {
        let mut guard = self.model.lock().map_err(|_| CapabilityError::Poisoned)?;
        let model = match guard.take() {
            Some(model) => model,
            None => self.load()?,
        };
        let model = guard.insert(model);

        let mut embedding = model
            .embed(vec![image], None)
            .map_err(|e| CapabilityError::Inference(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| CapabilityError::Inference("No embedding returned".to_string()))?;

        normalize(&mut embedding);
        Ok(embedding)
    }

    fn model_version(&self) -> &str {
        MODEL_VERSION
    }
}

pub struct ClipText {
    cache_dir: PathBuf,
    model: Mutex<Option<TextEmbedding>>,
}

impl ClipText {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            model: Mutex::new(None),
        }
    }

    fn load(&self) -> Result<TextEmbedding, CapabilityError> {
        log::info!("Loading CLIP text model");
        let options = InitOptions::new(EmbeddingModel::ClipVitB32)
            .with_cache_dir(models_dir(&self.cache_dir)?)
            .with_show_download_progress(true);

        TextEmbedding::try_new(options).map_err(|e| CapabilityError::InitFailed(e.to_string()))
    }
}

impl TextEmbedder for ClipText {
    fn load_model(&self) -> Result<(), CapabilityError> {
        let mut guard = self.model.lock().map_err(|_| CapabilityError::Poisoned)?;
        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        Ok(())
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let mut guard = self.model.lock().map_err(|_| CapabilityError::Poisoned)?;
        let model = match guard.take() {
            Some(model) => model,
            None => self.load()?,
        };
        let model = guard.insert(model);

        let mut embedding = model
            .embed(vec![text], None)
            .map_err(|e| CapabilityError::Inference(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| CapabilityError::Inference("No embedding returned".to_string()))?;

        normalize(&mut embedding);
        Ok(embedding)
    }
}

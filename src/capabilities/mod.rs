//! Inference capabilities consumed by the pipeline and the search engine.
//!
//! Each capability is a trait so the pipeline can be driven by local models,
//! the inference sidecar, or fakes in tests:
//! - `clip`: CLIP image and text embeddings computed locally with fastembed
//! - `remote`: objects, ocr, faces, perceptual hashes and format conversion
//!   over HTTP
//! - `service`: initialize-once holder handed to the orchestrator and search

pub mod clip;
pub mod remote;
pub mod service;

use std::{path::Path, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::catalog::BoundingBox;

pub use service::ModelService;

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("{0} is not configured")]
    Unavailable(&'static str),

    #[error("model initialization failed: {0}")]
    InitFailed(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HashOutput {
    /// Hex digest. Empty when the hasher produced nothing.
    pub digest: String,
    #[serde(default)]
    pub quality: Option<f32>,
}

pub trait ObjectRecognizer: Send + Sync {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>, CapabilityError>;
}

pub trait ImageEmbedder: Send + Sync {
    /// Loads the model ahead of the first embedding.
    fn load_model(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    /// Unit-normalized embedding of the image.
    fn embed_image(&self, image: &Path) -> Result<Vec<f32>, CapabilityError>;
    fn model_version(&self) -> &str;
}

/// Encodes text into the same space as [`ImageEmbedder`].
pub trait TextEmbedder: Send + Sync {
    fn load_model(&self) -> Result<(), CapabilityError> {
        Ok(())
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, image: &Path) -> Result<Option<String>, CapabilityError>;
}

pub trait FaceDetector: Send + Sync {
    fn detect_faces(&self, image: &Path) -> Result<Vec<DetectedFace>, CapabilityError>;
}

pub trait PerceptualHasher: Send + Sync {
    fn hash(&self, image: &Path) -> Result<HashOutput, CapabilityError>;
}

/// Converts formats the image decoder cannot read (HEIF, camera RAW) to JPEG.
pub trait FormatConverter: Send + Sync {
    fn convert(&self, image: &Path) -> Result<Vec<u8>, CapabilityError>;
}

/// The full set of capabilities a pipeline run needs.
#[derive(Clone)]
pub struct Capabilities {
    pub objects: Arc<dyn ObjectRecognizer>,
    pub image_embedder: Arc<dyn ImageEmbedder>,
    pub text_embedder: Arc<dyn TextEmbedder>,
    pub text: Arc<dyn TextExtractor>,
    pub faces: Arc<dyn FaceDetector>,
    pub hasher: Arc<dyn PerceptualHasher>,
    pub converter: Arc<dyn FormatConverter>,
}

/// L2-normalize in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

//! Initialize-once holder of the inference capabilities.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use super::{
    clip::{ClipImage, ClipText},
    remote::{InferenceClient, Unconfigured},
    Capabilities, CapabilityError,
};
use crate::config::ModelsConfig;

/// Builds the capabilities on first use, or eagerly through `initialize()`.
/// Constructed once and shared by the orchestrator and the search engine.
///
/// The sidecar client and the CLIP models are independent: CLIP loads on its
/// first embedding, so a missing or slow model download only affects the
/// embedding stage and semantic search.
pub struct ModelService {
    config: ModelsConfig,
    base_path: PathBuf,
    /// Uses Mutex<Option<_>> instead of OnceLock because get_or_try_init is
    /// unstable.
    state: Mutex<Option<Arc<Capabilities>>>,
}

impl ModelService {
    /// `base_path` holds the downloaded models under `models/`.
    pub fn new(config: ModelsConfig, base_path: PathBuf) -> Self {
        Self {
            config,
            base_path,
            state: Mutex::new(None),
        }
    }

    /// Service that is already initialized with the given capabilities.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            config: ModelsConfig::default(),
            base_path: PathBuf::new(),
            state: Mutex::new(Some(Arc::new(capabilities))),
        }
    }

    /// Builds the capabilities and loads CLIP. A CLIP failure is only logged,
    /// loading is attempted again on the next embedding.
    pub fn initialize(&self) -> Result<(), CapabilityError> {
        let capabilities = self.capabilities()?;

        if let Err(e) = capabilities
            .image_embedder
            .load_model()
            .and_then(|_| capabilities.text_embedder.load_model())
        {
            log::warn!("CLIP models are not available yet: {e}");
        }

        Ok(())
    }

    /// Capabilities, built on first call.
    pub fn capabilities(&self) -> Result<Arc<Capabilities>, CapabilityError> {
        let mut guard = self.state.lock().map_err(|_| CapabilityError::Poisoned)?;

        if let Some(capabilities) = guard.as_ref() {
            return Ok(capabilities.clone());
        }

        let capabilities = Arc::new(self.build()?);
        *guard = Some(capabilities.clone());
        Ok(capabilities)
    }

    fn build(&self) -> Result<Capabilities, CapabilityError> {
        log::info!("CLIP models are stored in {}", self.base_path.display());

        let image_embedder = Arc::new(ClipImage::new(&self.base_path));
        let text_embedder = Arc::new(ClipText::new(&self.base_path));

        let capabilities = match &self.config.inference_url {
            Some(url) => {
                log::info!("Using inference sidecar at {url}");
                let client = Arc::new(InferenceClient::new(url, &self.config)?);
                Capabilities {
                    objects: client.clone(),
                    image_embedder,
                    text_embedder,
                    text: client.clone(),
                    faces: client.clone(),
                    hasher: client.clone(),
                    converter: client,
                }
            }
            None => {
                log::warn!(
                    "models.inference_url is not set, object, text, face and hash stages will fail"
                );
                Capabilities {
                    objects: Arc::new(Unconfigured),
                    image_embedder,
                    text_embedder,
                    text: Arc::new(Unconfigured),
                    faces: Arc::new(Unconfigured),
                    hasher: Arc::new(Unconfigured),
                    converter: Arc::new(Unconfigured),
                }
            }
        };

        Ok(capabilities)
    }
}

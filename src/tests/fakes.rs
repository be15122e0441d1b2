//! In-memory capabilities and an isolated library for integration tests.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    app::App,
    capabilities::{
        CapabilityError, Capabilities, DetectedFace, Detection, FaceDetector, FormatConverter,
        HashOutput, ImageEmbedder, ModelService, ObjectRecognizer, PerceptualHasher,
        TextEmbedder, TextExtractor,
    },
    catalog::{BackendJson, BoundingBox, Catalog, ItemCreate, ItemId},
    config::Config,
    storage::BackendLocal,
};

/// What the fake models report for one photo, looked up by file name.
#[derive(Debug, Clone, Default)]
pub struct FakePhoto {
    pub detections: Vec<Detection>,
    pub embedding: Vec<f32>,
    pub text: Option<String>,
    pub faces: usize,
    pub digest: String,
    /// Capabilities that fail for this photo: objects, embed, text, faces,
    /// hash, convert
    pub failing: HashSet<&'static str>,
    /// Object detection takes this long.
    pub delay: Option<Duration>,
    /// Object detection panics.
    pub panics: bool,
}

impl FakePhoto {
    pub fn fail(mut self, capability: &'static str) -> Self {
        self.failing.insert(capability);
        self
    }
}

pub fn detection(label: &str, confidence: f32, bbox: (f32, f32, f32, f32)) -> Detection {
    Detection {
        label: label.to_string(),
        confidence,
        bbox: BoundingBox::Corners {
            x1: bbox.0,
            y1: bbox.1,
            x2: bbox.2,
            y2: bbox.3,
        },
    }
}

/// 64-hex digest: `base` repeated, with the lowest `flipped` bits inverted.
pub fn digest(base: char, flipped: u32) -> String {
    let mut bytes = hex::decode(base.to_string().repeat(64)).unwrap();
    let last = bytes.len() - 1;
    for bit in 0..flipped {
        let byte = last - (bit / 8) as usize;
        bytes[byte] ^= 1 << (bit % 8);
    }
    hex::encode(bytes)
}

#[derive(Default)]
pub struct FakeInference {
    photos: RwLock<HashMap<String, FakePhoto>>,
    queries: RwLock<HashMap<String, Vec<f32>>>,
    text_embedder_down: AtomicBool,
    detecting: AtomicUsize,
    max_detecting: AtomicUsize,
}

impl FakeInference {
    /// Makes every query embedding fail from now on.
    pub fn break_text_embedder(&self) {
        self.text_embedder_down.store(true, Ordering::Relaxed);
    }

    /// Most object detections that were ever running at the same time.
    pub fn max_concurrent_detections(&self) -> usize {
        self.max_detecting.load(Ordering::Relaxed)
    }

    pub fn set_photo(&self, name: &str, photo: FakePhoto) {
        self.photos.write().unwrap().insert(name.to_string(), photo);
    }

    pub fn set_query(&self, query: &str, vector: Vec<f32>) {
        self.queries
            .write()
            .unwrap()
            .insert(query.to_string(), vector);
    }

    fn photo(&self, image: &Path, capability: &'static str) -> Result<FakePhoto, CapabilityError> {
        let name = image
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let photo = self
            .photos
            .read()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_default();

        if photo.failing.contains(capability) {
            return Err(CapabilityError::Inference(format!("{capability} exploded")));
        }
        Ok(photo)
    }

    pub fn capabilities(self: &Arc<Self>) -> Capabilities {
        Capabilities {
            objects: self.clone(),
            image_embedder: self.clone(),
            text_embedder: self.clone(),
            text: self.clone(),
            faces: self.clone(),
            hasher: self.clone(),
            converter: self.clone(),
        }
    }
}

impl ObjectRecognizer for FakeInference {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>, CapabilityError> {
        let photo = self.photo(image, "objects")?;

        let running = self.detecting.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_detecting.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = photo.delay {
            std::thread::sleep(delay);
        }
        self.detecting.fetch_sub(1, Ordering::SeqCst);

        if photo.panics {
            panic!("detector crashed on {}", image.display());
        }
        Ok(photo.detections)
    }
}

impl ImageEmbedder for FakeInference {
    fn embed_image(&self, image: &Path) -> Result<Vec<f32>, CapabilityError> {
        let embedding = self.photo(image, "embed")?.embedding;
        if embedding.is_empty() {
            return Ok(vec![0.0, 0.0, 1.0]);
        }
        Ok(embedding)
    }

    fn model_version(&self) -> &str {
        "fake-v1"
    }
}

impl TextEmbedder for FakeInference {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        if self.text_embedder_down.load(Ordering::Relaxed) {
            return Err(CapabilityError::Inference("clip down".to_string()));
        }
        Ok(self
            .queries
            .read()
            .unwrap()
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![0.0, 0.0, 1.0]))
    }
}

impl TextExtractor for FakeInference {
    fn extract_text(&self, image: &Path) -> Result<Option<String>, CapabilityError> {
        Ok(self.photo(image, "text")?.text)
    }
}

impl FaceDetector for FakeInference {
    fn detect_faces(&self, image: &Path) -> Result<Vec<DetectedFace>, CapabilityError> {
        let count = self.photo(image, "faces")?.faces;
        Ok((0..count)
            .map(|i| DetectedFace {
                bbox: BoundingBox::Sized {
                    x: i as f32 * 10.0,
                    y: 0.0,
                    width: 8.0,
                    height: 8.0,
                },
                embedding: vec![i as f32, 1.0],
            })
            .collect())
    }
}

impl PerceptualHasher for FakeInference {
    fn hash(&self, image: &Path) -> Result<HashOutput, CapabilityError> {
        let photo = self.photo(image, "hash")?;
        Ok(HashOutput {
            digest: photo.digest,
            quality: Some(1.0),
        })
    }
}

impl FormatConverter for FakeInference {
    fn convert(&self, path: &Path) -> Result<Vec<u8>, CapabilityError> {
        self.photo(path, "convert")?;

        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            48,
            32,
            image::Rgb([10, 200, 90]),
        ))
        .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
        .unwrap();
        Ok(jpeg)
    }
}

/// An isolated library in a temp dir, driven by [`FakeInference`].
pub struct TestLibrary {
    pub app: App,
    pub fake: Arc<FakeInference>,
    pub tmp: tempfile::TempDir,
}

impl TestLibrary {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeInference::default());

        let catalog = Arc::new(BackendJson::in_memory());
        let models = Arc::new(ModelService::with_capabilities(fake.capabilities()));

        let app = App::new_with(
            config,
            catalog,
            models,
            Arc::new(BackendLocal::new(tmp.path()).unwrap()),
            Arc::new(BackendLocal::new(tmp.path().join("thumbnails")).unwrap()),
            Arc::new(BackendLocal::new(tmp.path().join("processed")).unwrap()),
        );

        Self { app, fake, tmp }
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.app.catalog.as_ref()
    }

    /// Writes a 64x64 PNG named `name` and registers it.
    pub fn add_photo(&self, name: &str, photo: FakePhoto) -> ItemId {
        self.add_photo_at(name, photo, None)
    }

    pub fn add_photo_at(
        &self,
        name: &str,
        photo: FakePhoto,
        created_at: Option<DateTime<Utc>>,
    ) -> ItemId {
        let path = self.tmp.path().join(name);
        image::RgbImage::from_pixel(64, 64, image::Rgb([120, 80, 40]))
            .save(&path)
            .unwrap();

        self.fake.set_photo(name, photo);

        self.catalog()
            .create_item(ItemCreate {
                path,
                file_size: None,
                created_at,
            })
            .unwrap()
            .id
    }

    /// Registers a file that is not an image at all.
    pub fn add_garbage(&self, name: &str, photo: FakePhoto) -> ItemId {
        let path = self.tmp.path().join(name);
        std::fs::write(&path, b"definitely not an image").unwrap();

        self.fake.set_photo(name, photo);

        self.catalog()
            .create_item(ItemCreate {
                path,
                ..Default::default()
            })
            .unwrap()
            .id
    }

    pub fn process(&self, id: ItemId) -> crate::pipeline::PipelineReport {
        self.app.process_now(id).unwrap()
    }
}

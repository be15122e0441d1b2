//! Client for the inference sidecar.
//!
//! The sidecar reads images from the shared filesystem, so requests carry a
//! path rather than image bytes. One endpoint per capability:
//!
//! | endpoint      | request                          | response                         |
//! |---------------|----------------------------------|----------------------------------|
//! | `/v1/objects` | `{path, min_confidence}`         | `{detections: [Detection]}`      |
//! | `/v1/ocr`     | `{path, language}`               | `{text: string \| null}`         |
//! | `/v1/faces`   | `{path}`                         | `{faces: [DetectedFace]}`        |
//! | `/v1/hash`    | `{path}`                         | `{digest, quality}`              |
//! | `/v1/convert` | `{path, format: "jpeg"}`         | JPEG bytes                       |

use std::{path::Path, time::Duration};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use super::{
    CapabilityError, DetectedFace, Detection, FaceDetector, FormatConverter, HashOutput,
    ObjectRecognizer, PerceptualHasher, TextExtractor,
};
use crate::config::ModelsConfig;

#[derive(Clone)]
pub struct InferenceClient {
    base_url: String,
    client: reqwest::blocking::Client,
    min_confidence: f32,
    language: String,
}

#[derive(Deserialize)]
struct ObjectsResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct FacesResponse {
    #[serde(default)]
    faces: Vec<DetectedFace>,
}

impl InferenceClient {
    pub fn new(base_url: &str, config: &ModelsConfig) -> Result<Self, CapabilityError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.inference_timeout_secs))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            min_confidence: config.object_min_confidence,
            language: config.ocr_language.clone(),
        })
    }

    fn post<B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<reqwest::blocking::Response, CapabilityError> {
        let url = format!("{}{endpoint}", self.base_url);
        log::debug!("POST {url}");

        let response = self.client.post(&url).json(body).send()?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(CapabilityError::Inference(format!(
                "{endpoint} returned {status}: {text}"
            )));
        }

        Ok(response)
    }

    fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<R, CapabilityError> {
        Ok(self.post(endpoint, body)?.json()?)
    }
}

impl ObjectRecognizer for InferenceClient {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>, CapabilityError> {
        let response: ObjectsResponse = self.call(
            "/v1/objects",
            &json!({ "path": image, "min_confidence": self.min_confidence }),
        )?;
        Ok(response.detections)
    }
}

impl TextExtractor for InferenceClient {
    fn extract_text(&self, image: &Path) -> Result<Option<String>, CapabilityError> {
        let response: OcrResponse = self.call(
            "/v1/ocr",
            &json!({ "path": image, "language": self.language }),
        )?;
        Ok(response.text)
    }
}

impl FaceDetector for InferenceClient {
    fn detect_faces(&self, image: &Path) -> Result<Vec<DetectedFace>, CapabilityError> {
        let response: FacesResponse = self.call("/v1/faces", &json!({ "path": image }))?;
        Ok(response.faces)
    }
}

impl PerceptualHasher for InferenceClient {
    fn hash(&self, image: &Path) -> Result<HashOutput, CapabilityError> {
        self.call("/v1/hash", &json!({ "path": image }))
    }
}

impl FormatConverter for InferenceClient {
    fn convert(&self, image: &Path) -> Result<Vec<u8>, CapabilityError> {
        let response = self.post("/v1/convert", &json!({ "path": image, "format": "jpeg" }))?;
        Ok(response.bytes()?.to_vec())
    }
}

/// Stand-in used when no inference sidecar is configured. Every call fails,
/// which the pipeline records as a failed stage.
#[derive(Clone, Copy)]
pub struct Unconfigured;

impl ObjectRecognizer for Unconfigured {
    fn detect(&self, _image: &Path) -> Result<Vec<Detection>, CapabilityError> {
        Err(CapabilityError::Unavailable("object recognition"))
    }
}

impl TextExtractor for Unconfigured {
    fn extract_text(&self, _image: &Path) -> Result<Option<String>, CapabilityError> {
        Err(CapabilityError::Unavailable("text extraction"))
    }
}

impl FaceDetector for Unconfigured {
    fn detect_faces(&self, _image: &Path) -> Result<Vec<DetectedFace>, CapabilityError> {
        Err(CapabilityError::Unavailable("face detection"))
    }
}

impl PerceptualHasher for Unconfigured {
    fn hash(&self, _image: &Path) -> Result<HashOutput, CapabilityError> {
        Err(CapabilityError::Unavailable("perceptual hashing"))
    }
}

impl FormatConverter for Unconfigured {
    fn convert(&self, _image: &Path) -> Result<Vec<u8>, CapabilityError> {
        Err(CapabilityError::Unavailable("format conversion"))
    }
}

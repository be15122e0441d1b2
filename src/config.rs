use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::storage::{self, StorageManager};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_THUMBNAIL_SIZE: u32 = 400;
const DEFAULT_MIN_AREA_RATIO: f32 = 0.02;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.35;
const DEFAULT_MAX_INSTANCES: usize = 3;
/// PDQ's recommended match threshold for 256-bit digests.
const DEFAULT_HAMMING_THRESHOLD: u32 = 31;
const DEFAULT_RRF_K: f32 = 60.0;
const DEFAULT_RESULT_CAP: usize = 100;
const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_MAX_PAGE_SIZE: usize = 100;
const DEFAULT_SNIPPET_CHARS: usize = 200;
const DEFAULT_MAX_MATCHED_TAGS: usize = 5;
const DEFAULT_MAX_WORKERS: u16 = 4;
const DEFAULT_MAX_RETRIES: u8 = 3;
const DEFAULT_RETRY_BACKOFF_SECS: u64 = 60;
const DEFAULT_SOFT_TIME_LIMIT_SECS: u64 = 600;
const DEFAULT_HARD_TIME_LIMIT_SECS: u64 = 900;
const DEFAULT_OBJECT_MIN_CONFIDENCE: f32 = 0.5;
const DEFAULT_OCR_LANGUAGE: &str = "en";
const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Directory scanned for photos.
    #[serde(default)]
    pub photos_dir: Option<PathBuf>,

    /// File extensions accepted by the scanner, compared case-insensitively.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Longest edge of generated thumbnails, in pixels.
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            photos_dir: None,
            extensions: default_extensions(),
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
        }
    }
}

fn default_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "png", "heic", "webp", "cr2", "nef", "dng", "arw", "raw",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_thumbnail_size() -> u32 {
    DEFAULT_THUMBNAIL_SIZE
}

/// Suppression of over-represented detections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Labels subject to filtering, compared case-insensitively.
    #[serde(default = "default_noisy_labels")]
    pub noisy_labels: Vec<String>,

    #[serde(default = "default_min_area_ratio")]
    pub min_area_ratio: f32,

    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Instances kept per noisy label. 0 keeps all of them.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            noisy_labels: default_noisy_labels(),
            min_area_ratio: DEFAULT_MIN_AREA_RATIO,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_instances: DEFAULT_MAX_INSTANCES,
        }
    }
}

fn default_noisy_labels() -> Vec<String> {
    vec!["person".to_string()]
}

fn default_min_area_ratio() -> f32 {
    DEFAULT_MIN_AREA_RATIO
}

fn default_min_confidence() -> f32 {
    DEFAULT_MIN_CONFIDENCE
}

fn default_max_instances() -> usize {
    DEFAULT_MAX_INSTANCES
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DuplicatesConfig {
    /// Maximum number of differing bits for two photos to be linked.
    #[serde(default = "default_hamming_threshold")]
    pub hamming_threshold: u32,
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            hamming_threshold: DEFAULT_HAMMING_THRESHOLD,
        }
    }
}

fn default_hamming_threshold() -> u32 {
    DEFAULT_HAMMING_THRESHOLD
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,

    /// Candidates taken from each ranking before fusion.
    #[serde(default = "default_result_cap")]
    pub result_cap: usize,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,

    #[serde(default = "default_max_matched_tags")]
    pub max_matched_tags: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: DEFAULT_RRF_K,
            result_cap: DEFAULT_RESULT_CAP,
            page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            snippet_chars: DEFAULT_SNIPPET_CHARS,
            max_matched_tags: DEFAULT_MAX_MATCHED_TAGS,
        }
    }
}

fn default_rrf_k() -> f32 {
    DEFAULT_RRF_K
}

fn default_result_cap() -> usize {
    DEFAULT_RESULT_CAP
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_max_page_size() -> usize {
    DEFAULT_MAX_PAGE_SIZE
}

fn default_snippet_chars() -> usize {
    DEFAULT_SNIPPET_CHARS
}

fn default_max_matched_tags() -> usize {
    DEFAULT_MAX_MATCHED_TAGS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: u16,

    #[serde(default = "default_max_retries")]
    pub max_retries: u8,

    /// Base delay of the exponential retry backoff.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,

    /// A run exceeding this is logged.
    #[serde(default = "default_soft_time_limit_secs")]
    pub soft_time_limit_secs: u64,

    /// A run exceeding this is abandoned and retried.
    #[serde(default = "default_hard_time_limit_secs")]
    pub hard_time_limit_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_secs: DEFAULT_RETRY_BACKOFF_SECS,
            soft_time_limit_secs: DEFAULT_SOFT_TIME_LIMIT_SECS,
            hard_time_limit_secs: DEFAULT_HARD_TIME_LIMIT_SECS,
        }
    }
}

fn default_max_workers() -> u16 {
    DEFAULT_MAX_WORKERS
}

fn default_max_retries() -> u8 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_backoff_secs() -> u64 {
    DEFAULT_RETRY_BACKOFF_SECS
}

fn default_soft_time_limit_secs() -> u64 {
    DEFAULT_SOFT_TIME_LIMIT_SECS
}

fn default_hard_time_limit_secs() -> u64 {
    DEFAULT_HARD_TIME_LIMIT_SECS
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Base url of the inference sidecar serving objects, ocr, faces and
    /// hashes.
    #[serde(default)]
    pub inference_url: Option<String>,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    #[serde(default = "default_object_min_confidence")]
    pub object_min_confidence: f32,

    #[serde(default = "default_ocr_language")]
    pub ocr_language: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            inference_url: None,
            inference_timeout_secs: DEFAULT_INFERENCE_TIMEOUT_SECS,
            object_min_confidence: DEFAULT_OBJECT_MIN_CONFIDENCE,
            ocr_language: DEFAULT_OCR_LANGUAGE.to_string(),
        }
    }
}

fn default_inference_timeout_secs() -> u64 {
    DEFAULT_INFERENCE_TIMEOUT_SECS
}

fn default_object_min_confidence() -> f32 {
    DEFAULT_OBJECT_MIN_CONFIDENCE
}

fn default_ocr_language() -> String {
    DEFAULT_OCR_LANGUAGE.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

fn default_server_addr() -> String {
    DEFAULT_SERVER_ADDR.to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub duplicates: DuplicatesConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Extra label → category mappings, merged with the built-in ones by
    /// `categories sync`.
    #[serde(default)]
    pub categories: BTreeMap<String, String>,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.queue.max_workers == 0 {
            self.queue.max_workers = 1
        }

        let filter = &self.filter;
        if !(0.0..=1.0).contains(&filter.min_area_ratio) {
            bail!(
                "filter.min_area_ratio must be between 0.0 and 1.0, got {}",
                filter.min_area_ratio
            );
        }
        if !(0.0..=1.0).contains(&filter.min_confidence) {
            bail!(
                "filter.min_confidence must be between 0.0 and 1.0, got {}",
                filter.min_confidence
            );
        }

        if self.duplicates.hamming_threshold > 256 {
            bail!(
                "duplicates.hamming_threshold cannot exceed 256 bits, got {}",
                self.duplicates.hamming_threshold
            );
        }

        let search = &self.search;
        if search.rrf_k <= 0.0 {
            bail!("search.rrf_k must be positive, got {}", search.rrf_k);
        }
        if search.result_cap == 0 {
            bail!("search.result_cap must be greater than 0");
        }
        if search.page_size == 0 || search.page_size > search.max_page_size {
            bail!(
                "search.page_size must be between 1 and search.max_page_size ({}), got {}",
                search.max_page_size,
                search.page_size
            );
        }

        if self.queue.hard_time_limit_secs < self.queue.soft_time_limit_secs {
            bail!("queue.hard_time_limit_secs must not be lower than queue.soft_time_limit_secs");
        }

        Ok(())
    }

    pub fn load_with(base_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_path = base_path.into();
        let store = storage::BackendLocal::new(&base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        // create new if does not exist
        if !store.exists(CONFIG_FILE) {
            store.write(CONFIG_FILE, serde_yml::to_string(&Self::default())?.as_bytes())?;
        }

        let config_str =
            String::from_utf8(store.read(CONFIG_FILE)?).context("config file is not valid utf8")?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path;

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let store = storage::BackendLocal::new(&self.base_path)?;

        let config_str = serde_yml::to_string(&self)?;
        store.write(CONFIG_FILE, config_str.as_bytes())?;
        Ok(())
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_config() {
        let tmp = tempfile::tempdir().unwrap();

        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.filter.noisy_labels, vec!["person".to_string()]);
        assert_eq!(config.filter.max_instances, 3);
        assert_eq!(config.search.result_cap, 100);
        assert_eq!(config.search.page_size, 50);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.models.ocr_language, "en");
    }

    #[test]
    fn test_partial_config_is_filled_and_resaved() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "duplicates:\n  hamming_threshold: 12\n",
        )
        .unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.duplicates.hamming_threshold, 12);
        assert!((config.search.rrf_k - 60.0).abs() < f32::EPSILON);

        let saved = std::fs::read_to_string(tmp.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("rrf_k"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "filter:\n  min_confidence: 1.5\n",
        )
        .unwrap();

        let err = Config::load_with(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("min_confidence"));
    }

    #[test]
    fn test_zero_workers_is_clamped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "queue:\n  max_workers: 0\n").unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.queue.max_workers, 1);
    }
}

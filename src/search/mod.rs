//! Hybrid search over processed photos.
//!
//! - `keyword`: extracted text and detection labels
//! - `semantic`: cosine distance between CLIP embeddings
//! - `fusion`: Reciprocal Rank Fusion of the two rankings

pub mod fusion;
pub mod keyword;
pub mod semantic;

use std::{collections::HashSet, fmt::Display, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    capabilities::{CapabilityError, ModelService},
    catalog::{Catalog, CatalogError, DetectionInstance, Item, ItemId, ProcessingState},
    config::SearchConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("embedding error: {0}")]
    Capability(#[from] CapabilityError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Hybrid,
    Keyword,
    Semantic,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hybrid" => Ok(Mode::Hybrid),
            "keyword" => Ok(Mode::Keyword),
            "semantic" => Ok(Mode::Semantic),
            other => Err(format!(
                "unknown search mode '{other}', expected hybrid, keyword or semantic"
            )),
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Hybrid => "hybrid",
            Mode::Keyword => "keyword",
            Mode::Semantic => "semantic",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub mode: Mode,
    /// Restrict to photos with detections in these categories.
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
    /// 1-based.
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedLabel {
    pub label: String,
    pub confidence: f32,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub item: Item,
    /// Keyword score, cosine distance or RRF score depending on the mode.
    pub score: f32,
    pub matched_labels: Vec<MatchedLabel>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// First `max_chars` characters of `text`, with `...` when cut.
pub fn snippet(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

pub struct SearchEngine {
    catalog: Arc<dyn Catalog>,
    models: Arc<ModelService>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(catalog: Arc<dyn Catalog>, models: Arc<ModelService>, config: SearchConfig) -> Self {
        Self {
            catalog,
            models,
            config,
        }
    }

    /// Never fails: errors are reported in `SearchResponse::error` with no
    /// results. A hybrid search whose semantic half fails still returns the
    /// keyword results, along with the error.
    pub fn search(&self, request: &SearchRequest) -> SearchResponse {
        let (page, page_size) = self.pagination(request);

        match self.try_search(request, page, page_size) {
            Ok(response) => response,
            Err(e) => {
                log::error!("search for '{}' failed: {e}", request.query);
                SearchResponse {
                    results: vec![],
                    total: 0,
                    page,
                    page_size,
                    mode: request.mode,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn pagination(&self, request: &SearchRequest) -> (usize, usize) {
        let page = request.page.unwrap_or(1).max(1);
        let page_size = request
            .page_size
            .unwrap_or(self.config.page_size)
            .clamp(1, self.config.max_page_size);
        (page, page_size)
    }

    fn try_search(
        &self,
        request: &SearchRequest,
        page: usize,
        page_size: usize,
    ) -> Result<SearchResponse, SearchError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        let detections = self.category_detections(&request.categories)?;
        let candidates = self.candidates(request, detections.as_deref())?;

        let mut error = None;
        let ranked: Vec<(ItemId, f32)> = match request.mode {
            Mode::Keyword => self.keyword(query, detections.as_deref(), &candidates)?,
            Mode::Semantic => self.semantic(query, &candidates)?,
            Mode::Hybrid => {
                let keyword = self.keyword(query, detections.as_deref(), &candidates)?;
                let semantic = match self.semantic(query, &candidates) {
                    Ok(semantic) => semantic,
                    Err(e) => {
                        log::warn!("semantic ranking for '{query}' failed, using keyword only: {e}");
                        error = Some(e.to_string());
                        vec![]
                    }
                };

                let keyword_ids: Vec<ItemId> = keyword.iter().map(|(id, _)| *id).collect();
                let semantic_ids: Vec<ItemId> = semantic.iter().map(|(id, _)| *id).collect();

                fusion::rrf(&keyword_ids, &semantic_ids, self.config.rrf_k)
                    .into_iter()
                    .map(|result| (result.id, result.score))
                    .collect()
            }
        };

        log::debug!(
            "{} search for '{query}' over {} candidates matched {}",
            request.mode,
            candidates.len(),
            ranked.len()
        );

        let total = ranked.len();
        let results = ranked
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .map(|(id, score)| self.hit(id, score))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();

        Ok(SearchResponse {
            results,
            total,
            page,
            page_size,
            mode: request.mode,
            error,
        })
    }

    /// Detections within the requested categories, `None` when unfiltered.
    fn category_detections(
        &self,
        categories: &[String],
    ) -> Result<Option<Vec<DetectionInstance>>, SearchError> {
        if categories.is_empty() {
            return Ok(None);
        }

        let wanted: HashSet<String> = categories.iter().map(|c| c.to_lowercase()).collect();
        let detections = self
            .catalog
            .all_detections()?
            .into_iter()
            .filter(|detection| {
                detection
                    .category
                    .as_ref()
                    .is_some_and(|category| wanted.contains(&category.to_lowercase()))
            })
            .collect();

        Ok(Some(detections))
    }

    /// Completed items within the date range and, when filtering by category,
    /// with at least one detection in those categories.
    fn candidates(
        &self,
        request: &SearchRequest,
        category_detections: Option<&[DetectionInstance]>,
    ) -> Result<HashSet<ItemId>, SearchError> {
        let in_category: Option<HashSet<ItemId>> =
            category_detections.map(|detections| detections.iter().map(|d| d.item_id).collect());

        let candidates = self
            .catalog
            .items()?
            .into_iter()
            .filter(|item| item.state == ProcessingState::Completed)
            .filter(|item| request.date_from.map_or(true, |from| item.created_at >= from))
            .filter(|item| request.date_to.map_or(true, |to| item.created_at <= to))
            .filter(|item| {
                in_category
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&item.id))
            })
            .map(|item| item.id)
            .collect();

        Ok(candidates)
    }

    fn keyword(
        &self,
        query: &str,
        category_detections: Option<&[DetectionInstance]>,
        candidates: &HashSet<ItemId>,
    ) -> Result<Vec<(ItemId, f32)>, SearchError> {
        let texts = self.catalog.texts()?;

        let ranked = match category_detections {
            Some(detections) => {
                keyword::rank(query, &texts, detections, candidates, self.config.result_cap)
            }
            None => {
                let detections = self.catalog.all_detections()?;
                keyword::rank(query, &texts, &detections, candidates, self.config.result_cap)
            }
        };

        Ok(ranked)
    }

    fn semantic(
        &self,
        query: &str,
        candidates: &HashSet<ItemId>,
    ) -> Result<Vec<(ItemId, f32)>, SearchError> {
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let capabilities = self.models.capabilities()?;
        let query_vector = capabilities.text_embedder.embed_text(query)?;
        let embeddings = self.catalog.embeddings()?;

        Ok(semantic::rank(
            &query_vector,
            &embeddings,
            candidates,
            self.config.result_cap,
        ))
    }

    fn hit(&self, id: ItemId, score: f32) -> Result<Option<SearchHit>, SearchError> {
        let Some(item) = self.catalog.item(id)? else {
            return Ok(None);
        };

        let mut tags = self.catalog.unique_tags(id)?;
        tags.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let matched_labels = tags
            .into_iter()
            .take(self.config.max_matched_tags)
            .map(|tag| MatchedLabel {
                label: tag.label,
                confidence: tag.confidence,
                category: tag.category,
            })
            .collect();

        let snippet = self
            .catalog
            .text(id)?
            .map(|record| snippet(&record.text, self.config.snippet_chars));

        Ok(Some(SearchHit {
            item,
            score,
            matched_labels,
            snippet,
        }))
    }
}

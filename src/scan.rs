//! Library discovery: finds photos on disk and registers them in the catalog.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressIterator, ProgressStyle};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::catalog::{Catalog, CatalogError, ItemCreate, ItemId, ProcessingState};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Newly registered items.
    pub created: Vec<ItemId>,
    /// Known items still `pending` or `failed`.
    pub requeued: Vec<ItemId>,
    /// Known items in any other state.
    pub skipped: usize,
    /// Files with a photo extension whose content is not an image.
    pub rejected: usize,
}

impl ScanReport {
    /// Every id that needs a pipeline run.
    pub fn to_process(&self) -> Vec<ItemId> {
        self.created
            .iter()
            .chain(self.requeued.iter())
            .copied()
            .collect()
    }
}

pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        })
}

/// Whether the file content looks like an image. Files `infer` does not
/// recognize are given the benefit of the doubt.
fn looks_like_image(path: &Path) -> Result<bool, ScanError> {
    let kind = infer::get_from_path(path).map_err(|e| ScanError::Io(path.to_path_buf(), e))?;
    Ok(kind.map_or(true, |kind| kind.matcher_type() == infer::MatcherType::Image))
}

fn find_photos(dir: &Path, extensions: &[String], pb: ProgressBar) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .progress_with(pb)
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("skipping unreadable entry: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| has_extension(path, extensions))
        .collect();

    found.sort();
    found
}

fn progress_bar(enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }

    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    ProgressBar::no_length().with_style(style)
}

/// Registers every photo under `dir`.
///
/// New paths become `pending` items; known paths that are still `pending`
/// or `failed` are reported for requeueing, everything else is skipped.
pub fn scan(
    catalog: &dyn Catalog,
    dir: &Path,
    extensions: &[String],
    progress: bool,
) -> Result<ScanReport, ScanError> {
    if !dir.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }
    let dir = dir
        .canonicalize()
        .map_err(|e| ScanError::Io(dir.to_path_buf(), e))?;

    log::info!("scanning {}", dir.display());
    let files = find_photos(&dir, extensions, progress_bar(progress));
    log::info!("found {} candidate files", files.len());

    let mut report = ScanReport::default();
    let mut creates = vec![];

    let pb = progress_bar(progress);
    pb.set_length(files.len() as u64);

    for path in files.into_iter().progress_with(pb) {
        if let Some(existing) = catalog.item_by_path(&path)? {
            match existing.state {
                ProcessingState::Pending | ProcessingState::Failed => {
                    report.requeued.push(existing.id)
                }
                _ => report.skipped += 1,
            }
            continue;
        }

        if !looks_like_image(&path)? {
            log::warn!("{} is not an image, skipping", path.display());
            report.rejected += 1;
            continue;
        }

        let metadata = std::fs::metadata(&path).map_err(|e| ScanError::Io(path.clone(), e))?;
        let created_at = metadata.modified().ok().map(DateTime::<Utc>::from);

        creates.push(ItemCreate {
            path,
            file_size: Some(metadata.len()),
            created_at,
        });
    }

    for item in catalog.create_items(creates)? {
        log::debug!("registered item {} ({})", item.id, item.filename);
        report.created.push(item.id);
    }

    log::info!(
        "scan done: {} new, {} to retry, {} skipped, {} rejected",
        report.created.len(),
        report.requeued.len(),
        report.skipped,
        report.rejected
    );

    Ok(report)
}

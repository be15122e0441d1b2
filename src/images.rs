//! Image preprocessing: format normalization, dimensions and WebP thumbnails.

use std::path::{Path, PathBuf};

use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::{catalog::ItemId, storage::StorageManager};

const THUMBNAIL_QUALITY: f32 = 85.0;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("unsupported image format for {0}")]
    Unsupported(PathBuf),

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("failed to store {0}: {1}")]
    Store(String, std::io::Error),
}

/// Outcome of preprocessing one photo.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub width: u32,
    pub height: u32,
    pub file_size: u64,
    pub thumbnail_path: PathBuf,
    /// Set when the source had to be re-encoded for the inference stages.
    pub processed_path: Option<PathBuf>,
}

/// HEIF and camera RAW extensions. The decoder cannot read them, so they are
/// converted to JPEG by the inference sidecar first.
const CONVERTED_EXTENSIONS: &[&str] = &["heic", "heif", "cr2", "nef", "dng", "arw", "raw"];

pub fn needs_conversion(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CONVERTED_EXTENSIONS.iter().any(|c| c.eq_ignore_ascii_case(ext)))
}

/// Formats the inference stages consume as they are.
fn is_served_directly(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Jpeg | ImageFormat::Png)
}

/// Decodes `path`, re-encodes it to PNG into `processed` when its format is
/// not served directly, and writes a WebP thumbnail into `thumbnails`.
pub fn preprocess(
    id: ItemId,
    path: &Path,
    thumbnails: &dyn StorageManager,
    processed: &dyn StorageManager,
    thumbnail_size: u32,
) -> Result<Preprocessed, ImageError> {
    let data = std::fs::read(path).map_err(|e| ImageError::Io(path.to_path_buf(), e))?;
    let file_size = data.len() as u64;

    let format = detect_format(&data).ok_or_else(|| ImageError::Unsupported(path.to_path_buf()))?;
    let img = image::load_from_memory_with_format(&data, format)?;
    let (width, height) = img.dimensions();

    let processed_path = if is_served_directly(format) {
        None
    } else {
        log::debug!("re-encoding {} ({format:?}) to png", path.display());

        let ident = format!("{id}.png");
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)?;
        processed
            .write(&ident, &buf)
            .map_err(|e| ImageError::Store(ident.clone(), e))?;
        Some(processed.path_of(&ident))
    };

    Ok(Preprocessed {
        width,
        height,
        file_size,
        thumbnail_path: write_thumbnail(id, &img, thumbnails, thumbnail_size)?,
        processed_path,
    })
}

/// Like [`preprocess`] for a file the decoder cannot read, given its JPEG
/// conversion. The JPEG is stored into `processed` for the inference stages.
pub fn preprocess_converted(
    id: ItemId,
    path: &Path,
    converted: &[u8],
    thumbnails: &dyn StorageManager,
    processed: &dyn StorageManager,
    thumbnail_size: u32,
) -> Result<Preprocessed, ImageError> {
    let file_size = std::fs::metadata(path)
        .map_err(|e| ImageError::Io(path.to_path_buf(), e))?
        .len();

    let img = image::load_from_memory_with_format(converted, ImageFormat::Jpeg)?;
    let (width, height) = img.dimensions();

    let ident = format!("{id}.jpg");
    processed
        .write(&ident, converted)
        .map_err(|e| ImageError::Store(ident.clone(), e))?;

    Ok(Preprocessed {
        width,
        height,
        file_size,
        thumbnail_path: write_thumbnail(id, &img, thumbnails, thumbnail_size)?,
        processed_path: Some(processed.path_of(&ident)),
    })
}

fn write_thumbnail(
    id: ItemId,
    img: &DynamicImage,
    thumbnails: &dyn StorageManager,
    thumbnail_size: u32,
) -> Result<PathBuf, ImageError> {
    let ident = format!("{id}.webp");
    let thumbnail = thumbnail(img, thumbnail_size);
    thumbnails
        .write(&ident, &thumbnail)
        .map_err(|e| ImageError::Store(ident.clone(), e))?;
    Ok(thumbnails.path_of(&ident))
}

/// Resize to fit within `max_dimension` keeping the aspect ratio, then encode
/// to lossy WebP.
pub fn thumbnail(img: &DynamicImage, max_dimension: u32) -> Vec<u8> {
    let (orig_w, orig_h) = img.dimensions();

    let resized;
    let img = if orig_w > max_dimension || orig_h > max_dimension {
        resized = img.thumbnail(max_dimension, max_dimension);
        &resized
    } else {
        img
    };

    // webp encoder only accepts rgb(a)8
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();

    webp::Encoder::from_rgba(&rgba, width, height)
        .encode(THUMBNAIL_QUALITY)
        .to_vec()
}

/// Dimensions of the image at `path`, decoding it if needed.
pub fn dimensions(path: &Path) -> Result<(u32, u32), ImageError> {
    let reader = image::ImageReader::open(path)
        .map_err(|e| ImageError::Io(path.to_path_buf(), e))?
        .with_guessed_format()
        .map_err(|e| ImageError::Io(path.to_path_buf(), e))?;
    Ok(reader.into_dimensions()?)
}

pub fn detect_format(data: &[u8]) -> Option<ImageFormat> {
    image::guess_format(data).ok()
}

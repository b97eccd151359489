//! Plate cropping
//!
//! Cuts the plate region out of a zoom image with some surrounding margin,
//! which gives the recognizer a little context around the characters.

use image::{DynamicImage, GenericImageView};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::BoundingBox;

/// Default margin in pixels added on every side of a plate box
pub const DEFAULT_CROP_MARGIN: u32 = 15;

/// Pixel rectangle (x, y, width, height) of a box grown by `margin` and
/// clamped to an image of the given size.
///
/// Box coordinates are truncated toward zero first. Degenerate boxes yield a
/// zero-sized rectangle.
pub fn padded_rect(bbox: &BoundingBox, margin: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let margin = margin as i64;
    let (w, h) = (width as i64, height as i64);

    let x1 = (bbox.x1 as i64 - margin).clamp(0, w);
    let y1 = (bbox.y1 as i64 - margin).clamp(0, h);
    let x2 = (bbox.x2 as i64 + margin).min(w).max(x1);
    let y2 = (bbox.y2 as i64 + margin).min(h).max(y1);

    (x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32)
}

/// Crop a box plus margin out of an in-memory image
pub fn crop_region(image: &DynamicImage, bbox: &BoundingBox, margin: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (x, y, w, h) = padded_rect(bbox, margin, width, height);
    image.crop_imm(x, y, w, h)
}

/// Crop a plate out of the image at `source` and write it to `dest`.
///
/// Returns `None` when the source cannot be loaded or the crop cannot be
/// written (an empty crop cannot be encoded).
pub fn crop_plate(source: &Path, bbox: &BoundingBox, margin: u32, dest: &Path) -> Option<PathBuf> {
    let image = match open_image(source) {
        Ok(image) => image,
        Err(e) => {
            warn!("Failed to load image {:?} for cropping: {}", source, e);
            return None;
        }
    };

    let crop = crop_region(&image, bbox, margin);
    debug!(
        "Cropped plate {:?} from {:?} -> {}x{}",
        bbox.to_array(),
        source,
        crop.width(),
        crop.height()
    );

    // JPEG has no alpha channel
    let crop = DynamicImage::ImageRgb8(crop.to_rgb8());
    if let Err(e) = crop.save(dest) {
        warn!("Failed to write plate crop {:?}: {}", dest, e);
        return None;
    }

    Some(dest.to_path_buf())
}

/// Open an image, sniffing the format from content rather than extension
pub fn open_image(path: &Path) -> anyhow::Result<DynamicImage> {
    let image = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;
    Ok(image)
}

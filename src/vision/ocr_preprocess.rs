//! Image preprocessing for plate recognition
//!
//! Plate crops from zoom images are small and often low in contrast. The
//! recognizer does better on an enlarged, grayscale, histogram-equalized
//! version of the crop.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use tracing::debug;

/// Result of preprocessing together with the scale actually applied
pub struct PreprocessResult {
    /// Processed grayscale image
    pub image: GrayImage,
    /// Effective horizontal scale relative to the input
    pub scale_x: f32,
    /// Effective vertical scale relative to the input
    pub scale_y: f32,
}

/// Upscale, convert to grayscale and equalize a plate crop
pub fn prepare_plate_crop(image: &DynamicImage, upscale: f32) -> PreprocessResult {
    let (width, height) = (image.width(), image.height());

    let scaled = apply_upscale(image, upscale);
    let gray = scaled.to_luma8();
    let equalized = if gray.width() > 0 && gray.height() > 0 {
        imageproc::contrast::equalize_histogram(&gray)
    } else {
        gray
    };

    let (scale_x, scale_y) = if width > 0 && height > 0 {
        (
            equalized.width() as f32 / width as f32,
            equalized.height() as f32 / height as f32,
        )
    } else {
        (1.0, 1.0)
    };

    debug!(
        "Plate preprocessing {}x{} -> {}x{}",
        width,
        height,
        equalized.width(),
        equalized.height()
    );

    PreprocessResult {
        image: equalized,
        scale_x,
        scale_y,
    }
}

/// Resize by a factor with bilinear filtering. Factors at or below 1.0 and
/// empty images are returned unchanged.
pub fn apply_upscale(image: &DynamicImage, factor: f32) -> DynamicImage {
    if factor <= 1.0 || image.width() == 0 || image.height() == 0 {
        return image.clone();
    }

    let new_w = ((image.width() as f32) * factor).round().max(1.0) as u32;
    let new_h = ((image.height() as f32) * factor).round().max(1.0) as u32;
    image.resize_exact(new_w, new_h, FilterType::Triangle)
}

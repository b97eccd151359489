//! Object detection module
//!
//! Runs a YOLOv8-style ONNX export over uploaded images. The model finds
//! vehicles, violation classes and license plates; this module only turns
//! its raw output tensor into labelled boxes.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::Array4;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use super::models::OnnxSession;
use super::{BoundingBox, Detection, ObjectDetector};
use crate::config::DetectorSettings;

/// Gray value used by YOLO letterbox padding
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Mapping between model input space and the source image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
    /// Resize factor applied to the source
    pub scale: f32,
    /// Horizontal padding in model pixels
    pub pad_x: f32,
    /// Vertical padding in model pixels
    pub pad_y: f32,
    /// Source dimensions
    pub source_size: (u32, u32),
}

impl LetterboxTransform {
    /// Map a box from model input space back to source pixels, clamped
    pub fn to_source(&self, bbox: &BoundingBox) -> BoundingBox {
        let (w, h) = (self.source_size.0 as f32, self.source_size.1 as f32);
        let map_x = |x: f32| ((x - self.pad_x) / self.scale).clamp(0.0, w);
        let map_y = |y: f32| ((y - self.pad_y) / self.scale).clamp(0.0, h);

        BoundingBox {
            x1: map_x(bbox.x1),
            y1: map_y(bbox.y1),
            x2: map_x(bbox.x2),
            y2: map_y(bbox.y2),
        }
    }
}

/// Resize keeping aspect ratio, pad to a square and pack as NCHW in [0, 1]
pub fn letterbox(image: &DynamicImage, size: u32) -> (Array4<f32>, LetterboxTransform) {
    let (src_w, src_h) = image.dimensions();
    let scale = (size as f32 / src_w.max(1) as f32).min(size as f32 / src_h.max(1) as f32);

    let new_w = ((src_w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((src_h as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = image.resize_exact(new_w, new_h, FilterType::Triangle).to_rgb8();

    let side = size as usize;
    let mut tensor = Array4::from_elem((1, 3, side, side), PAD_VALUE);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + pad_x) as usize;
        let ty = (y + pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
        }
    }

    (
        tensor,
        LetterboxTransform {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            source_size: (src_w, src_h),
        },
    )
}

/// Decode raw YOLO output into detections in model input space.
///
/// Accepts `[1, 4+C, N]` (the usual export) and `[1, N, 4+C]`. Each candidate
/// takes its best class; candidates below `confidence_threshold` are dropped.
pub fn decode_output(
    shape: &[usize],
    data: &[f32],
    class_names: &[String],
    confidence_threshold: f32,
) -> Result<Vec<Detection>> {
    if shape.len() != 3 || shape[0] != 1 {
        anyhow::bail!("Unexpected detector output shape {:?}", shape);
    }

    // Prefer the layout matching the configured classes; otherwise anchors
    // far outnumber channels
    let expected_channels = 4 + class_names.len();
    let channel_major = if shape[1] == expected_channels {
        true
    } else if shape[2] == expected_channels {
        false
    } else {
        shape[1] <= shape[2]
    };
    let (channels, anchors) = if channel_major {
        (shape[1], shape[2])
    } else {
        (shape[2], shape[1])
    };

    if channels <= 4 {
        anyhow::bail!("Detector output has no class channels: {:?}", shape);
    }
    if data.len() < channels * anchors {
        anyhow::bail!(
            "Detector output holds {} values, shape {:?} needs {}",
            data.len(),
            shape,
            channels * anchors
        );
    }

    let value = |anchor: usize, channel: usize| -> f32 {
        if channel_major {
            data[channel * anchors + anchor]
        } else {
            data[anchor * channels + channel]
        }
    };

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let (class_id, score) = (4..channels)
            .map(|c| (c - 4, value(anchor, c)))
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });

        if score < confidence_threshold {
            continue;
        }

        let class_name = class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id));

        detections.push(Detection {
            class_name,
            bbox: BoundingBox::from_center(
                value(anchor, 0),
                value(anchor, 1),
                value(anchor, 2),
                value(anchor, 3),
            ),
            confidence: score,
        });
    }

    Ok(detections)
}

/// Class-aware non-maximum suppression. Output is sorted by confidence,
/// highest first.
pub fn non_maximum_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|existing| {
            existing.class_name == candidate.class_name
                && existing.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }

    kept
}

/// YOLO detector backed by ONNX Runtime
pub struct YoloDetector {
    session: OnnxSession,
    settings: DetectorSettings,
}

impl YoloDetector {
    /// Load the detector model
    pub fn load(model_path: &Path, settings: DetectorSettings) -> Result<Self> {
        let session = OnnxSession::new(model_path)
            .with_context(|| format!("Failed to load detector model {:?}", model_path))?;

        info!(
            "Detector ready: {} classes, input {}x{}",
            settings.class_names.len(),
            settings.input_size,
            settings.input_size
        );

        Ok(Self { session, settings })
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let start = Instant::now();

        let (tensor, transform) = letterbox(image, self.settings.input_size);
        let output = self.session.run(tensor)?;

        let candidates = decode_output(
            &output.shape,
            &output.data,
            &self.settings.class_names,
            self.settings.confidence_threshold,
        )?;
        let detections: Vec<Detection> =
            non_maximum_suppression(candidates, self.settings.iou_threshold)
                .into_iter()
                .map(|d| Detection {
                    bbox: transform.to_source(&d.bbox),
                    ..d
                })
                .collect();

        debug!(
            "Detection complete in {:?}: {} objects {:?}",
            start.elapsed(),
            detections.len(),
            detections.iter().map(|d| d.class_name.as_str()).collect::<Vec<_>>()
        );

        Ok(detections)
    }
}

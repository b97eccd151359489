//! Text region detection
//!
//! Finds the separate text groups inside a plate crop with the PaddleOCR
//! DBNet detector. The network outputs a per-pixel text probability map,
//! which is binarized and split into connected regions. Each region is grown
//! back out (the network predicts shrunken text kernels) and mapped to image
//! pixels.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::Array4;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use super::models::OnnxSession;
use super::BoundingBox;
use crate::config::OcrSettings;

/// ImageNet statistics the detection network was trained with
const DET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const DET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Input sides must be multiples of the network stride
const DET_STRIDE: u32 = 32;

/// Regions with a shorter side in map pixels are dropped
const MIN_REGION_SIDE: f32 = 3.0;

/// Upper bound on regions taken from one map
const MAX_CANDIDATES: usize = 1000;

/// Regions whose tops differ by less than this (image pixels) share a line
const LINE_TOLERANCE: f32 = 10.0;

/// Finds text regions in an image
pub trait TextRegionDetector: Send + Sync {
    /// Boxes in image pixels, in reading order
    fn find_regions(&self, image: &DynamicImage) -> Result<Vec<BoundingBox>>;
}

/// Probability map post-processing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionParams {
    /// Pixels above this probability count as text
    pub threshold: f32,
    /// Minimum mean probability over a region
    pub box_threshold: f32,
    /// Growth of a region, as a multiple of its area over its perimeter
    pub unclip_ratio: f32,
}

impl From<&OcrSettings> for RegionParams {
    fn from(settings: &OcrSettings) -> Self {
        Self {
            threshold: settings.det_threshold,
            box_threshold: settings.det_box_threshold,
            unclip_ratio: settings.det_unclip_ratio,
        }
    }
}

/// DBNet text detector over ONNX Runtime
pub struct DbTextDetector {
    session: OnnxSession,
    limit_side: u32,
    params: RegionParams,
}

impl DbTextDetector {
    pub fn load(model_path: &Path, settings: &OcrSettings) -> Result<Self> {
        let session = OnnxSession::new(model_path)
            .with_context(|| format!("Failed to load text detection model {:?}", model_path))?;

        info!("Text region detector ready (limit side {})", settings.det_limit_side);

        Ok(Self {
            session,
            limit_side: settings.det_limit_side,
            params: RegionParams::from(settings),
        })
    }

    fn to_tensor(&self, image: &DynamicImage) -> Array4<f32> {
        let (w, h) = input_size(image.width(), image.height(), self.limit_side);
        let resized = image.resize_exact(w, h, FilterType::Triangle).to_rgb8();

        let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 / 255.0 - DET_MEAN[c]) / DET_STD[c];
            }
        }
        tensor
    }
}

impl TextRegionDetector for DbTextDetector {
    fn find_regions(&self, image: &DynamicImage) -> Result<Vec<BoundingBox>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(vec![]);
        }

        let output = self.session.run(self.to_tensor(image))?;
        if output.shape.len() != 4 {
            anyhow::bail!("Unexpected text detector output shape {:?}", output.shape);
        }
        let (map_h, map_w) = (output.shape[2], output.shape[3]);

        let regions = regions_from_map(
            &output.data,
            map_w,
            map_h,
            &self.params,
            image.width(),
            image.height(),
        );
        debug!("Found {} text region(s)", regions.len());
        Ok(regions)
    }
}

/// Network input size for an image: the longest side is capped at
/// `limit_side`, then both sides are rounded to the stride (at least one
/// stride).
pub fn input_size(width: u32, height: u32, limit_side: u32) -> (u32, u32) {
    let longest = width.max(height).max(1) as f32;
    let scale = if longest > limit_side as f32 {
        limit_side as f32 / longest
    } else {
        1.0
    };

    let round = |side: u32| {
        let scaled = (side as f32 * scale).round() as u32;
        ((scaled + DET_STRIDE / 2) / DET_STRIDE * DET_STRIDE).max(DET_STRIDE)
    };
    (round(width), round(height))
}

#[derive(Debug)]
struct RegionStats {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    score_sum: f32,
    pixels: u32,
}

impl RegionStats {
    fn new(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            score_sum: 0.0,
            pixels: 0,
        }
    }

    fn add(&mut self, x: u32, y: u32, score: f32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
        self.score_sum += score;
        self.pixels += 1;
    }

    fn mean_score(&self) -> f32 {
        self.score_sum / self.pixels.max(1) as f32
    }
}

/// Turn a row-major `[height, width]` text probability map into boxes in the
/// pixels of a `src_w` x `src_h` image, in reading order.
pub fn regions_from_map(
    probs: &[f32],
    width: usize,
    height: usize,
    params: &RegionParams,
    src_w: u32,
    src_h: u32,
) -> Vec<BoundingBox> {
    if width == 0 || height == 0 || probs.len() < width * height {
        return vec![];
    }

    let at = |x: u32, y: u32| probs[y as usize * width + x as usize];
    let mask = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([if at(x, y) > params.threshold { 255 } else { 0 }])
    });
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    let mut stats: BTreeMap<u32, RegionStats> = BTreeMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        if label[0] == 0 {
            continue;
        }
        stats
            .entry(label[0])
            .or_insert_with(|| RegionStats::new(x, y))
            .add(x, y, at(x, y));
    }

    let scale_x = src_w as f32 / width as f32;
    let scale_y = src_h as f32 / height as f32;
    let (map_w, map_h) = (width as f32, height as f32);

    let mut regions: Vec<BoundingBox> = stats
        .values()
        .take(MAX_CANDIDATES)
        .filter_map(|s| {
            let w = (s.max_x - s.min_x + 1) as f32;
            let h = (s.max_y - s.min_y + 1) as f32;
            if w.min(h) < MIN_REGION_SIDE || s.mean_score() < params.box_threshold {
                return None;
            }

            let offset = w * h * params.unclip_ratio / (2.0 * (w + h));
            Some(BoundingBox::new(
                (s.min_x as f32 - offset).max(0.0) * scale_x,
                (s.min_y as f32 - offset).max(0.0) * scale_y,
                ((s.max_x + 1) as f32 + offset).min(map_w) * scale_x,
                ((s.max_y + 1) as f32 + offset).min(map_h) * scale_y,
            ))
        })
        .collect();

    sort_reading_order(&mut regions);
    regions
}

/// Top to bottom, then left to right within a line
fn sort_reading_order(regions: &mut [BoundingBox]) {
    regions.sort_by(|a, b| a.y1.total_cmp(&b.y1).then(a.x1.total_cmp(&b.x1)));

    for i in 1..regions.len() {
        for j in (1..=i).rev() {
            let (prev, cur) = (regions[j - 1], regions[j]);
            if (cur.y1 - prev.y1).abs() < LINE_TOLERANCE && cur.x1 < prev.x1 {
                regions.swap(j - 1, j);
            } else {
                break;
            }
        }
    }
}

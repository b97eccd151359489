//! OCR (Optical Character Recognition) module
//!
//! Reads plate text from cropped plate images with PaddleOCR networks on
//! ONNX Runtime: a DBNet detector splits the crop into text regions and a
//! CRNN + CTC recognizer reads each region.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use std::path::Path;
use tracing::{debug, info, warn};

use super::crop::{crop_region, open_image};
use super::models::OnnxSession;
use super::ocr_preprocess::prepare_plate_crop;
use super::text_detection::TextRegionDetector;
use super::{TextReading, TextRecognizer};
use crate::analysis::normalize_plate_opt;
use crate::config::OcrSettings;

/// Input height expected by the recognition network
const REC_INPUT_HEIGHT: u32 = 48;

/// CTC blank index
const CTC_BLANK: usize = 0;

/// Text recognizer using a PaddleOCR CRNN export
pub struct CrnnRecognizer {
    session: OnnxSession,
    /// Index 0 is the CTC blank, the last entry is a space
    charset: Vec<String>,
    max_input_width: u32,
    min_confidence: f32,
}

impl CrnnRecognizer {
    /// Load the recognition model and its character dictionary
    pub fn load(model_path: &Path, dictionary_path: &Path, settings: &OcrSettings) -> Result<Self> {
        let session = OnnxSession::new(model_path)
            .with_context(|| format!("Failed to load recognizer model {:?}", model_path))?;
        let dictionary = std::fs::read_to_string(dictionary_path)
            .with_context(|| format!("Failed to read dictionary {:?}", dictionary_path))?;
        let charset = build_charset(&dictionary);

        info!("Recognizer ready: {} symbols", charset.len());

        Ok(Self {
            session,
            charset,
            max_input_width: settings.max_input_width,
            min_confidence: settings.min_confidence,
        })
    }

    /// Resize to the network height and pack as NCHW normalized to [-1, 1].
    /// Width follows the aspect ratio up to `max_input_width`.
    fn to_tensor(&self, image: &DynamicImage) -> Array4<f32> {
        let (w, h) = (image.width().max(1), image.height().max(1));
        let ratio = w as f32 / h as f32;
        let target_w = ((REC_INPUT_HEIGHT as f32 * ratio).ceil() as u32).clamp(1, self.max_input_width);

        let resized = image
            .resize_exact(target_w, REC_INPUT_HEIGHT, FilterType::Triangle)
            .to_rgb8();

        // Right side stays zero-padded up to the maximum width
        let mut tensor = Array4::<f32>::zeros((
            1,
            3,
            REC_INPUT_HEIGHT as usize,
            self.max_input_width as usize,
        ));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 / 255.0 - 0.5) / 0.5;
            }
        }
        tensor
    }
}

impl TextRecognizer for CrnnRecognizer {
    fn recognize(&self, image: &DynamicImage) -> Result<Vec<TextReading>> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(vec![]);
        }

        let output = self.session.run(self.to_tensor(image))?;
        if output.shape.len() != 3 {
            anyhow::bail!("Unexpected recognizer output shape {:?}", output.shape);
        }

        let (steps, classes) = (output.shape[1], output.shape[2]);
        let reading = ctc_greedy_decode(&output.data, steps, classes, &self.charset);

        Ok(reading
            .into_iter()
            .filter(|r| r.confidence >= self.min_confidence)
            .collect())
    }
}

/// Recognizes every text region of an image separately, giving one reading
/// per region. The whole image is read when no region is found.
pub struct RegionRecognizer<D, R> {
    regions: D,
    recognizer: R,
}

impl<D: TextRegionDetector, R: TextRecognizer> RegionRecognizer<D, R> {
    pub fn new(regions: D, recognizer: R) -> Self {
        Self { regions, recognizer }
    }
}

impl<D: TextRegionDetector, R: TextRecognizer> TextRecognizer for RegionRecognizer<D, R> {
    fn recognize(&self, image: &DynamicImage) -> Result<Vec<TextReading>> {
        let regions = self.regions.find_regions(image)?;
        if regions.is_empty() {
            debug!("No text regions, reading the whole crop");
            return self.recognizer.recognize(image);
        }

        let mut readings = Vec::with_capacity(regions.len());
        for region in &regions {
            let crop = crop_region(image, region, 0);
            if crop.width() == 0 || crop.height() == 0 {
                continue;
            }
            readings.extend(self.recognizer.recognize(&crop)?);
        }
        Ok(readings)
    }
}

/// Build the decoding table from a dictionary file: blank, one symbol per
/// line, then a space
pub fn build_charset(dictionary: &str) -> Vec<String> {
    let mut charset = vec!["".to_string()];
    charset.extend(
        dictionary
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string),
    );
    charset.push(" ".to_string());
    charset
}

/// Greedy CTC decoding of a `[steps, classes]` probability matrix.
///
/// Takes the best class per step, collapses repeats and drops blanks.
/// Confidence is the mean probability of the kept steps. Returns `None` when
/// nothing but blanks was emitted.
pub fn ctc_greedy_decode(
    probs: &[f32],
    steps: usize,
    classes: usize,
    charset: &[String],
) -> Option<TextReading> {
    let mut text = String::new();
    let mut scores = Vec::new();
    let mut previous = CTC_BLANK;

    for step in 0..steps {
        let row = match probs.get(step * classes..(step + 1) * classes) {
            Some(row) => row,
            None => break,
        };
        let (index, score) = row
            .iter()
            .copied()
            .enumerate()
            .fold((CTC_BLANK, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });

        if index != CTC_BLANK && index != previous {
            if let Some(symbol) = charset.get(index) {
                text.push_str(symbol);
                scores.push(score);
            }
        }
        previous = index;
    }

    if text.is_empty() {
        return None;
    }

    let confidence = scores.iter().sum::<f32>() / scores.len() as f32;
    Some(TextReading { text, confidence })
}

/// Pick the presumed plate from several readings: the longest text wins and
/// the earliest reading breaks ties. Recognition failures tend to drop
/// characters rather than invent them.
pub fn pick_plate_text(readings: &[TextReading]) -> Option<&str> {
    readings
        .iter()
        .fold(None::<&TextReading>, |best, reading| match best {
            Some(b) if b.text.chars().count() >= reading.text.chars().count() => Some(b),
            _ => Some(reading),
        })
        .map(|r| r.text.as_str())
}

/// Read and normalize the plate in the crop at `crop_path`.
///
/// An unreadable crop or an empty recognition result gives `Ok(None)`.
/// Recognizer failures propagate.
pub fn read_plate(
    recognizer: &dyn TextRecognizer,
    crop_path: &Path,
    upscale: f32,
) -> Result<Option<String>> {
    let crop = match open_image(crop_path) {
        Ok(image) => image,
        Err(e) => {
            warn!("Failed to load plate crop {:?}: {}", crop_path, e);
            return Ok(None);
        }
    };

    read_plate_image(recognizer, &crop, upscale)
}

/// Same as [`read_plate`] for an in-memory crop
pub fn read_plate_image(
    recognizer: &dyn TextRecognizer,
    crop: &DynamicImage,
    upscale: f32,
) -> Result<Option<String>> {
    let prepared = prepare_plate_crop(crop, upscale);
    debug!(
        "Recognizing plate crop at {:.2}x{:.2} scale",
        prepared.scale_x, prepared.scale_y
    );

    let readings = recognizer.recognize(&DynamicImage::ImageLuma8(prepared.image))?;
    let raw = pick_plate_text(&readings);
    let plate = normalize_plate_opt(raw);
    debug!("Plate read {:?} -> {:?}", raw, plate);
    Ok(plate)
}

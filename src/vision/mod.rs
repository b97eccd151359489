//! Vision Layer
//!
//! Wraps the pretrained models the workflow consumes:
//! - an object detector that finds vehicles, violation classes and plates
//! - a text recognizer that reads cropped plates, one text region at a time
//!
//! Both sit behind traits so alternate backends can be swapped in without
//! touching the workflow.

pub mod crop;
pub mod detection;
pub mod models;
pub mod ocr;
pub mod ocr_preprocess;
pub mod text_detection;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

pub use crop::{crop_plate, crop_region};
pub use detection::YoloDetector;
pub use models::{ModelManager, ModelType};
pub use ocr::{read_plate, CrnnRecognizer, RegionRecognizer};
pub use text_detection::DbTextDetector;

/// Axis-aligned box in source image pixels (corner form)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from center form (cx, cy, w, h)
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union with another box
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x_left = self.x1.max(other.x1);
        let y_top = self.y1.max(other.y1);
        let x_right = self.x2.min(other.x2);
        let y_bottom = self.y2.min(other.y2);

        if x_right <= x_left || y_bottom <= y_top {
            return 0.0;
        }

        let intersection = (x_right - x_left) * (y_bottom - y_top);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Corner coordinates as `[x1, y1, x2, y2]`
    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// One object found by the detector
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Class label from the model's label set
    pub class_name: String,
    /// Box in source image pixels
    pub bbox: BoundingBox,
    /// Class score (0.0 - 1.0)
    pub confidence: f32,
}

/// Text read from an image region
#[derive(Debug, Clone, PartialEq)]
pub struct TextReading {
    /// Recognized text
    pub text: String,
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
}

/// First detection whose class starts with `prefix` (case-sensitive), in
/// model order
pub fn first_with_prefix<'a>(detections: &'a [Detection], prefix: &str) -> Option<&'a Detection> {
    detections.iter().find(|d| d.class_name.starts_with(prefix))
}

/// First detection of `class`, compared case-insensitively
pub fn first_with_class<'a>(detections: &'a [Detection], class: &str) -> Option<&'a Detection> {
    detections
        .iter()
        .find(|d| d.class_name.eq_ignore_ascii_case(class))
}

/// Detects objects in an image
pub trait ObjectDetector: Send + Sync {
    /// Run detection. Ordering of the returned detections is backend-defined.
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>>;
}

/// Reads text in an image
pub trait TextRecognizer: Send + Sync {
    /// Return zero or more candidate readings for the image
    fn recognize(&self, image: &DynamicImage) -> Result<Vec<TextReading>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_center() {
        let b = BoundingBox::from_center(50.0, 40.0, 20.0, 10.0);
        assert_eq!(b.to_array(), [40.0, 35.0, 60.0, 45.0]);
        assert!((b.area() - 200.0).abs() < 1e-4);
    }

    #[test]
    fn test_iou() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        let c = BoundingBox::new(20.0, 20.0, 30.0, 30.0);

        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn test_degenerate_box_has_no_area() {
        let b = BoundingBox::new(10.0, 10.0, 5.0, 5.0);
        assert_eq!(b.area(), 0.0);
        assert_eq!(b.iou(&BoundingBox::new(0.0, 0.0, 20.0, 20.0)), 0.0);
    }
}

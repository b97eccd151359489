//! Stand-in detector and recognizer for tests

use anyhow::Result;
use image::DynamicImage;
use parking_lot::Mutex;
use std::collections::VecDeque;

use super::{Detection, ObjectDetector, TextReading, TextRecognizer};

/// Returns queued detection lists, one per call, then nothing
pub struct ScriptedDetector(Mutex<VecDeque<Vec<Detection>>>);

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<Detection>>) -> Self {
        Self(Mutex::new(script.into()))
    }
}

impl ObjectDetector for ScriptedDetector {
    fn detect(&self, _image: &DynamicImage) -> Result<Vec<Detection>> {
        Ok(self.0.lock().pop_front().unwrap_or_default())
    }
}

/// Always reads the same text; an empty string reads nothing
pub struct FixedRecognizer(pub &'static str);

impl TextRecognizer for FixedRecognizer {
    fn recognize(&self, _image: &DynamicImage) -> Result<Vec<TextReading>> {
        if self.0.is_empty() {
            return Ok(vec![]);
        }
        Ok(vec![TextReading {
            text: self.0.to_string(),
            confidence: 0.9,
        }])
    }
}

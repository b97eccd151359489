//! Analysis Layer
//!
//! Turns raw detector output into parking decisions: which detection counts
//! as a violation, which one is the plate, and how recognized plate text is
//! normalized.

pub mod plate;

pub use plate::normalize_plate_opt;

use serde::{Deserialize, Serialize};

use crate::config::WorkflowSettings;
use crate::vision::{first_with_class, first_with_prefix, Detection};

/// What to do when the detector reports a violation class that has no
/// matching violation type in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownClassPolicy {
    /// Fail open: report the vehicle as properly parked
    #[default]
    TreatAsCompliant,
    /// Report the unregistered class as an error
    Reject,
}

/// Class-name rules applied to detector output
#[derive(Debug, Clone)]
pub struct ViolationPolicy {
    /// Prefix shared by every violation class label
    pub violation_class_prefix: String,
    /// Class label of the license plate detection (compared case-insensitively)
    pub plate_class: String,
    /// Handling of violation classes missing from the database
    pub unknown_class: UnknownClassPolicy,
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        Self {
            violation_class_prefix: "NepropisnoParkirano".to_string(),
            plate_class: "tablica".to_string(),
            unknown_class: UnknownClassPolicy::TreatAsCompliant,
        }
    }
}

impl From<&WorkflowSettings> for ViolationPolicy {
    fn from(settings: &WorkflowSettings) -> Self {
        Self {
            violation_class_prefix: settings.violation_class_prefix.clone(),
            plate_class: settings.plate_class.clone(),
            unknown_class: settings.unknown_class_policy,
        }
    }
}

impl ViolationPolicy {
    /// First detection whose class marks a parking violation.
    ///
    /// Detections are scanned in model order, so with several violation boxes
    /// the result depends on the detector's ordering.
    pub fn find_violation<'a>(&self, detections: &'a [Detection]) -> Option<&'a Detection> {
        first_with_prefix(detections, &self.violation_class_prefix)
    }

    /// First detection of the plate class
    pub fn find_plate<'a>(&self, detections: &'a [Detection]) -> Option<&'a Detection> {
        first_with_class(detections, &self.plate_class)
    }
}

//! # Vision Pipeline Interface
//!
//! Detections as produced by the external detector and multi-object tracker, once per processed
//! frame.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// Stable identifier assigned to a detection by the tracker.
pub type TrackId = u64;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A single detected balloon.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Left edge of the bounding box.
    ///
    /// Units: pixels
    pub x: f64,

    /// Top edge of the bounding box.
    ///
    /// Units: pixels
    pub y: f64,

    /// Width of the bounding box.
    ///
    /// Units: pixels
    pub w: f64,

    /// Height of the bounding box.
    ///
    /// Units: pixels
    pub h: f64,

    /// Detector confidence in [0, 1]
    #[serde(default)]
    pub score: f64,

    /// Identifier from the tracker, `None` for untracked detections
    #[serde(default, alias = "id")]
    pub track_id: Option<TrackId>,
}

/// All detections from one processed frame.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DetectionBatch {
    /// Time the frame was processed, if the pipeline provides it
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    pub detections: Vec<Detection>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Detection {
    pub fn new(x: f64, y: f64, w: f64, h: f64, score: f64, track_id: Option<TrackId>) -> Self {
        Self {
            x,
            y,
            w,
            h,
            score,
            track_id,
        }
    }

    /// Centre of the bounding box in pixels.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Area of the bounding box in square pixels.
    pub fn area(&self) -> f64 {
        self.w * self.h
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_detection_json() {
        let d: Detection =
            serde_json::from_str(r#"{"x": 100, "y": 100, "w": 20, "h": 20, "score": 0.9, "id": 1}"#)
                .unwrap();

        assert_eq!(d.track_id, Some(1));
        assert_eq!(d.center(), (110.0, 110.0));
        assert_eq!(d.area(), 400.0);

        let untracked: Detection =
            serde_json::from_str(r#"{"x": 0, "y": 0, "w": 4, "h": 2}"#).unwrap();
        assert_eq!(untracked.track_id, None);
        assert_eq!(untracked.score, 0.0);
    }
}

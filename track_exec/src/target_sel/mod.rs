//! # Target selector module
//!
//! Each control tick the selector picks the balloon to follow from the latest detection batch.
//!
//! With a locked track ID the selector follows that track only. If the track goes missing it
//! holds (returns no target) for up to `max_lost_frames` ticks, then follows the largest balloon
//! for one tick and starts counting again. Without a lock the largest balloon is always followed.
//! Area ties go to the first detection in the batch.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod params;

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use params::*;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{info, warn};
use serde::Serialize;

// Internal
use comms_if::eqpt::vision::{Detection, TrackId};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The target resolved for one control tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlTarget {
    /// Units: pixels
    pub center_x: f64,

    /// Units: pixels
    pub center_y: f64,

    /// Units: pixels
    pub width: f64,

    /// Units: pixels
    pub height: f64,

    pub track_id: Option<TrackId>,
}

#[derive(Debug, Clone)]
pub struct TargetSelector {
    params: TargetSelParams,

    locked_track_id: Option<TrackId>,

    /// Number of consecutive ticks the locked track has been missing
    lost_count: u32,

    /// Centre of the locked track when last seen
    last_known_center: Option<(f64, f64)>,

    /// True while the largest balloon is followed in place of the lost lock
    fallback_active: bool,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Outcome of a selection, with the reason for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection {
    /// The locked track was found
    Locked(ControlTarget),

    /// No lock is set, the largest balloon was chosen
    Largest(ControlTarget),

    /// The locked track has been lost for too long and the largest balloon is followed for this
    /// tick.
    ///
    /// `switched` is set on the first fallback since the lock was last seen.
    Fallback {
        target: ControlTarget,
        switched: bool,
    },

    /// The locked track is missing, hold still
    Lost,

    /// Nothing to follow
    NoTarget,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ControlTarget {
    pub fn from_detection(det: &Detection) -> Self {
        let (center_x, center_y) = det.center();

        Self {
            center_x,
            center_y,
            width: det.w,
            height: det.h,
            track_id: det.track_id,
        }
    }
}

impl Selection {
    pub fn target(&self) -> Option<ControlTarget> {
        match self {
            Selection::Locked(t) | Selection::Largest(t) => Some(*t),
            Selection::Fallback { target, .. } => Some(*target),
            Selection::Lost | Selection::NoTarget => None,
        }
    }
}

impl TargetSelector {
    pub fn new(params: TargetSelParams) -> Self {
        Self {
            params,
            locked_track_id: None,
            lost_count: 0,
            last_known_center: None,
            fallback_active: false,
        }
    }

    /// Pick the target for this tick.
    pub fn select(&mut self, detections: &[Detection]) -> Option<ControlTarget> {
        self.select_detailed(detections).target()
    }

    /// Pick the target for this tick, reporting why it was chosen.
    pub fn select_detailed(&mut self, detections: &[Detection]) -> Selection {
        if detections.is_empty() {
            self.lost_count = self.lost_count.saturating_add(1);
            return Selection::NoTarget;
        }

        let locked_id = match self.locked_track_id {
            Some(id) => id,
            None => {
                return match largest(detections) {
                    Some(t) => {
                        self.lost_count = 0;
                        Selection::Largest(t)
                    }
                    None => Selection::NoTarget,
                }
            }
        };

        // Locked track present
        if let Some(det) = detections.iter().find(|d| d.track_id == Some(locked_id)) {
            let target = ControlTarget::from_detection(det);

            if self.fallback_active {
                info!("Locked track {} reacquired", locked_id);
            }

            self.lost_count = 0;
            self.fallback_active = false;
            self.last_known_center = Some((target.center_x, target.center_y));

            return Selection::Locked(target);
        }

        self.lost_count = self.lost_count.saturating_add(1);

        if self.lost_count <= self.params.max_lost_frames {
            return Selection::Lost;
        }

        match largest(detections) {
            Some(target) => {
                let switched = !self.fallback_active;

                if switched {
                    warn!(
                        "Track {} lost for {} frames, switching to the largest balloon",
                        locked_id, self.lost_count
                    );
                }

                // Hold for another max_lost_frames before the next fallback
                self.lost_count = 0;
                self.fallback_active = true;

                Selection::Fallback { target, switched }
            }
            None => Selection::Lost,
        }
    }

    /// Set the track to lock onto, or `None` to follow the largest balloon.
    pub fn update_tracking_target(&mut self, track_id: Option<TrackId>) {
        if track_id != self.locked_track_id {
            self.lost_count = 0;
            self.fallback_active = false;
            self.last_known_center = None;
        }

        self.locked_track_id = track_id;

        match track_id {
            Some(id) => info!("Tracking target set to track {}", id),
            None => info!("Tracking target set to the largest balloon"),
        }
    }

    /// Clear the lock loss state, keeping the lock.
    pub fn reset(&mut self) {
        self.lost_count = 0;
        self.fallback_active = false;
        self.last_known_center = None;
    }

    pub fn locked_track_id(&self) -> Option<TrackId> {
        self.locked_track_id
    }

    pub fn lost_count(&self) -> u32 {
        self.lost_count
    }

    pub fn last_known_center(&self) -> Option<(f64, f64)> {
        self.last_known_center
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Largest detection by area, the first one winning ties. Degenerate boxes are never chosen.
fn largest(detections: &[Detection]) -> Option<ControlTarget> {
    let mut best: Option<&Detection> = None;
    let mut best_area = 0.0;

    for det in detections {
        let area = det.area();
        if area > best_area {
            best_area = area;
            best = Some(det);
        }
    }

    best.map(ControlTarget::from_detection)
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

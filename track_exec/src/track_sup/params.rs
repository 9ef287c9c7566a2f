//! # Tracking supervisor parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::Deserialize;
use std::time::Duration;

// Internal
use util::time::seconds_to_duration;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TrackSupParams {
    /// Period of the control loop.
    ///
    /// Units: seconds
    pub control_period_s: f64,

    /// Maximum time to wait for the control loop to exit when tracking is stopped.
    ///
    /// Units: seconds
    pub stop_join_timeout_s: f64,
}

impl TrackSupParams {
    pub fn control_period(&self) -> Duration {
        seconds_to_duration(self.control_period_s)
    }

    pub fn stop_join_timeout(&self) -> Duration {
        seconds_to_duration(self.stop_join_timeout_s)
    }
}

impl Default for TrackSupParams {
    fn default() -> Self {
        Self {
            control_period_s: 0.1,
            stop_join_timeout_s: 1.5,
        }
    }
}

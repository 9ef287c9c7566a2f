//! # Servo driver parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::Deserialize;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Speed limits and conventions of the two axes.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServoParams {
    /// Maximum speed magnitude of either axis.
    ///
    /// Units: RPM
    pub max_speed_rpm: i32,

    /// Speeds with a smaller magnitude than this are not sent to the drives.
    ///
    /// Units: RPM
    pub min_speed_rpm: i32,

    /// Exponential smoothing factor applied to speed demands, in (0, 1]. A value of 1 disables
    /// smoothing.
    pub speed_smoothing: f64,

    /// Invert the pan axis due to the way it is mounted
    pub invert_pan: bool,

    /// Invert the tilt axis due to the way it is mounted
    pub invert_tilt: bool,
}

impl Default for ServoParams {
    fn default() -> Self {
        Self {
            max_speed_rpm: 10,
            min_speed_rpm: 1,
            speed_smoothing: 0.7,
            invert_pan: true,
            invert_tilt: true,
        }
    }
}

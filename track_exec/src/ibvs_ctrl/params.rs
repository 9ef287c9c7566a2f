//! IBVS controller parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::Deserialize;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Parameters for the image based controller
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct IbvsParams {
    /// Control law used to convert the pixel error into speeds
    pub control_law: ControlLaw,

    /// Errors smaller than this are treated as zero.
    ///
    /// Units: pixels
    pub deadzone_px: f64,

    /// Gain of the proportional control law.
    ///
    /// Units: RPM/pixel
    pub speed_scale_factor: f64,

    /// Pan controller proportional gain
    pub pan_k_p: f64,

    /// Pan controller integral gain
    pub pan_k_i: f64,

    /// Pan controller derivative gain
    pub pan_k_d: f64,

    /// Tilt controller proportional gain
    pub tilt_k_p: f64,

    /// Tilt controller integral gain
    pub tilt_k_i: f64,

    /// Tilt controller derivative gain
    pub tilt_k_d: f64,

    /// Below this error magnitude (and outside the deadzone) the proportional and integral gains
    /// are boosted.
    ///
    /// Units: pixels
    pub gain_boost_threshold_px: f64,

    /// Multiplier applied to the boosted gains
    pub gain_boost_factor: f64,

    /// Limit of the magnitude of each integral term.
    ///
    /// Units: pixel seconds
    pub integral_limit: f64,
}

/// Camera geometry.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CameraParams {
    /// Units: pixels
    pub width: u32,

    /// Units: pixels
    pub height: u32,

    /// Principal point x coordinate, defaults to the centre of the frame.
    ///
    /// Units: pixels
    pub cx: Option<f64>,

    /// Principal point y coordinate, defaults to the centre of the frame.
    ///
    /// Units: pixels
    pub cy: Option<f64>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLaw {
    /// PID with adaptive gain and progressive damping
    Ibvs,

    /// Error times `speed_scale_factor`
    Proportional,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl CameraParams {
    /// Principal point of the camera.
    pub fn principal_point(&self) -> (f64, f64) {
        (
            self.cx.unwrap_or((self.width / 2) as f64),
            self.cy.unwrap_or((self.height / 2) as f64),
        )
    }
}

impl Default for IbvsParams {
    fn default() -> Self {
        Self {
            control_law: ControlLaw::Ibvs,
            deadzone_px: 8.0,
            speed_scale_factor: 2.0,
            pan_k_p: 0.3,
            pan_k_i: 0.05,
            pan_k_d: 0.1,
            tilt_k_p: 0.3,
            tilt_k_i: 0.05,
            tilt_k_d: 0.1,
            gain_boost_threshold_px: 25.0,
            gain_boost_factor: 1.8,
            integral_limit: 200.0,
        }
    }
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            cx: None,
            cy: None,
        }
    }
}

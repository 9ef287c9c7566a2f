//! # Image based visual servoing controller
//!
//! Converts the pixel error between the target and the principal point into speed demands for the
//! two axes. The horizontal error (u) drives the tilt axis and the vertical error (v) drives the
//! pan axis.
//!
//! The IBVS law is a PID on each axis, with:
//!
//! - a deadzone per axis which also clears that axis' integral,
//! - an integral windup limit,
//! - a derivative from the mean of the last few error differences,
//! - a gain boost for small errors just outside the deadzone,
//! - a minimum speed guarantee so small errors still move the rig,
//! - progressive damping as the recent error gets smaller.
//!
//! A plain proportional law is also provided.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod params;
mod state;

// ---------------------------------------------------------------------------
// EXPORTS
// ---------------------------------------------------------------------------

pub use params::*;
pub use state::*;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, info};
use serde::Serialize;

// Internal
use comms_if::eqpt::servo::ServoCommand;
use crate::params::TrackExecParams;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of error magnitudes which must be held before the derivative is used
const MIN_SAMPLES_FOR_DERIV: usize = 4;

/// Number of recent error magnitudes averaged for damping
const DAMPING_SAMPLES: usize = 3;

/// Damping factors, as (upper bound of the mean recent error in pixels, factor)
const DAMPING_STEPS: [(f64, f64); 3] = [(20.0, 0.3), (40.0, 0.6), (80.0, 0.8)];

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

pub struct IbvsCtrl {
    params: IbvsParams,

    /// Units: RPM
    min_speed_rpm: i32,

    /// Units: RPM
    max_speed_rpm: i32,

    /// Units: seconds
    control_period_s: f64,

    /// Principal point x coordinate.
    ///
    /// Units: pixels
    cx: f64,

    /// Principal point y coordinate.
    ///
    /// Units: pixels
    cy: f64,

    state: ControllerState,
}

/// Result of one controller step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CtrlOutput {
    /// Demand rounded to whole RPM
    pub cmd: ServoCommand,

    /// Pan demand before the final rounding.
    ///
    /// Units: RPM
    pub pan_demand_rpm: f64,

    /// Tilt demand before the final rounding.
    ///
    /// Units: RPM
    pub tilt_demand_rpm: f64,

    /// Units: pixels
    pub error_u_px: f64,

    /// Units: pixels
    pub error_v_px: f64,

    /// Units: pixels
    pub magnitude: f64,

    /// The target is inside the deadzone
    pub target_reached: bool,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl IbvsCtrl {
    pub fn new(params: &TrackExecParams) -> Self {
        let (cx, cy) = params.camera.principal_point();

        Self {
            params: params.ibvs.clone(),
            min_speed_rpm: params.servo.min_speed_rpm,
            max_speed_rpm: params.servo.max_speed_rpm,
            control_period_s: params.track_sup.control_period_s,
            cx,
            cy,
            state: ControllerState::default(),
        }
    }

    /// Compute the speed command for a target at the given pixel position.
    ///
    /// Non-finite positions produce a zero command and leave the state untouched.
    pub fn compute(&mut self, target_x: f64, target_y: f64) -> CtrlOutput {
        if !target_x.is_finite() || !target_y.is_finite() {
            debug!("Ignoring non-finite target ({}, {})", target_x, target_y);
            return CtrlOutput {
                cmd: ServoCommand::ZERO,
                pan_demand_rpm: 0.0,
                tilt_demand_rpm: 0.0,
                error_u_px: 0.0,
                error_v_px: 0.0,
                magnitude: 0.0,
                target_reached: false,
            };
        }

        match self.params.control_law {
            ControlLaw::Ibvs => self.compute_ibvs(target_x, target_y),
            ControlLaw::Proportional => self.compute_proportional(target_x, target_y),
        }
    }

    /// Clear the integrals and error history.
    pub fn reset(&mut self) {
        self.state = ControllerState::default();
        debug!("IBVS controller reset");
    }

    /// Move the principal point to the centre of a frame of the given size.
    pub fn set_frame_center(&mut self, width: u32, height: u32) {
        self.cx = (width / 2) as f64;
        self.cy = (height / 2) as f64;
        info!("Frame centre set to ({}, {})", self.cx, self.cy);
    }

    pub fn principal_point(&self) -> (f64, f64) {
        (self.cx, self.cy)
    }

    pub fn error_stats(&self) -> Option<ErrorStats> {
        self.state.error_stats()
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    fn compute_ibvs(&mut self, target_x: f64, target_y: f64) -> CtrlOutput {
        let p = &self.params;
        let dt = self.control_period_s;

        let raw_u = target_x - self.cx;
        let raw_v = target_y - self.cy;
        let magnitude = raw_u.hypot(raw_v);

        self.state.push(raw_u, raw_v, magnitude);

        // Derivative from the mean of the last two differences
        let (deriv_u, deriv_v) = if self.state.error_window.len() >= MIN_SAMPLES_FOR_DERIV {
            (
                mean_diff_last3(&self.state.error_u_history) / dt,
                mean_diff_last3(&self.state.error_v_history) / dt,
            )
        } else {
            (0.0, 0.0)
        };

        // Deadzone
        let mut error_u = raw_u;
        let mut error_v = raw_v;
        if error_u.abs() < p.deadzone_px {
            error_u = 0.0;
            self.state.integral_u = 0.0;
        }
        if error_v.abs() < p.deadzone_px {
            error_v = 0.0;
            self.state.integral_v = 0.0;
        }

        // Integral with windup protection
        self.state.integral_u =
            (self.state.integral_u + error_u * dt).clamp(-p.integral_limit, p.integral_limit);
        self.state.integral_v =
            (self.state.integral_v + error_v * dt).clamp(-p.integral_limit, p.integral_limit);

        // Adaptive gain
        let boost = if magnitude > p.deadzone_px && magnitude < p.gain_boost_threshold_px {
            p.gain_boost_factor
        } else {
            1.0
        };

        let tilt = error_u * p.tilt_k_p * boost
            + self.state.integral_u * p.tilt_k_i * boost
            + deriv_u * p.tilt_k_d;
        let pan = -error_v * p.pan_k_p * boost
            - self.state.integral_v * p.pan_k_i * boost
            - deriv_v * p.pan_k_d;

        let mut pan_demand = self.limit(self.snap_to_min(pan)) as f64;
        let mut tilt_demand = self.limit(self.snap_to_min(tilt)) as f64;

        // Progressive damping, may bring a demand back under the minimum speed
        if let Some(recent) = self.state.recent_mean(DAMPING_SAMPLES) {
            let factor = damping_factor(recent);
            pan_demand *= factor;
            tilt_demand *= factor;
        }

        let pan = pan_demand.round() as i32;
        let tilt = tilt_demand.round() as i32;

        let out = CtrlOutput {
            cmd: ServoCommand::new(pan, tilt),
            pan_demand_rpm: pan_demand,
            tilt_demand_rpm: tilt_demand,
            error_u_px: raw_u,
            error_v_px: raw_v,
            magnitude,
            target_reached: magnitude < p.deadzone_px,
        };

        if raw_u.abs() > 2.0 || raw_v.abs() > 2.0 {
            debug!(
                "IBVS: error ({:.1}, {:.1}) px, command ({}, {}) RPM",
                raw_u, raw_v, pan, tilt
            );
        }

        out
    }

    fn compute_proportional(&mut self, target_x: f64, target_y: f64) -> CtrlOutput {
        let raw_u = target_x - self.cx;
        let raw_v = target_y - self.cy;
        let magnitude = raw_u.hypot(raw_v);

        self.state.push(raw_u, raw_v, magnitude);

        let deadzone = |e: f64| if e.abs() < self.params.deadzone_px { 0.0 } else { e };
        let k = self.params.speed_scale_factor;

        let pan = self.limit(-deadzone(raw_v) * k);
        let tilt = self.limit(deadzone(raw_u) * k);

        CtrlOutput {
            cmd: ServoCommand::new(pan, tilt),
            pan_demand_rpm: pan as f64,
            tilt_demand_rpm: tilt as f64,
            error_u_px: raw_u,
            error_v_px: raw_v,
            magnitude,
            target_reached: magnitude < self.params.deadzone_px,
        }
    }

    /// Raise nonzero speeds below the minimum speed up to it.
    fn snap_to_min(&self, speed: f64) -> f64 {
        let min = self.min_speed_rpm as f64;
        if speed != 0.0 && speed.abs() < min {
            min.copysign(speed)
        } else {
            speed
        }
    }

    /// Round to a whole RPM and clamp to the maximum speed.
    fn limit(&self, speed: f64) -> i32 {
        let max = self.max_speed_rpm as f64;
        speed.round().clamp(-max, max) as i32
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Mean of the differences between the last three entries of the history.
fn mean_diff_last3(history: &[f64; AXIS_HISTORY_LEN]) -> f64 {
    let n = AXIS_HISTORY_LEN;
    ((history[n - 1] - history[n - 2]) + (history[n - 2] - history[n - 3])) / 2.0
}

fn damping_factor(recent_error_px: f64) -> f64 {
    for (bound, factor) in DAMPING_STEPS.iter() {
        if recent_error_px < *bound {
            return *factor;
        }
    }
    1.0
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn ctrl() -> IbvsCtrl {
        IbvsCtrl::new(&TrackExecParams::default())
    }

    #[test]
    fn test_far_target() {
        let mut c = ctrl();

        // Box at (100, 100) of 20x20
        let out = c.compute(110.0, 110.0);

        assert_eq!(out.error_u_px, -210.0);
        assert_eq!(out.error_v_px, -130.0);
        assert!(!out.target_reached);

        // Target up and left: tilt negative, pan positive, both saturated
        assert_eq!(out.cmd, ServoCommand::new(10, -10));
    }

    #[test]
    fn test_target_in_deadzone() {
        let mut c = ctrl();

        for _ in 0..5 {
            let out = c.compute(325.0, 243.0);
            assert_eq!(out.cmd, ServoCommand::ZERO);
            assert!(out.target_reached);
        }
    }

    #[test]
    fn test_origin_is_stable() {
        let mut c = ctrl();

        for _ in 0..100 {
            let out = c.compute(320.0, 240.0);
            assert_eq!(out.cmd, ServoCommand::ZERO);
        }

        assert!(c.state().integral_u.abs() < 1e-9);
        assert!(c.state().integral_v.abs() < 1e-9);
        assert!(c.error_stats().unwrap().is_converged);
    }

    #[test]
    fn test_output_bounded() {
        let mut c = ctrl();
        let mut rng = StdRng::seed_from_u64(7);

        let extremes = [
            (1.0e12, -1.0e12),
            (-1.0e12, 1.0e12),
            (std::f64::MAX, std::f64::MIN),
            (std::f64::NAN, 0.0),
            (std::f64::INFINITY, 240.0),
        ];
        for (x, y) in extremes.iter() {
            assert!(c.compute(*x, *y).cmd.max_abs() <= 10);
        }

        for _ in 0..1000 {
            let x = rng.gen_range(-5000.0..5000.0);
            let y = rng.gen_range(-5000.0..5000.0);
            assert!(c.compute(x, y).cmd.max_abs() <= 10);
        }
    }

    #[test]
    fn test_non_finite_keeps_state() {
        let mut c = ctrl();
        c.compute(400.0, 300.0);
        let integral = c.state().integral_u;

        let out = c.compute(std::f64::NAN, 10.0);
        assert_eq!(out.cmd, ServoCommand::ZERO);
        assert_eq!(c.state().integral_u, integral);
        assert_eq!(c.state().error_window.len(), 1);
    }

    #[test]
    fn test_damping_and_min_speed() {
        let mut c = ctrl();

        // 10 px right of centre: boosted gain, tilt = 10 * 0.3 * 1.8 + 1 * 0.05 * 1.8 = 5.49
        let out = c.compute(330.0, 240.0);
        assert_eq!(out.cmd, ServoCommand::new(0, 5));

        // With three samples below 20 px the command is damped to 30 %
        c.compute(330.0, 240.0);
        let out = c.compute(330.0, 240.0);
        assert!(out.cmd.tilt_speed_rpm >= 1 && out.cmd.tilt_speed_rpm <= 2);
        assert_eq!(out.cmd.pan_speed_rpm, 0);
    }

    #[test]
    fn test_damped_demand_is_unrounded() {
        let mut params = TrackExecParams::default();
        params.ibvs.tilt_k_p = 0.1;
        params.ibvs.tilt_k_i = 0.0;
        params.ibvs.tilt_k_d = 0.0;
        params.ibvs.gain_boost_factor = 1.0;
        let mut c = IbvsCtrl::new(&params);

        // u = 19: tilt = 1.9, rounded to 2 before damping kicks in
        for _ in 0..2 {
            let out = c.compute(339.0, 240.0);
            assert_eq!(out.cmd, ServoCommand::new(0, 2));
            assert_eq!(out.tilt_demand_rpm, 2.0);
        }

        // Damped to 30 %: 0.6 RPM, under the minimum speed even though it rounds to 1
        let out = c.compute(339.0, 240.0);
        assert!((out.tilt_demand_rpm - 0.6).abs() < 1e-9);
        assert_eq!(out.cmd.tilt_speed_rpm, 1);
        assert_eq!(out.pan_demand_rpm, 0.0);
    }

    #[test]
    fn test_integral_windup_limit() {
        let mut c = ctrl();

        for _ in 0..10_000 {
            c.compute(620.0, 40.0);
        }

        assert_eq!(c.state().integral_u, 200.0);
        assert_eq!(c.state().integral_v, -200.0);

        c.reset();
        assert_eq!(c.state().integral_u, 0.0);
        assert!(c.error_stats().is_none());
    }

    #[test]
    fn test_proportional_law() {
        let mut params = TrackExecParams::default();
        params.ibvs.control_law = ControlLaw::Proportional;
        params.servo.max_speed_rpm = 50;
        let mut c = IbvsCtrl::new(&params);

        // u = 10, v = -5: v inside the deadzone
        let out = c.compute(330.0, 235.0);
        assert_eq!(out.cmd, ServoCommand::new(0, 20));

        let out = c.compute(0.0, 480.0);
        assert_eq!(out.cmd, ServoCommand::new(-50, -50));
    }

    #[test]
    fn test_set_frame_center() {
        let mut c = ctrl();
        c.set_frame_center(1281, 721);
        assert_eq!(c.principal_point(), (640.0, 360.0));

        let out = c.compute(640.0, 360.0);
        assert!(out.target_reached);
    }
}

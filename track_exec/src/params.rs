//! # Tracking executable parameters
//!
//! All parameters are loaded from `params/track_exec.toml`. Every section and field is optional,
//! missing values take their defaults.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::Deserialize;
use thiserror::Error;

// Internal
use crate::{
    ibvs_ctrl::{CameraParams, IbvsParams},
    servo_drv::ServoParams,
    servo_if::SerialParams,
    target_sel::TargetSelParams,
    track_sup::TrackSupParams,
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Highest valid Modbus slave address
const MAX_SLAVE_ID: u8 = 247;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct TrackExecParams {
    pub serial: SerialParams,

    pub servo: ServoParams,

    pub ibvs: IbvsParams,

    pub target_sel: TargetSelParams,

    pub track_sup: TrackSupParams,

    pub camera: CameraParams,
}

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("Speed smoothing must be in (0, 1], found {0}")]
    InvalidSmoothing(f64),

    #[error("Speed limits must satisfy 0 <= min <= max <= 32767, found min {min}, max {max}")]
    InvalidSpeedLimits { min: i32, max: i32 },

    #[error("The control period must be positive and finite, found {0} s")]
    InvalidControlPeriod(f64),

    #[error("The stop join timeout must be positive and finite, found {0} s")]
    InvalidStopJoinTimeout(f64),

    #[error("The deadzone must not be negative, found {0} px")]
    InvalidDeadzone(f64),

    #[error("The gain boost factor must be positive, found {0}")]
    InvalidBoostFactor(f64),

    #[error("The integral limit must not be negative, found {0}")]
    InvalidIntegralLimit(f64),

    #[error("Slave IDs must be distinct and in 1..=247, found pan {pan}, tilt {tilt}")]
    InvalidSlaveIds { pan: u8, tilt: u8 },

    #[error("Invalid serial settings: {0}")]
    InvalidSerial(String),

    #[error("Invalid camera geometry: {0}")]
    InvalidCamera(String),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TrackExecParams {
    /// Determines if the parameters are valid.
    pub fn are_valid(&self) -> Result<(), ParamsError> {
        let s = &self.servo;
        if !(s.speed_smoothing > 0.0 && s.speed_smoothing <= 1.0) {
            return Err(ParamsError::InvalidSmoothing(s.speed_smoothing));
        }
        if s.min_speed_rpm < 0
            || s.min_speed_rpm > s.max_speed_rpm
            || s.max_speed_rpm > i16::MAX as i32
        {
            return Err(ParamsError::InvalidSpeedLimits {
                min: s.min_speed_rpm,
                max: s.max_speed_rpm,
            });
        }

        let period = self.track_sup.control_period_s;
        if !(period.is_finite() && period > 0.0) {
            return Err(ParamsError::InvalidControlPeriod(period));
        }
        let join_timeout = self.track_sup.stop_join_timeout_s;
        if !(join_timeout.is_finite() && join_timeout > 0.0) {
            return Err(ParamsError::InvalidStopJoinTimeout(join_timeout));
        }

        let i = &self.ibvs;
        if !(i.deadzone_px >= 0.0) {
            return Err(ParamsError::InvalidDeadzone(i.deadzone_px));
        }
        if !(i.gain_boost_factor > 0.0) {
            return Err(ParamsError::InvalidBoostFactor(i.gain_boost_factor));
        }
        if !(i.integral_limit >= 0.0) {
            return Err(ParamsError::InvalidIntegralLimit(i.integral_limit));
        }

        let serial = &self.serial;
        let slaves = serial.slaves();
        let valid_id = |id: u8| id >= 1 && id <= MAX_SLAVE_ID;
        if slaves.pan == slaves.tilt || !valid_id(slaves.pan) || !valid_id(slaves.tilt) {
            return Err(ParamsError::InvalidSlaveIds {
                pan: slaves.pan,
                tilt: slaves.tilt,
            });
        }
        serial
            .serial_data_bits()
            .map_err(|e| ParamsError::InvalidSerial(e.to_string()))?;
        serial
            .serial_stop_bits()
            .map_err(|e| ParamsError::InvalidSerial(e.to_string()))?;
        if !(serial.timeout_s.is_finite() && serial.timeout_s > 0.0) {
            return Err(ParamsError::InvalidSerial(format!(
                "the timeout must be positive and finite, found {} s",
                serial.timeout_s
            )));
        }
        if serial.max_consec_write_failures == 0 {
            return Err(ParamsError::InvalidSerial(String::from(
                "max_consec_write_failures must be at least 1",
            )));
        }

        let c = &self.camera;
        if c.width == 0 || c.height == 0 {
            return Err(ParamsError::InvalidCamera(format!(
                "frame size must be nonzero, found {}x{}",
                c.width, c.height
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        TrackExecParams::default().are_valid().unwrap();
    }

    #[test]
    fn test_partial_file() {
        let p: TrackExecParams = util::params::from_str(
            r#"
            [serial]
            port = "/dev/ttyAMA0"
            parity = "E"

            [ibvs]
            control_law = "Proportional"
            deadzone_px = 4.0

            [camera]
            width = 1280
            height = 720
            "#,
        )
        .unwrap();

        assert_eq!(p.serial.port, "/dev/ttyAMA0");
        assert_eq!(p.serial.baud, 9600);
        assert_eq!(p.serial.parity, crate::servo_if::Parity::Even);
        assert_eq!(p.ibvs.control_law, crate::ibvs_ctrl::ControlLaw::Proportional);
        assert_eq!(p.ibvs.pan_k_p, 0.3);
        assert_eq!(p.servo.max_speed_rpm, 10);
        assert_eq!(p.camera.principal_point(), (640.0, 360.0));
        p.are_valid().unwrap();
    }

    #[test]
    fn test_invalid() {
        let mut p = TrackExecParams::default();
        p.servo.speed_smoothing = 0.0;
        assert!(matches!(p.are_valid(), Err(ParamsError::InvalidSmoothing(_))));

        let mut p = TrackExecParams::default();
        p.serial.tilt_slave_id = 1;
        assert!(matches!(p.are_valid(), Err(ParamsError::InvalidSlaveIds { .. })));

        let mut p = TrackExecParams::default();
        p.servo.min_speed_rpm = 20;
        assert!(matches!(p.are_valid(), Err(ParamsError::InvalidSpeedLimits { .. })));

        let mut p = TrackExecParams::default();
        p.serial.stop_bits = 3;
        assert!(matches!(p.are_valid(), Err(ParamsError::InvalidSerial(_))));
    }

    #[test]
    fn test_infinite_timeouts() {
        let p: TrackExecParams = util::params::from_str(
            r#"
            [serial]
            timeout_s = inf
            "#,
        )
        .unwrap();
        assert!(matches!(p.are_valid(), Err(ParamsError::InvalidSerial(_))));
        assert_eq!(p.serial.timeout(), Duration::from_secs(u32::MAX as u64));

        let p: TrackExecParams = util::params::from_str(
            r#"
            [track_sup]
            stop_join_timeout_s = inf
            "#,
        )
        .unwrap();
        assert!(matches!(
            p.are_valid(),
            Err(ParamsError::InvalidStopJoinTimeout(_))
        ));
        assert_eq!(
            p.track_sup.stop_join_timeout(),
            Duration::from_secs(u32::MAX as u64)
        );

        let mut p = TrackExecParams::default();
        p.track_sup.stop_join_timeout_s = 0.0;
        assert!(p.are_valid().is_err());
        p.track_sup.control_period_s = std::f64::NAN;
        assert!(matches!(
            p.are_valid(),
            Err(ParamsError::InvalidControlPeriod(_))
        ));
    }
}

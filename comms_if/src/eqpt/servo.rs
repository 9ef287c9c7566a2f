//! # Servo Drive Equipment Interface
//!
//! Register map and command structures for the two servo drives of the pan-tilt rig.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Holding register containing the signed speed demand of an axis.
///
/// Units: RPM, two's complement in 16 bits
pub const REG_SPEED: u16 = 25;

/// Holding register containing the run/stop flag of an axis.
///
/// `1` = running, `0` = stopped
pub const REG_RUN_STOP: u16 = 53;

/// Value of [`REG_RUN_STOP`] while the drive is running
pub const RUN: i16 = 1;

/// Value of [`REG_RUN_STOP`] while the drive is stopped
pub const STOP: i16 = 0;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Angular speed demand for both axes of the rig.
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ServoCommand {
    /// Speed of the pan (vertical look) axis.
    ///
    /// Units: RPM
    pub pan_speed_rpm: i32,

    /// Speed of the tilt (horizontal look) axis.
    ///
    /// Units: RPM
    pub tilt_speed_rpm: i32,
}

/// Modbus slave addresses of the two drives.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlaveIds {
    /// Slave driving the pan (vertical look) axis
    pub pan: u8,

    /// Slave driving the tilt (horizontal look) axis
    pub tilt: u8,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Axes of the rig.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Axis {
    Pan,
    Tilt,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ServoCommand {
    /// The zero command, holding both axes still.
    pub const ZERO: ServoCommand = ServoCommand {
        pan_speed_rpm: 0,
        tilt_speed_rpm: 0,
    };

    pub fn new(pan_speed_rpm: i32, tilt_speed_rpm: i32) -> Self {
        Self {
            pan_speed_rpm,
            tilt_speed_rpm,
        }
    }

    /// Returns true if this command holds both axes still.
    pub fn is_zero(&self) -> bool {
        self.pan_speed_rpm == 0 && self.tilt_speed_rpm == 0
    }

    /// Largest absolute speed of the two axes.
    pub fn max_abs(&self) -> i32 {
        self.pan_speed_rpm.abs().max(self.tilt_speed_rpm.abs())
    }
}

impl SlaveIds {
    /// Get the slave for the given axis.
    pub fn of(&self, axis: Axis) -> u8 {
        match axis {
            Axis::Pan => self.pan,
            Axis::Tilt => self.tilt,
        }
    }

    /// Both slaves, pan first.
    pub fn both(&self) -> [(Axis, u8); 2] {
        [(Axis::Pan, self.pan), (Axis::Tilt, self.tilt)]
    }
}

impl Default for SlaveIds {
    fn default() -> Self {
        Self { pan: 1, tilt: 10 }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Pan => write!(f, "PAN"),
            Axis::Tilt => write!(f, "TILT"),
        }
    }
}

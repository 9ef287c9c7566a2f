//! # Servo interface parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::Deserialize;
use std::time::Duration;

// Internal
use comms_if::eqpt::servo::SlaveIds;
use util::time::seconds_to_duration;
use super::LinkError;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Serial link and bus addressing parameters.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SerialParams {
    /// Path to the serial device, for example `/dev/ttyUSB0`
    pub port: String,

    /// Baud rate of the bus
    pub baud: u32,

    /// Number of stop bits (1 or 2)
    pub stop_bits: u8,

    /// Number of data bits (5 to 8)
    pub data_bits: u8,

    /// Parity of the bus
    pub parity: Parity,

    /// Time to wait for a response before failing a transaction.
    ///
    /// Units: seconds
    pub timeout_s: f64,

    /// Modbus address of the pan (vertical look) drive
    pub pan_slave_id: u8,

    /// Modbus address of the tilt (horizontal look) drive
    pub tilt_slave_id: u8,

    /// Number of consecutive failed writes after which the link is considered lost
    pub max_consec_write_failures: u32,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SerialParams {
    pub fn slaves(&self) -> SlaveIds {
        SlaveIds {
            pan: self.pan_slave_id,
            tilt: self.tilt_slave_id,
        }
    }

    pub fn timeout(&self) -> Duration {
        seconds_to_duration(self.timeout_s)
    }

    pub fn serial_data_bits(&self) -> Result<serialport::DataBits, LinkError> {
        match self.data_bits {
            5 => Ok(serialport::DataBits::Five),
            6 => Ok(serialport::DataBits::Six),
            7 => Ok(serialport::DataBits::Seven),
            8 => Ok(serialport::DataBits::Eight),
            n => Err(LinkError::InvalidSettings(format!(
                "{} data bits is not supported",
                n
            ))),
        }
    }

    pub fn serial_stop_bits(&self) -> Result<serialport::StopBits, LinkError> {
        match self.stop_bits {
            1 => Ok(serialport::StopBits::One),
            2 => Ok(serialport::StopBits::Two),
            n => Err(LinkError::InvalidSettings(format!(
                "{} stop bits is not supported",
                n
            ))),
        }
    }

    pub fn serial_parity(&self) -> serialport::Parity {
        match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

impl Default for SerialParams {
    fn default() -> Self {
        let slaves = SlaveIds::default();

        Self {
            port: String::from("/dev/ttyUSB0"),
            baud: 9600,
            stop_bits: 2,
            data_bits: 8,
            parity: Parity::None,
            timeout_s: 1.0,
            pan_slave_id: slaves.pan,
            tilt_slave_id: slaves.tilt,
            max_consec_write_failures: 6,
        }
    }
}

//! # Modbus links
//!
//! A link performs single request/response transactions with one slave on the bus. The
//! [`SerialLink`] talks Modbus RTU over a serial port.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::trace;
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use thiserror::Error;

// Internal
use comms_if::eqpt::modbus::{self, FrameError, RESPONSE_HEADER_LEN};
use util::logger::BUS_TARGET;
use super::SerialParams;

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// A Modbus master able to reach the servo drives.
pub trait ModbusLink: Send {
    /// Write a single holding register, waiting for the slave's acknowledgement.
    fn write_single_register(
        &mut self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), LinkError>;

    /// Read a single holding register.
    fn read_holding_register(&mut self, slave_id: u8, address: u16) -> Result<u16, LinkError>;

    /// Release the underlying device.
    fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Modbus RTU over a serial port.
pub struct SerialLink {
    port: Option<Box<dyn SerialPort>>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Could not open the serial port: {0}")]
    Open(serialport::Error),

    #[error("Invalid serial settings: {0}")]
    InvalidSettings(String),

    #[error("Serial port error: {0}")]
    Serial(serialport::Error),

    #[error("Serial I/O error: {0}")]
    Io(std::io::Error),

    #[error("Invalid response frame: {0}")]
    Frame(FrameError),

    #[error("The link is closed")]
    NotOpen,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SerialLink {
    /// Open the serial port described by the parameters.
    pub fn open(params: &SerialParams) -> Result<Self, LinkError> {
        let port = serialport::new(params.port.as_str(), params.baud)
            .data_bits(params.serial_data_bits()?)
            .stop_bits(params.serial_stop_bits()?)
            .parity(params.serial_parity())
            .flow_control(serialport::FlowControl::None)
            .timeout(params.timeout())
            .open()
            .map_err(LinkError::Open)?;

        Ok(Self { port: Some(port) })
    }

    /// Send a request and read back the full response frame.
    fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>, LinkError> {
        let port = match self.port {
            Some(ref mut p) => p,
            None => return Err(LinkError::NotOpen),
        };

        // Drop any stale bytes from a previous timed out transaction
        port.clear(ClearBuffer::Input).map_err(LinkError::Serial)?;

        port.write_all(request).map_err(LinkError::Io)?;
        port.flush().map_err(LinkError::Io)?;

        trace!(target: BUS_TARGET, "TX {:02X?}", request);

        // Header first, which tells us how long the whole frame is
        let mut response = vec![0u8; RESPONSE_HEADER_LEN];
        port.read_exact(&mut response).map_err(LinkError::Io)?;

        let len = modbus::response_len(&response).map_err(LinkError::Frame)?;
        response.resize(len, 0);
        port.read_exact(&mut response[RESPONSE_HEADER_LEN..])
            .map_err(LinkError::Io)?;

        trace!(target: BUS_TARGET, "RX {:02X?}", response);

        Ok(response)
    }
}

impl ModbusLink for SerialLink {
    fn write_single_register(
        &mut self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), LinkError> {
        let request = modbus::write_single_request(slave_id, address, value);
        let response = self.transact(&request)?;

        modbus::parse_write_single_response(&request, &response).map_err(LinkError::Frame)
    }

    fn read_holding_register(&mut self, slave_id: u8, address: u16) -> Result<u16, LinkError> {
        let request = modbus::read_holding_request(slave_id, address, 1);
        let response = self.transact(&request)?;

        let values =
            modbus::parse_read_holding_response(slave_id, &response).map_err(LinkError::Frame)?;

        match values.first() {
            Some(v) => Ok(*v),
            None => Err(LinkError::Frame(FrameError::InvalidByteCount(0))),
        }
    }

    fn close(&mut self) {
        // Dropping the port closes the device
        self.port = None;
    }
}

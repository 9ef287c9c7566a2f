//! # Modbus RTU framing
//!
//! Encoding and validation of the two Modbus RTU functions used to talk to the servo drives:
//!
//! - `0x06` write single holding register, whose normal response is an echo of the request.
//! - `0x03` read holding registers, used as the round-trip check when connecting.
//!
//! Every frame ends with a CRC-16/MODBUS checksum transmitted low byte first. Register addresses
//! and values are transmitted big endian.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_16_MODBUS};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

const CRC_ALGO: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Function code: read holding registers
pub const FN_READ_HOLDING: u8 = 0x03;

/// Function code: write single holding register
pub const FN_WRITE_SINGLE: u8 = 0x06;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Length of a request frame for either supported function
pub const REQUEST_FRAME_LEN: usize = 8;

/// Length of an exception response frame
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Number of bytes which must be read before the length of a response is known
pub const RESPONSE_HEADER_LEN: usize = 3;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Errors found while validating a response frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: expected {expected} bytes, found {found}")]
    TooShort { expected: usize, found: usize },

    #[error("CRC mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    CrcMismatch { received: u16, computed: u16 },

    #[error("Response came from slave {found} but the request was addressed to slave {expected}")]
    WrongSlave { expected: u8, found: u8 },

    #[error("Unexpected function code {0:#04x} in response")]
    UnexpectedFunction(u8),

    #[error("Slave returned exception code {0:#04x}")]
    Exception(u8),

    #[error("Write response does not echo the request")]
    EchoMismatch,

    #[error("Read response carries an invalid byte count ({0})")]
    InvalidByteCount(u8),
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Encode a signed register value as its two's complement 16 bit representation.
pub fn to_modbus_16bit(value: i16) -> u16 {
    value as u16
}

/// Decode a raw 16 bit register value as a two's complement signed value.
pub fn from_modbus_16bit(raw: u16) -> i16 {
    raw as i16
}

/// Compute the CRC-16/MODBUS checksum of the given bytes.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC_ALGO.checksum(bytes)
}

/// Build a "write single holding register" request.
pub fn write_single_request(slave_id: u8, address: u16, value: u16) -> [u8; REQUEST_FRAME_LEN] {
    let mut frame = [0u8; REQUEST_FRAME_LEN];
    frame[0] = slave_id;
    frame[1] = FN_WRITE_SINGLE;
    BigEndian::write_u16(&mut frame[2..4], address);
    BigEndian::write_u16(&mut frame[4..6], value);
    seal(&mut frame);
    frame
}

/// Build a "read holding registers" request for `count` registers starting at `address`.
pub fn read_holding_request(slave_id: u8, address: u16, count: u16) -> [u8; REQUEST_FRAME_LEN] {
    let mut frame = [0u8; REQUEST_FRAME_LEN];
    frame[0] = slave_id;
    frame[1] = FN_READ_HOLDING;
    BigEndian::write_u16(&mut frame[2..4], address);
    BigEndian::write_u16(&mut frame[4..6], count);
    seal(&mut frame);
    frame
}

/// Get the total length of a response frame from its first [`RESPONSE_HEADER_LEN`] bytes.
///
/// The RTU framing carries no explicit length, so the reader must read the header, ask for the
/// full length and then read the remainder of the frame.
pub fn response_len(header: &[u8]) -> Result<usize, FrameError> {
    if header.len() < RESPONSE_HEADER_LEN {
        return Err(FrameError::TooShort {
            expected: RESPONSE_HEADER_LEN,
            found: header.len(),
        });
    }

    let function = header[1];

    if function & EXCEPTION_FLAG != 0 {
        return Ok(EXCEPTION_FRAME_LEN);
    }

    match function {
        FN_WRITE_SINGLE => Ok(REQUEST_FRAME_LEN),
        FN_READ_HOLDING => {
            let byte_count = header[2];
            if byte_count == 0 || byte_count % 2 != 0 {
                return Err(FrameError::InvalidByteCount(byte_count));
            }
            Ok(RESPONSE_HEADER_LEN + byte_count as usize + 2)
        }
        f => Err(FrameError::UnexpectedFunction(f)),
    }
}

/// Validate the response to a "write single holding register" request.
///
/// A successful write is acknowledged by the slave echoing the request frame exactly.
pub fn parse_write_single_response(
    request: &[u8; REQUEST_FRAME_LEN],
    response: &[u8],
) -> Result<(), FrameError> {
    check_exception(request[0], response)?;

    if response.len() < REQUEST_FRAME_LEN {
        return Err(FrameError::TooShort {
            expected: REQUEST_FRAME_LEN,
            found: response.len(),
        });
    }

    let response = &response[..REQUEST_FRAME_LEN];
    check_crc(response)?;
    check_header(request[0], FN_WRITE_SINGLE, response)?;

    if response != &request[..] {
        return Err(FrameError::EchoMismatch);
    }

    Ok(())
}

/// Validate the response to a "read holding registers" request and extract the values.
pub fn parse_read_holding_response(slave_id: u8, response: &[u8]) -> Result<Vec<u16>, FrameError> {
    check_exception(slave_id, response)?;

    let expected = response_len(response)?;
    if response.len() < expected {
        return Err(FrameError::TooShort {
            expected,
            found: response.len(),
        });
    }

    let response = &response[..expected];
    check_crc(response)?;
    check_header(slave_id, FN_READ_HOLDING, response)?;

    Ok(response[RESPONSE_HEADER_LEN..expected - 2]
        .chunks(2)
        .map(BigEndian::read_u16)
        .collect())
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Append the CRC of all but the last two bytes into the last two bytes, low byte first.
fn seal(frame: &mut [u8]) {
    let n = frame.len();
    let crc = crc16(&frame[..n - 2]);
    frame[n - 2..].copy_from_slice(&crc.to_le_bytes());
}

fn check_crc(frame: &[u8]) -> Result<(), FrameError> {
    let n = frame.len();
    let received = u16::from_le_bytes([frame[n - 2], frame[n - 1]]);
    let computed = crc16(&frame[..n - 2]);

    if received != computed {
        return Err(FrameError::CrcMismatch { received, computed });
    }

    Ok(())
}

fn check_header(slave_id: u8, function: u8, frame: &[u8]) -> Result<(), FrameError> {
    if frame[0] != slave_id {
        return Err(FrameError::WrongSlave {
            expected: slave_id,
            found: frame[0],
        });
    }
    if frame[1] != function {
        return Err(FrameError::UnexpectedFunction(frame[1]));
    }
    Ok(())
}

/// If the response is an exception frame return the exception it carries.
fn check_exception(slave_id: u8, response: &[u8]) -> Result<(), FrameError> {
    if response.len() < 2 || response[1] & EXCEPTION_FLAG == 0 {
        return Ok(());
    }

    if response.len() < EXCEPTION_FRAME_LEN {
        return Err(FrameError::TooShort {
            expected: EXCEPTION_FRAME_LEN,
            found: response.len(),
        });
    }

    let frame = &response[..EXCEPTION_FRAME_LEN];
    check_crc(frame)?;

    if frame[0] != slave_id {
        return Err(FrameError::WrongSlave {
            expected: slave_id,
            found: frame[0],
        });
    }

    Err(FrameError::Exception(frame[2]))
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_twos_complement() {
        assert_eq!(to_modbus_16bit(-5), 65531);
        assert_eq!(from_modbus_16bit(65531), -5);
        assert_eq!(to_modbus_16bit(0), 0);
        assert_eq!(to_modbus_16bit(10), 10);
        assert_eq!(from_modbus_16bit(0x8000), i16::MIN);
    }

    #[test]
    fn test_crc_reference_frame() {
        // Well known frame: read one holding register at 0 from slave 1
        assert_eq!(
            read_holding_request(1, 0, 1),
            [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );
    }

    #[test]
    fn test_write_request_layout() {
        let frame = write_single_request(10, 25, to_modbus_16bit(-5));

        assert_eq!(&frame[..6], &[10, FN_WRITE_SINGLE, 0x00, 25, 0xFF, 0xFB]);
        assert_eq!(
            u16::from_le_bytes([frame[6], frame[7]]),
            crc16(&frame[..6])
        );
    }

    #[test]
    fn test_write_echo() {
        let req = write_single_request(1, 53, 1);

        assert_eq!(parse_write_single_response(&req, &req), Ok(()));

        // Same frame from a different request does not acknowledge this one
        let other = write_single_request(1, 53, 0);
        assert_eq!(
            parse_write_single_response(&req, &other),
            Err(FrameError::EchoMismatch)
        );

        // Corrupted byte
        let mut bad = req;
        bad[5] ^= 0x01;
        assert!(matches!(
            parse_write_single_response(&req, &bad),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_exception_response() {
        let mut frame = [1u8, FN_WRITE_SINGLE | EXCEPTION_FLAG, 0x02, 0, 0];
        let crc = crc16(&frame[..3]);
        frame[3..].copy_from_slice(&crc.to_le_bytes());

        assert_eq!(response_len(&frame), Ok(EXCEPTION_FRAME_LEN));

        let req = write_single_request(1, 25, 0);
        assert_eq!(
            parse_write_single_response(&req, &frame),
            Err(FrameError::Exception(0x02))
        );
    }

    #[test]
    fn test_read_response() {
        let mut frame = vec![10u8, FN_READ_HOLDING, 2, 0x00, 0x01];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());

        assert_eq!(response_len(&frame[..3]), Ok(7));
        assert_eq!(parse_read_holding_response(10, &frame), Ok(vec![1]));
        assert_eq!(
            parse_read_holding_response(1, &frame),
            Err(FrameError::WrongSlave {
                expected: 1,
                found: 10
            })
        );
    }

    #[test]
    fn test_response_len_rejects_unknown_function() {
        assert_eq!(
            response_len(&[1, 0x10, 0]),
            Err(FrameError::UnexpectedFunction(0x10))
        );
        assert_eq!(
            response_len(&[1, FN_READ_HOLDING, 3]),
            Err(FrameError::InvalidByteCount(3))
        );
    }
}

//! # Telecommand module
//!
//! This module provides the operator telecommands accepted by the tracking executable.
//!
//! Telecommands are JSON objects with a `type` string and an optional `payload`, for example:
//!
//! ```json
//! {"type": "START", "payload": {"id": 3}}
//! {"type": "ESTOP"}
//! ```

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::{Deserialize, Serialize};
use serde_json::{self, Value};
use thiserror::Error;

// Internal
use crate::eqpt::vision::TrackId;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// An operator telecommand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Tc {
    /// Open the serial link and start the drives
    Connect,

    /// Stop the drives and close the serial link
    Disconnect,

    /// Start tracking the given track, or the largest balloon if `None`
    StartTracking(Option<TrackId>),

    /// Stop tracking and hold the rig still
    StopTracking,

    /// Change the locked track without restarting tracking
    UpdateTarget(Option<TrackId>),

    /// Stop both drives immediately. Cannot be undone without restarting the executable.
    EmergencyStop,

    /// Report the current status
    Status,
}

/// Telecommand types, as found in the `type` field of the JSON packet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum TcType {
    Connect,
    Disconnect,
    Start,
    Stop,
    Target,
    EmergencyStop,
    Status,
}

/// Possible parsing errors.
#[derive(Debug, Error)]
pub enum TcParseError {
    #[error("TC contains invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("TC has an invalid type ({0})")]
    InvalidType(String),

    #[error("TC of type {0:?} has an invalid payload: {1}")]
    InvalidPayload(TcType, String),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Tc {
    /// Parse a new TC from a JSON packet
    pub fn from_json(json_str: &str) -> Result<Self, TcParseError> {
        // Parse the JSON string into a value
        let val: Value = match serde_json::from_str(json_str) {
            Ok(v) => v,
            Err(e) => return Err(TcParseError::InvalidJson(e)),
        };

        // Get the type of the TC
        let type_str = match val["type"].as_str() {
            Some(s) => s,
            None => {
                return Err(TcParseError::InvalidType(String::from(
                    "Expected \"type\" to be a string",
                )))
            }
        };
        let tc_type = match TcType::from_str(type_str) {
            Some(t) => t,
            None => {
                return Err(TcParseError::InvalidType(format!(
                    "{} is not a recognised TC type",
                    type_str
                )))
            }
        };

        Ok(match tc_type {
            TcType::Connect => Tc::Connect,
            TcType::Disconnect => Tc::Disconnect,
            TcType::Start => Tc::StartTracking(parse_track_id(tc_type, &val["payload"])?),
            TcType::Stop => Tc::StopTracking,
            TcType::Target => Tc::UpdateTarget(parse_track_id(tc_type, &val["payload"])?),
            TcType::EmergencyStop => Tc::EmergencyStop,
            TcType::Status => Tc::Status,
        })
    }
}

impl TcType {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "CONNECT" => Some(TcType::Connect),
            "DISCONNECT" => Some(TcType::Disconnect),
            "START" => Some(TcType::Start),
            "STOP" => Some(TcType::Stop),
            "TARGET" => Some(TcType::Target),
            "ESTOP" => Some(TcType::EmergencyStop),
            "STATUS" => Some(TcType::Status),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Extract an optional track ID from a payload.
///
/// A missing/null payload, or a payload with a null `id`, means "no lock".
fn parse_track_id(tc_type: TcType, payload: &Value) -> Result<Option<TrackId>, TcParseError> {
    let id = match payload {
        Value::Null => return Ok(None),
        Value::Object(_) => &payload["id"],
        v => v,
    };

    match id {
        Value::Null => Ok(None),
        v => match v.as_u64() {
            Some(i) => Ok(Some(i)),
            None => Err(TcParseError::InvalidPayload(
                tc_type,
                format!("expected a non-negative integer track ID, found {}", v),
            )),
        },
    }
}

// JSON message type definitions
// Defines the client <-> relay protocol (one JSON object per frame, tagged by "type")

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::record::{Position3D, ProcessedRecord, Timestamp};
use crate::registry::ClientRole;

/// Legacy 2D GPS fix
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

/// Direct 3D sample from an AR session
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArkitSample {
    #[serde(rename = "position3D")]
    pub position_3d: Position3D,
    pub accuracy: f64,
    pub timestamp: Timestamp,
}

/// Messages sent from client to relay
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declare the session's role
    Identify {
        #[serde(rename = "clientType", default)]
        client_type: ClientRole,
    },

    /// Legacy GPS location
    Location(GpsFix),

    /// Direct 3D location
    ArkitLocation { data: ArkitSample },

    /// Application-level keepalive
    Ping,

    /// Any other tag; the real tag is recovered by [`decode_frame`]
    #[serde(other)]
    Unknown,
}

/// Why an inbound frame was dropped
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame has no string \"type\" tag")]
    MissingType,
    #[error("unrecognized message type {0:?}")]
    UnknownType(String),
    #[error("coordinates out of range or not finite")]
    InvalidCoordinates,
}

impl FrameError {
    /// Decode failures are counted as errors; unknown types are merely dropped
    pub fn is_decode_error(&self) -> bool {
        !matches!(self, FrameError::UnknownType(_))
    }
}

/// Decode one inbound frame into a known message
pub fn decode_frame(text: &str) -> Result<ClientMessage, FrameError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = match value.get("type").and_then(|t| t.as_str()) {
        Some(kind) => kind.to_string(),
        None => return Err(FrameError::MissingType),
    };
    match serde_json::from_value::<ClientMessage>(value)? {
        ClientMessage::Unknown => Err(FrameError::UnknownType(kind)),
        msg => Ok(msg),
    }
}

/// Messages sent from relay to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on connect
    #[serde(rename_all = "camelCase")]
    Welcome {
        client_id: u64,
        message: String,
        server_time: DateTime<Utc>,
    },

    /// Reply to `ping`
    Pong { timestamp: DateTime<Utc> },

    /// One processed record, fanned out to viewers
    LocationUpdate { data: ProcessedRecord },

    /// Sent to every session before the relay stops
    ServerShutdown { message: String },

    /// Liveness probe on transports without native ping frames
    #[serde(rename_all = "camelCase")]
    Heartbeat { server_time: DateTime<Utc> },
}

impl ServerMessage {
    /// Serialize once; the result can be shared across sessions
    pub fn encode(&self) -> Result<Arc<str>, serde_json::Error> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }
}

// Location records shared by the fan-out, write buffer and relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::AccuracyClass;

/// Point in the local frame, metres
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Client-supplied sample time: epoch milliseconds (ARKit) or an ISO-8601 string (GPS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(f64),
    Text(String),
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(t: DateTime<Utc>) -> Self {
        Timestamp::Text(t.to_rfc3339())
    }
}

/// Which inbound path produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    /// Legacy 2D GPS fix, projected and filtered
    Gps,
    /// Direct 3D position, passed through
    Arkit,
}

/// The authoritative unit of the relay.
///
/// `position3D` is always populated. GPS records keep their geographic fields,
/// ARKit records omit them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRecord {
    /// Broker-assigned, strictly increasing; doubles as the storage dedup key
    pub seq: u64,
    pub client_id: u64,
    pub received_at: DateTime<Utc>,
    pub source: RecordSource,
    #[serde(rename = "position3D")]
    pub position_3d: Position3D,
    pub accuracy: f64,
    pub quality: AccuracyClass,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

#[cfg(test)]
pub(crate) fn sample_record(seq: u64) -> ProcessedRecord {
    ProcessedRecord {
        seq,
        client_id: 1,
        received_at: Utc::now(),
        source: RecordSource::Arkit,
        position_3d: Position3D::new(seq as f64, 0.0, -(seq as f64)),
        accuracy: 3.0,
        quality: AccuracyClass::Excellent,
        timestamp: Timestamp::Millis(1_700_000_000_000.0 + seq as f64),
        latitude: None,
        longitude: None,
        altitude: None,
        heading: None,
        speed: None,
    }
}

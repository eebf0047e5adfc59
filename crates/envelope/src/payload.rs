//! Payload schemas of the well-known record types.
//!
//! The pipeline treats payloads as opaque bytes; these schemas exist for the
//! synthetic connectivity records the server manufactures itself and for the
//! optional decoded-JSON output. Decoded output is a convenience, not a
//! contract.

use prost::Message;
use serde::Serialize;

use crate::Error;

/// Vehicle connectivity status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ConnectivityStatus {
    /// Status could not be determined.
    Unknown = 0,
    /// The vehicle opened a connection.
    Connected = 1,
    /// The vehicle connection closed.
    Disconnected = 2,
}

/// A single telemetry datum inside a `VehicleData` batch.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct Datum {
    /// Name of the signal.
    #[prost(string, tag = "1")]
    pub key: String,
    /// Stringified signal value.
    #[prost(string, tag = "2")]
    pub value: String,
}

/// High-volume vehicle telemetry batch (type tag `V`).
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct VehicleData {
    /// Vehicle identification number.
    #[prost(string, tag = "1")]
    pub vin: String,
    /// The sampled signals.
    #[prost(message, repeated, tag = "2")]
    pub data: Vec<Datum>,
    /// Creation time, milliseconds since the unix epoch.
    #[prost(int64, tag = "3")]
    pub created_at: i64,
}

/// A single alert raised by the vehicle.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct Alert {
    /// Alert name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Start time, milliseconds since the unix epoch.
    #[prost(int64, tag = "2")]
    pub started_at: i64,
    /// Audiences the alert is addressed to.
    #[prost(string, repeated, tag = "3")]
    pub audiences: Vec<String>,
}

/// Alert batch (type tag `alerts`).
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct VehicleAlerts {
    /// Vehicle identification number.
    #[prost(string, tag = "1")]
    pub vin: String,
    /// The raised alerts.
    #[prost(message, repeated, tag = "2")]
    pub alerts: Vec<Alert>,
    /// Creation time, milliseconds since the unix epoch.
    #[prost(int64, tag = "3")]
    pub created_at: i64,
}

/// A single error event reported by the vehicle.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct ErrorEvent {
    /// Error name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Free-form error body.
    #[prost(string, tag = "2")]
    pub body: String,
    /// Classification tags.
    #[prost(map = "string, string", tag = "3")]
    pub tags: std::collections::HashMap<String, String>,
}

/// Error batch (type tag `errors`).
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct VehicleErrors {
    /// Vehicle identification number.
    #[prost(string, tag = "1")]
    pub vin: String,
    /// The reported errors.
    #[prost(message, repeated, tag = "2")]
    pub errors: Vec<ErrorEvent>,
    /// Creation time, milliseconds since the unix epoch.
    #[prost(int64, tag = "3")]
    pub created_at: i64,
}

/// Connection lifecycle event (type tag `connectivity`).
///
/// Emitted by the server itself on connection open and close, through the
/// same routing path as vehicle-sourced records.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct VehicleConnectivity {
    /// Vehicle identification number.
    #[prost(string, tag = "1")]
    pub vin: String,
    /// Server-assigned id of the connection the event describes.
    #[prost(string, tag = "2")]
    pub connection_id: String,
    /// Connectivity status, see [`ConnectivityStatus`].
    #[prost(enumeration = "ConnectivityStatus", tag = "3")]
    pub status: i32,
    /// Creation time, milliseconds since the unix epoch.
    #[prost(int64, tag = "4")]
    pub created_at: i64,
    /// Transport the connection used (e.g. `tls_tcp`).
    #[prost(string, tag = "5")]
    pub network_interface: String,
}

impl VehicleConnectivity {
    /// Serializes the event for routing as an opaque record payload.
    pub fn to_bytes(&self) -> bytes::Bytes {
        bytes::Bytes::from(self.encode_to_vec())
    }
}

/// Decodes a payload under the schema implied by its topic and renders it
/// as JSON.
pub fn decoded_json(topic: &str, payload: &[u8]) -> Result<serde_json::Value, Error> {
    fn parse<M: Message + Serialize + Default>(
        topic: &str,
        payload: &[u8],
    ) -> Result<serde_json::Value, Error> {
        let message = M::decode(payload).map_err(|e| Error::Payload {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        serde_json::to_value(&message).map_err(|e| Error::Payload {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }

    match topic {
        "V" => parse::<VehicleData>(topic, payload),
        "alerts" => parse::<VehicleAlerts>(topic, payload),
        "errors" => parse::<VehicleErrors>(topic, payload),
        "connectivity" => parse::<VehicleConnectivity>(topic, payload),
        _ => Err(Error::UnknownSchema {
            topic: topic.to_string(),
        }),
    }
}

#[cfg(test)]
mod test {
    use prost::Message;

    use crate::payload::{decoded_json, ConnectivityStatus, Datum, VehicleConnectivity, VehicleData};

    #[test]
    fn decoded_json_for_vehicle_data() {
        let batch = VehicleData {
            vin: "5YJ3E1EA1NF123456".into(),
            data: vec![Datum {
                key: "Soc".into(),
                value: "72".into(),
            }],
            created_at: 1_700_000_000_000,
        };
        let json = decoded_json("V", &batch.encode_to_vec()).unwrap();
        assert_eq!(json["vin"], "5YJ3E1EA1NF123456");
        assert_eq!(json["data"][0]["key"], "Soc");
    }

    #[test]
    fn connectivity_status_round_trip() {
        let event = VehicleConnectivity {
            vin: "5YJ3E1EA1NF123456".into(),
            connection_id: "c-1".into(),
            status: ConnectivityStatus::Connected as i32,
            created_at: 1_700_000_000_000,
            network_interface: "tls_tcp".into(),
        };
        let decoded = VehicleConnectivity::decode(event.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.status(), ConnectivityStatus::Connected);
    }

    #[test]
    fn unknown_topic_has_no_schema() {
        assert!(decoded_json("ack", b"").is_err());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(decoded_json("V", &[0xFF, 0xFF]).is_err());
    }
}

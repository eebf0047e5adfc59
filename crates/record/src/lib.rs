#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The in-memory unit of work traveling through the pipeline.
//!
//! A record is a typed, identity-stamped wrapper around an opaque payload.
//! It is created on a connection's read loop, fanned out to the configured
//! producers, and dies once every producer has been handed a copy (and, for
//! ack-eligible records, once the acknowledgement has been delivered or has
//! expired).

use std::time::{Instant, SystemTime};

use bytes::Bytes;
use envelope::Envelope;
use identity::Identity;

/// Schema generation stamped on records created by this server.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Routing key of a record. Closed set; unknown wire topics are dropped at
/// the connection layer before a record is ever built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// High-volume vehicle telemetry.
    V,
    /// Vehicle alerts.
    Alerts,
    /// Vehicle error reports.
    Errors,
    /// Connection lifecycle events, synthesized by the server.
    Connectivity,
}

impl TypeTag {
    /// Parses a wire message topic into a type tag.
    pub fn from_topic(topic: &[u8]) -> Option<Self> {
        match topic {
            b"V" => Some(TypeTag::V),
            b"alerts" => Some(TypeTag::Alerts),
            b"errors" => Some(TypeTag::Errors),
            b"connectivity" => Some(TypeTag::Connectivity),
            _ => None,
        }
    }

    /// The wire form of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::V => "V",
            TypeTag::Alerts => "alerts",
            TypeTag::Errors => "errors",
            TypeTag::Connectivity => "connectivity",
        }
    }

    /// The topic name used when deriving backend addresses.
    ///
    /// `V` maps to `data`; every other tag maps verbatim. The substitution
    /// predates this server and is load-bearing for existing subscribers.
    pub fn topic_name(&self) -> &'static str {
        match self {
            TypeTag::V => "data",
            other => other.as_str(),
        }
    }

    /// All known tags, in wire order.
    pub fn all() -> [TypeTag; 4] {
        [
            TypeTag::V,
            TypeTag::Alerts,
            TypeTag::Errors,
            TypeTag::Connectivity,
        ]
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TypeTag {
    type Err = UnknownTypeTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TypeTag::from_topic(s.as_bytes()).ok_or_else(|| UnknownTypeTag {
            tag: s.to_string(),
        })
    }
}

/// Error returned when parsing an unknown type tag from configuration.
#[derive(thiserror::Error, Debug)]
#[error("unknown record type tag '{tag}'")]
pub struct UnknownTypeTag {
    /// The offending tag.
    pub tag: String,
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Received from a vehicle over the wire.
    Vehicle,
    /// Manufactured by the server (connection lifecycle events). Synthetic
    /// records never engage the acknowledgement path.
    Synthetic,
}

/// Receive timestamps stamped when the record is read off the wire.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveTime {
    /// Wall-clock time, for downstream consumers.
    pub wall: SystemTime,
    /// Monotonic time, for in-process deadlines.
    pub mono: Instant,
}

impl ReceiveTime {
    /// Captures the current time.
    pub fn now() -> Self {
        Self {
            wall: SystemTime::now(),
            mono: Instant::now(),
        }
    }
}

/// One unit of telemetry traveling through the pipeline.
///
/// Cloning is cheap: the payload is reference-counted.
#[derive(Debug, Clone)]
pub struct Record {
    /// Opaque transaction id; unique within its originating connection.
    pub txid: Bytes,
    /// Routing key.
    pub type_tag: TypeTag,
    /// Identity of the originating vehicle.
    pub identity: Identity,
    /// When the record was read.
    pub received_at: ReceiveTime,
    /// Payload schema generation.
    pub schema_version: u32,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Vehicle-sourced or server-synthesized.
    pub origin: Origin,
}

impl Record {
    /// Builds a record from a decoded wire envelope.
    ///
    /// The caller has already validated the envelope identity against the
    /// connection identity and resolved the type tag.
    pub fn from_envelope(envelope: Envelope, identity: Identity, type_tag: TypeTag) -> Self {
        Self {
            txid: envelope.txid,
            type_tag,
            identity,
            received_at: ReceiveTime::now(),
            schema_version: CURRENT_SCHEMA_VERSION,
            payload: envelope.payload,
            origin: Origin::Vehicle,
        }
    }

    /// Builds a server-synthesized record.
    pub fn synthetic(identity: Identity, type_tag: TypeTag, payload: Bytes) -> Self {
        Self {
            txid: Bytes::new(),
            type_tag,
            identity,
            received_at: ReceiveTime::now(),
            schema_version: CURRENT_SCHEMA_VERSION,
            payload,
            origin: Origin::Synthetic,
        }
    }

    /// Payload length in bytes.
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }
}

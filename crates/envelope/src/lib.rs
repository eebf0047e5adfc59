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

//! Wire envelope codec.
//!
//! Every frame exchanged with a vehicle is a length-prefixed envelope
//! carrying a transaction id, the sender id, a message topic, and an opaque
//! payload. The same framing is used in both directions; acknowledgement
//! frames reuse the envelope with the reserved `ack` topic. The encoding is
//! part of the vehicle firmware contract and must stay byte-exact.

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::LengthDelimitedCodec;

pub mod payload;

/// Reserved message topic of acknowledgement frames.
pub const ACK_TOPIC: &[u8] = b"ack";

/// Default upper bound on a single frame, prefix excluded.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// All the errors that can occur while encoding or decoding envelopes.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A frame did not decode as an envelope. Malformed frames are terminal
    /// for the connection that produced them.
    #[error("malformed envelope (reason: {reason})")]
    Decode {
        /// The decoder error message.
        reason: String,
    },

    /// A payload did not decode under the schema implied by its topic.
    #[error("malformed payload (topic: {topic}, reason: {reason})")]
    Payload {
        /// The message topic of the record.
        topic: String,
        /// The decoder error message.
        reason: String,
    },

    /// The topic does not name a known payload schema.
    #[error("no payload schema for topic '{topic}'")]
    UnknownSchema {
        /// The offending topic.
        topic: String,
    },
}

/// The framed wire envelope.
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Opaque transaction id, stable per record for ack correlation.
    #[prost(bytes = "bytes", tag = "1")]
    pub txid: Bytes,

    /// Hierarchical sender id (`vehicle_device.<device_id>`).
    #[prost(bytes = "bytes", tag = "2")]
    pub sender_id: Bytes,

    /// Routing topic: one of the record type tags, or the reserved ack
    /// topic on outbound acknowledgement frames.
    #[prost(bytes = "bytes", tag = "3")]
    pub message_topic: Bytes,

    /// Opaque payload in the vehicle wire schema.
    #[prost(bytes = "bytes", tag = "4")]
    pub payload: Bytes,
}

impl Envelope {
    /// Builds an acknowledgement frame for a previously received envelope.
    ///
    /// The payload carries the acknowledged type tag so the vehicle can
    /// correlate without keeping per-topic state.
    pub fn ack(txid: Bytes, sender_id: Bytes, type_tag: &str) -> Self {
        Self {
            txid,
            sender_id,
            message_topic: Bytes::from_static(ACK_TOPIC),
            payload: Bytes::copy_from_slice(type_tag.as_bytes()),
        }
    }

    /// Serializes the envelope into a frame body (prefix excluded).
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)
            .expect("BytesMut has unlimited capacity");
        buf.freeze()
    }

    /// Deserializes a frame body into an envelope.
    pub fn from_bytes(frame: &[u8]) -> Result<Self, Error> {
        Self::decode(frame).map_err(|e| Error::Decode {
            reason: e.to_string(),
        })
    }
}

/// Returns the length-delimited framing codec shared by both directions:
/// a 4-byte big-endian length prefix followed by the envelope body.
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

#[cfg(test)]
mod test {
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::{frame_codec, Envelope, DEFAULT_MAX_FRAME_BYTES};

    fn sample() -> Envelope {
        Envelope {
            txid: Bytes::from_static(&[0x01]),
            sender_id: Bytes::from_static(b"vehicle_device.X"),
            message_topic: Bytes::from_static(b"V"),
            payload: Bytes::from_static(&[0xAB]),
        }
    }

    #[test]
    fn envelope_encoding_is_byte_exact() {
        // Field tags 1..4, each length-delimited: the layout the vehicle
        // firmware ships with.
        let mut expected = vec![0x0A, 0x01, 0x01];
        expected.extend_from_slice(&[0x12, 0x10]);
        expected.extend_from_slice(b"vehicle_device.X");
        expected.extend_from_slice(&[0x1A, 0x01, b'V']);
        expected.extend_from_slice(&[0x22, 0x01, 0xAB]);

        assert_eq!(sample().to_bytes().as_ref(), expected.as_slice());
    }

    #[test]
    fn frame_round_trip() {
        let mut codec = frame_codec(DEFAULT_MAX_FRAME_BYTES);
        let mut wire = BytesMut::new();
        codec.encode(sample().to_bytes(), &mut wire).unwrap();

        // 4-byte big-endian prefix.
        let body_len = sample().to_bytes().len();
        assert_eq!(&wire[..4], (body_len as u32).to_be_bytes().as_slice());

        let frame = codec.decode(&mut wire).unwrap().unwrap();
        let decoded = Envelope::from_bytes(&frame).unwrap();
        assert_eq!(decoded, sample());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = frame_codec(8);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&64u32.to_be_bytes());
        wire.extend_from_slice(&[0u8; 64]);
        assert!(codec.decode(&mut wire).is_err());
    }

    #[test]
    fn malformed_body_is_an_error() {
        // Truncated length-delimited field.
        assert!(Envelope::from_bytes(&[0x0A, 0x05, 0x01]).is_err());
    }

    #[test]
    fn ack_frame_uses_reserved_topic() {
        let ack = Envelope::ack(
            Bytes::from_static(&[0x01]),
            Bytes::from_static(b"vehicle_device.X"),
            "V",
        );
        assert_eq!(ack.message_topic.as_ref(), b"ack");
        assert_eq!(ack.payload.as_ref(), b"V");
        assert_eq!(ack.txid.as_ref(), &[0x01]);
    }
}

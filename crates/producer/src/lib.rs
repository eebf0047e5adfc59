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

//! The uniform contract every downstream backend adapter honors.
//!
//! Producers are stateless from the pipeline's perspective: each one owns
//! its connection pool to a backend and exposes submit-semantics publishing.
//! The pipeline never touches backend sockets directly.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use record::{Origin, Record, TypeTag};

/// All the errors that can occur with a producer.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The producer could not be built from its configuration.
    #[error("producer build failure (producer: {producer}, reason: {reason})")]
    Build {
        /// The name of the producer.
        producer: String,
        /// The failure reason.
        reason: String,
    },

    /// A publish was rejected or failed.
    #[error("publish failure (producer: {producer}, reason: {reason}, context: {context:?})")]
    Publish {
        /// The name of the producer.
        producer: String,
        /// The failure reason.
        reason: String,
        /// Additional error context.
        context: HashMap<String, String>,
    },

    /// The producer has been closed; no further publishes are accepted.
    #[error("producer closed (producer: {producer})")]
    Closed {
        /// The name of the producer.
        producer: String,
    },
}

/// A downstream backend adapter.
///
/// `publish` is submit-semantics: the record is accepted for delivery, not
/// necessarily delivered. Adapters apply their own bounded queueing; a
/// publish that cannot be accepted within the adapter's bound returns an
/// error rather than blocking the pipeline indefinitely.
#[async_trait]
pub trait Producer: Send + Sync {
    /// The configured name of this producer.
    fn name(&self) -> &str;

    /// Submits a record for delivery.
    async fn publish(&self, record: &Record) -> Result<(), Error>;

    /// Drains internal queues within the deadline and releases backend
    /// resources. Records still unacknowledged at the deadline are surfaced
    /// through [`report_error`], never dropped silently. After `close`
    /// returns, `publish` fails with [`Error::Closed`].
    async fn close(&self, deadline: Duration) -> Result<(), Error>;
}

/// Uniform error-reporting hook for producers.
///
/// Logs the failure and increments the per-producer error counter keyed by
/// record type.
pub fn report_error(producer: &str, record_type: &str, error: &Error) {
    tracing::error!(%producer, %record_type, %error, "producer error");
    metrics::counter!(format!("{producer}_err"), "record_type" => record_type.to_string())
        .increment(1);
}

/// A durable-acceptance signal emitted by a backend's delivery callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    /// Device id of the originating vehicle.
    pub device_id: String,
    /// Transaction id of the acknowledged record.
    pub txid: Bytes,
    /// Type tag of the acknowledged record.
    pub type_tag: TypeTag,
    /// Name of the producer that confirmed acceptance.
    pub source: String,
}

/// Hands durable-acceptance signals from a backend to the ack coordinator.
///
/// Each adapter receives a handle at build time, restricted to the type
/// tags the adapter is the designated ack source for. Signals for any other
/// tag, and signals for synthetic records, are discarded at the handle.
#[derive(Clone)]
pub struct ReliableAckHandle {
    source: String,
    ack_tags: HashSet<TypeTag>,
    tx: flume::Sender<AckEvent>,
}

impl ReliableAckHandle {
    /// Creates a handle for the named producer, restricted to `ack_tags`.
    pub fn new(source: &str, ack_tags: HashSet<TypeTag>, tx: flume::Sender<AckEvent>) -> Self {
        Self {
            source: source.to_string(),
            ack_tags,
            tx,
        }
    }

    /// A handle that forwards nothing, for producers that are no tag's
    /// designated ack source.
    pub fn disabled(source: &str, tx: flume::Sender<AckEvent>) -> Self {
        Self::new(source, HashSet::new(), tx)
    }

    /// Forwards the durable-acceptance signal for `record`, if eligible.
    ///
    /// Never blocks: a full coordinator inbox drops the signal and counts
    /// it, since delivery callbacks run on backend threads.
    pub fn confirm(&self, record: &Record) {
        if record.origin != Origin::Vehicle || !self.ack_tags.contains(&record.type_tag) {
            return;
        }
        let event = AckEvent {
            device_id: record.identity.device_id().to_string(),
            txid: record.txid.clone(),
            type_tag: record.type_tag,
            source: self.source.clone(),
        };
        if self.tx.try_send(event).is_err() {
            tracing::warn!(
                producer = %self.source,
                record_type = %record.type_tag,
                "ack coordinator inbox full, dropping acceptance signal"
            );
            metrics::counter!("ack_dropped_total", "reason" => "coordinator_inbox_full")
                .increment(1);
        }
    }
}

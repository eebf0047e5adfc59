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

//! Backend adapters implementing the producer contract.
//!
//! Each adapter owns its own client/connection pool and derives its wire
//! address deterministically from `(namespace, identity, type_tag)`. The
//! pipeline stays backend-agnostic: everything below the [`Producer`]
//! trait is private to this crate.

use std::{collections::HashSet, sync::Arc};

use config::Config;
use producer::{AckEvent, Producer, ReliableAckHandle};
use record::TypeTag;

pub mod file;
pub mod kafka;
pub mod nats;
pub mod zmq;

/// Subject/topic form used by subject-based backends:
/// `<namespace>.<device_id>.<topic_name>`.
///
/// The topic name keeps the historical `V -> data` substitution for
/// wire-level compatibility with existing subscribers.
pub(crate) fn subject(namespace: &str, device_id: &str, type_tag: TypeTag) -> String {
    format!("{namespace}.{device_id}.{}", type_tag.topic_name())
}

/// Topic form used by the partitioned commit log:
/// `<namespace>_<topic_name>`. The device id travels as the message key.
pub(crate) fn log_topic(namespace: &str, type_tag: TypeTag) -> String {
    format!("{namespace}_{}", type_tag.topic_name())
}

/// Builds every producer referenced by the routing tables.
///
/// Each producer is wired with a reliable-ack handle restricted to the type
/// tags it is the designated ack source for; producers that are no tag's
/// designate get a handle that forwards nothing.
pub async fn build_producers(
    config: &Config,
    ack_tx: flume::Sender<AckEvent>,
) -> Result<std::collections::HashMap<String, Arc<dyn Producer>>, producer::Error> {
    let ack_routes = config.ack_routes().map_err(|e| producer::Error::Build {
        producer: "<config>".into(),
        reason: e.to_string(),
    })?;

    let mut producers: std::collections::HashMap<String, Arc<dyn Producer>> =
        std::collections::HashMap::new();

    for name in config.referenced_producers() {
        let ack_tags: HashSet<TypeTag> = ack_routes
            .iter()
            .filter(|(_, source)| **source == name)
            .map(|(tag, _)| *tag)
            .collect();
        let handle = ReliableAckHandle::new(&name, ack_tags, ack_tx.clone());

        let built: Arc<dyn Producer> = match name.as_str() {
            "kafka" => {
                let block = require_block(&name, config.backends.kafka.as_ref())?;
                Arc::new(kafka::KafkaProducer::new(
                    block,
                    &config.namespace,
                    handle,
                )?)
            }
            "nats" => {
                let block = require_block(&name, config.backends.nats.as_ref())?;
                Arc::new(nats::NatsProducer::connect(block, &config.namespace, handle).await?)
            }
            "zmq" => {
                let block = require_block(&name, config.backends.zmq.as_ref())?;
                Arc::new(zmq::ZmqProducer::bind(block, &config.namespace, handle).await?)
            }
            "file" => {
                let block = require_block(&name, config.backends.file.as_ref())?;
                Arc::new(
                    file::FileProducer::open(block, config.transmit_decoded_records, handle)
                        .await?,
                )
            }
            other => {
                return Err(producer::Error::Build {
                    producer: other.to_string(),
                    reason: "no adapter with this name".into(),
                })
            }
        };
        let _previous = producers.insert(name, built);
    }

    Ok(producers)
}

fn require_block<'a, T>(name: &str, block: Option<&'a T>) -> Result<&'a T, producer::Error> {
    block.ok_or_else(|| producer::Error::Build {
        producer: name.to_string(),
        reason: "backend block missing from configuration".into(),
    })
}

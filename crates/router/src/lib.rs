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

//! Static record routing.
//!
//! The router maps a record's type tag to an ordered list of producers and,
//! optionally, to the single producer whose durable-acceptance signal
//! triggers an acknowledgement back to the vehicle. The table is immutable
//! after startup and readable without synchronization.

use std::{collections::HashMap, sync::Arc};

use producer::{report_error, Producer};
use record::{Origin, Record, TypeTag};

/// All the errors that can occur while building the routing table.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A fan-out list names a producer that was never built.
    #[error("unknown producer '{producer}' in fan-out list for '{record_type}'")]
    UnknownProducer {
        /// The record type whose list is broken.
        record_type: String,
        /// The missing producer name.
        producer: String,
    },

    /// An ack designate does not appear in the fan-out list of its own tag.
    #[error("ack source '{producer}' for '{record_type}' is not in that type's fan-out list")]
    AckSourceNotInFanOut {
        /// The record type whose designate is broken.
        record_type: String,
        /// The designated producer name.
        producer: String,
    },
}

/// Immutable fan-out table.
pub struct Router {
    routes: HashMap<TypeTag, Vec<Arc<dyn Producer>>>,
    ack_sources: HashMap<TypeTag, String>,
}

impl Router {
    /// Builds the routing table from configured name lists and the set of
    /// constructed producers.
    ///
    /// Every ack designate must appear in the fan-out list for the same
    /// tag; a designate whose acceptance signal could never be produced
    /// would silently break the acknowledgement contract.
    pub fn new(
        records: &HashMap<TypeTag, Vec<String>>,
        ack_sources: &HashMap<TypeTag, String>,
        producers: &HashMap<String, Arc<dyn Producer>>,
    ) -> Result<Self, Error> {
        let mut routes: HashMap<TypeTag, Vec<Arc<dyn Producer>>> = HashMap::new();

        for (type_tag, names) in records {
            let mut fan_out = Vec::with_capacity(names.len());
            for name in names {
                let producer = producers.get(name).ok_or_else(|| Error::UnknownProducer {
                    record_type: type_tag.to_string(),
                    producer: name.clone(),
                })?;
                fan_out.push(producer.clone());
            }
            let _previous = routes.insert(*type_tag, fan_out);
        }

        for (type_tag, source) in ack_sources {
            let in_fan_out = records
                .get(type_tag)
                .map(|names| names.contains(source))
                .unwrap_or(false);
            if !in_fan_out {
                return Err(Error::AckSourceNotInFanOut {
                    record_type: type_tag.to_string(),
                    producer: source.clone(),
                });
            }
        }

        Ok(Self {
            routes,
            ack_sources: ack_sources.clone(),
        })
    }

    /// Fans the record out to every producer configured for its type tag,
    /// in configured order.
    ///
    /// Publish is submit-semantics; the router hands the record off and
    /// moves on. A failing producer is reported and skipped; retries are
    /// the producer's own responsibility, and one backend's failure never
    /// starves the others.
    pub async fn dispatch(&self, record: &Record) {
        let Some(fan_out) = self.routes.get(&record.type_tag) else {
            // A known tag with no configured producers: accepted silently.
            metrics::counter!(
                "records_dispatched_total",
                "record_type" => record.type_tag.as_str(),
                "producer" => "none"
            )
            .increment(1);
            return;
        };

        for producer in fan_out {
            match producer.publish(record).await {
                Ok(()) => {
                    metrics::counter!(
                        "records_dispatched_total",
                        "record_type" => record.type_tag.as_str(),
                        "producer" => producer.name().to_string()
                    )
                    .increment(1);
                }
                Err(error) => {
                    report_error(producer.name(), record.type_tag.as_str(), &error);
                }
            }
        }
    }

    /// The designated ack source for a tag, if one is configured.
    pub fn ack_source(&self, type_tag: TypeTag) -> Option<&str> {
        self.ack_sources.get(&type_tag).map(String::as_str)
    }

    /// Whether the record participates in the acknowledgement path.
    pub fn is_ack_eligible(&self, record: &Record) -> bool {
        record.origin == Origin::Vehicle && self.ack_sources.contains_key(&record.type_tag)
    }
}

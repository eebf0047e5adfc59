//! Partitioned commit log adapter.
//!
//! Records are appended to `<namespace>_<topic_name>` with the device id as
//! the message key, so one vehicle's records land on one partition and keep
//! their per-connection order. The client's delivery callback is the
//! durable-acceptance signal feeding the reliable-ack path.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use config::KafkaConfig;
use producer::{report_error, Error, Producer, ReliableAckHandle};
use rdkafka::{
    config::ClientConfig,
    error::KafkaError,
    message::{Header, OwnedHeaders},
    producer::{BaseRecord, DeliveryResult, Producer as _, ProducerContext, ThreadedProducer},
    types::RDKafkaErrorCode,
    util::Timeout,
    ClientContext,
};
use record::Record;

use crate::log_topic;

const NAME: &str = "kafka";

/// Client context receiving per-message delivery callbacks on the client's
/// poll thread.
struct DeliveryContext {
    ack: ReliableAckHandle,
}

impl ClientContext for DeliveryContext {}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<Record>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, record: Self::DeliveryOpaque) {
        match delivery_result {
            Ok(_) => self.ack.confirm(&record),
            Err((error, _)) => report_error(
                NAME,
                record.type_tag.as_str(),
                &Error::Publish {
                    producer: NAME.to_string(),
                    reason: error.to_string(),
                    context: Default::default(),
                },
            ),
        }
    }
}

/// Producer backed by a partitioned commit log.
pub struct KafkaProducer {
    namespace: String,
    publish_timeout: Duration,
    inner: ThreadedProducer<DeliveryContext>,
    closed: AtomicBool,
}

impl KafkaProducer {
    /// Builds the client from its configuration block. The connection is
    /// established lazily by the client's own poll thread.
    pub fn new(
        config: &KafkaConfig,
        namespace: &str,
        ack: ReliableAckHandle,
    ) -> Result<Self, Error> {
        let mut client_config = ClientConfig::new();
        let _ = client_config.set("bootstrap.servers", &config.bootstrap_servers);
        for (key, value) in &config.settings {
            let _ = client_config.set(key, value);
        }

        let inner = client_config
            .create_with_context(DeliveryContext { ack })
            .map_err(|e| Error::Build {
                producer: NAME.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            namespace: namespace.to_string(),
            publish_timeout: config.publish_timeout,
            inner,
            closed: AtomicBool::new(false),
        })
    }

    fn enqueue(&self, record: &Record, topic: &str) -> Result<(), (KafkaError, Box<Record>)> {
        let base = BaseRecord::with_opaque_to(topic, Box::new(record.clone()))
            .key(record.identity.device_id())
            .payload(record.payload.as_ref())
            .headers(OwnedHeaders::new().insert(Header {
                key: "txid",
                value: Some(record.txid.as_ref()),
            }));
        self.inner.send(base).map_err(|(e, rejected)| {
            let opaque = rejected.delivery_opaque;
            (e, opaque)
        })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    fn name(&self) -> &str {
        NAME
    }

    async fn publish(&self, record: &Record) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed {
                producer: NAME.to_string(),
            });
        }

        let topic = log_topic(&self.namespace, record.type_tag);
        match self.enqueue(record, &topic) {
            Ok(()) => Ok(()),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                // One bounded wait for the poll thread to make room; a queue
                // that is still full afterwards is the backend's problem.
                tokio::time::sleep(self.publish_timeout).await;
                self.enqueue(record, &topic).map_err(|(e, _)| Error::Publish {
                    producer: NAME.to_string(),
                    reason: e.to_string(),
                    context: [("topic".to_string(), topic.clone())].into(),
                })
            }
            Err((e, _)) => Err(Error::Publish {
                producer: NAME.to_string(),
                reason: e.to_string(),
                context: [("topic".to_string(), topic.clone())].into(),
            }),
        }
    }

    async fn close(&self, deadline: Duration) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);

        let flushed = self.inner.flush(Timeout::After(deadline));
        let remaining = self.inner.in_flight_count();
        if remaining > 0 {
            report_error(
                NAME,
                "all",
                &Error::Publish {
                    producer: NAME.to_string(),
                    reason: format!("{remaining} records still unacknowledged at close deadline"),
                    context: Default::default(),
                },
            );
        }
        flushed.map_err(|e| Error::Publish {
            producer: NAME.to_string(),
            reason: e.to_string(),
            context: Default::default(),
        })
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use identity::Identity;
    use producer::{Producer, ReliableAckHandle};
    use record::{Record, TypeTag};

    use crate::kafka::KafkaProducer;

    fn kafka_config() -> config::KafkaConfig {
        config::KafkaConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            publish_timeout: Duration::from_millis(100),
            settings: [("message.timeout.ms".to_string(), "5000".to_string())].into(),
        }
    }

    #[tokio::test]
    async fn close_rejects_later_publishes() {
        let (tx, _rx) = flume::bounded(4);
        let producer = KafkaProducer::new(
            &kafka_config(),
            "ns",
            ReliableAckHandle::disabled("kafka", tx),
        )
        .unwrap();

        producer.close(Duration::from_millis(10)).await.unwrap();

        let identity = Identity::from_device_id("device42").unwrap();
        let record = Record::synthetic(identity, TypeTag::V, Bytes::from_static(b"p"));
        assert!(matches!(
            producer.publish(&record).await,
            Err(producer::Error::Closed { .. })
        ));
    }
}

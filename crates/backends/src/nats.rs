//! Subject bus adapter.
//!
//! Records are published to `<namespace>.<device_id>.<topic_name>`. The bus
//! offers no broker-side delivery receipt: a publish accepted by the client
//! is the durable-acceptance signal. Connection loss is reported at the
//! configured severity; at `fatal`, publishes fail until the client
//! reconnects instead of aborting the process.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use config::{DisconnectSeverity, NatsConfig};
use producer::{Error, Producer, ReliableAckHandle};
use record::Record;

use crate::subject;

const NAME: &str = "nats";

/// Producer backed by the subject bus.
pub struct NatsProducer {
    namespace: String,
    publish_timeout: Duration,
    client: async_nats::Client,
    ack: ReliableAckHandle,
    severity: DisconnectSeverity,
    healthy: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl NatsProducer {
    /// Connects to the configured servers.
    pub async fn connect(
        config: &NatsConfig,
        namespace: &str,
        ack: ReliableAckHandle,
    ) -> Result<Self, Error> {
        let healthy = Arc::new(AtomicBool::new(true));
        let severity = config.disconnect_severity;

        let callback_healthy = healthy.clone();
        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let healthy = callback_healthy.clone();
                async move {
                    match event {
                        async_nats::Event::Disconnected => {
                            healthy.store(false, Ordering::SeqCst);
                            metrics::gauge!("backend_healthy", "producer" => NAME).set(0.0);
                            match severity {
                                DisconnectSeverity::Warn => {
                                    tracing::warn!(producer = NAME, "subject bus disconnected")
                                }
                                DisconnectSeverity::Error | DisconnectSeverity::Fatal => {
                                    tracing::error!(producer = NAME, "subject bus disconnected")
                                }
                            }
                        }
                        async_nats::Event::Connected => {
                            healthy.store(true, Ordering::SeqCst);
                            metrics::gauge!("backend_healthy", "producer" => NAME).set(1.0);
                            tracing::info!(producer = NAME, "subject bus connected");
                        }
                        other => {
                            tracing::debug!(producer = NAME, event = %other, "subject bus event")
                        }
                    }
                }
            })
            .connect(config.servers.join(","))
            .await
            .map_err(|e| Error::Build {
                producer: NAME.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            namespace: namespace.to_string(),
            publish_timeout: config.publish_timeout,
            client,
            ack,
            severity,
            healthy,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Producer for NatsProducer {
    fn name(&self) -> &str {
        NAME
    }

    async fn publish(&self, record: &Record) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed {
                producer: NAME.to_string(),
            });
        }
        if self.severity == DisconnectSeverity::Fatal && !self.healthy.load(Ordering::SeqCst) {
            return Err(Error::Publish {
                producer: NAME.to_string(),
                reason: "subject bus disconnected".into(),
                context: Default::default(),
            });
        }

        let subject = subject(
            &self.namespace,
            record.identity.device_id(),
            record.type_tag,
        );
        let publish = self.client.publish(subject.clone(), record.payload.clone());
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => {
                self.ack.confirm(record);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Publish {
                producer: NAME.to_string(),
                reason: e.to_string(),
                context: [("subject".to_string(), subject)].into(),
            }),
            Err(_) => Err(Error::Publish {
                producer: NAME.to_string(),
                reason: format!("publish exceeded {:?}", self.publish_timeout),
                context: [("subject".to_string(), subject)].into(),
            }),
        }
    }

    async fn close(&self, deadline: Duration) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        match tokio::time::timeout(deadline, self.client.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Publish {
                producer: NAME.to_string(),
                reason: e.to_string(),
                context: Default::default(),
            }),
            Err(_) => Err(Error::Publish {
                producer: NAME.to_string(),
                reason: "flush exceeded close deadline".into(),
                context: Default::default(),
            }),
        }
    }
}

//! Raw socket bus adapter.
//!
//! A single PUB socket bound at the configured endpoint. Each record is a
//! two-frame message: the subject (`<namespace>.<device_id>.<topic_name>`)
//! followed by the raw payload, so subscribers can prefix-filter without
//! parsing. A successful send is the durable-acceptance signal; the bus has
//! no receipts.

use std::time::Duration;

use async_trait::async_trait;
use config::ZmqConfig;
use producer::{Error, Producer, ReliableAckHandle};
use record::Record;
use tokio::sync::Mutex;
use zeromq::{PubSocket, Socket, SocketSend, ZmqMessage};

use crate::subject;

const NAME: &str = "zmq";

/// Producer backed by the raw socket bus.
pub struct ZmqProducer {
    namespace: String,
    // PUB sends need exclusive access; None once closed.
    socket: Mutex<Option<PubSocket>>,
    ack: ReliableAckHandle,
}

impl ZmqProducer {
    /// Binds the PUB socket at the configured endpoint.
    pub async fn bind(
        config: &ZmqConfig,
        namespace: &str,
        ack: ReliableAckHandle,
    ) -> Result<Self, Error> {
        let mut socket = PubSocket::new();
        let _endpoint = socket
            .bind(&config.endpoint)
            .await
            .map_err(|e| Error::Build {
                producer: NAME.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            namespace: namespace.to_string(),
            socket: Mutex::new(Some(socket)),
            ack,
        })
    }
}

#[async_trait]
impl Producer for ZmqProducer {
    fn name(&self) -> &str {
        NAME
    }

    async fn publish(&self, record: &Record) -> Result<(), Error> {
        let subject = subject(
            &self.namespace,
            record.identity.device_id(),
            record.type_tag,
        );
        let mut message = ZmqMessage::from(subject.clone());
        message.push_back(record.payload.clone());

        let mut guard = self.socket.lock().await;
        let socket = guard.as_mut().ok_or_else(|| Error::Closed {
            producer: NAME.to_string(),
        })?;
        socket.send(message).await.map_err(|e| Error::Publish {
            producer: NAME.to_string(),
            reason: e.to_string(),
            context: [("subject".to_string(), subject)].into(),
        })?;

        self.ack.confirm(record);
        Ok(())
    }

    async fn close(&self, _deadline: Duration) -> Result<(), Error> {
        // Dropping the socket tears the transport down; the bus keeps no
        // queue worth draining.
        let _socket = self.socket.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;
    use identity::Identity;
    use producer::{Producer, ReliableAckHandle};
    use record::{Record, TypeTag};

    use crate::zmq::ZmqProducer;

    fn zmq_config() -> config::ZmqConfig {
        config::ZmqConfig {
            endpoint: "tcp://127.0.0.1:0".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_close() {
        let (tx, _rx) = flume::bounded(4);
        let producer = ZmqProducer::bind(&zmq_config(), "ns", ReliableAckHandle::disabled("zmq", tx))
            .await
            .unwrap();

        let identity = Identity::from_device_id("device42").unwrap();
        let record = Record::synthetic(identity, TypeTag::V, Bytes::from_static(b"p"));

        // PUB with no subscribers drops on the floor but the send succeeds.
        producer.publish(&record).await.unwrap();

        producer.close(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(
            producer.publish(&record).await,
            Err(producer::Error::Closed { .. })
        ));
    }
}

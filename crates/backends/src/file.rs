//! Local file sink.
//!
//! One JSON line per record, appended to a single file. Used for shadowing
//! a production fan-out or debugging a vehicle without standing up a
//! broker. With decoded transmission on, the opaque payload is parsed under
//! its schema and emitted as JSON; otherwise it is base64.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use config::FileConfig;
use producer::{Error, Producer, ReliableAckHandle};
use record::Record;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::Mutex,
};

const NAME: &str = "file";

/// Producer appending records to a local file.
pub struct FileProducer {
    path: String,
    writer: Mutex<BufWriter<File>>,
    decode_payloads: bool,
    ack: ReliableAckHandle,
    closed: AtomicBool,
}

impl FileProducer {
    /// Opens (or creates) the sink file in append mode.
    pub async fn open(
        config: &FileConfig,
        decode_payloads: bool,
        ack: ReliableAckHandle,
    ) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .await
            .map_err(|e| Error::Build {
                producer: NAME.to_string(),
                reason: format!("{}: {e}", config.path.display()),
            })?;

        Ok(Self {
            path: config.path.display().to_string(),
            writer: Mutex::new(BufWriter::new(file)),
            decode_payloads,
            ack,
            closed: AtomicBool::new(false),
        })
    }

    fn render_line(&self, record: &Record) -> serde_json::Value {
        let payload = if self.decode_payloads {
            match envelope::payload::decoded_json(record.type_tag.as_str(), &record.payload) {
                Ok(decoded) => decoded,
                Err(error) => {
                    tracing::warn!(
                        producer = NAME,
                        record_type = %record.type_tag,
                        %error,
                        "payload did not decode, falling back to raw"
                    );
                    metrics::counter!("payload_decode_errors_total",
                        "record_type" => record.type_tag.as_str())
                    .increment(1);
                    serde_json::Value::String(BASE64_STANDARD.encode(&record.payload))
                }
            }
        } else {
            serde_json::Value::String(BASE64_STANDARD.encode(&record.payload))
        };

        let received_ms = record
            .received_at
            .wall
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        serde_json::json!({
            "device_id": record.identity.device_id(),
            "record_type": record.type_tag.as_str(),
            "txid": hex::encode(&record.txid),
            "received_at": received_ms,
            "schema_version": record.schema_version,
            "size_bytes": record.size_bytes(),
            "payload": payload,
        })
    }
}

#[async_trait]
impl Producer for FileProducer {
    fn name(&self) -> &str {
        NAME
    }

    async fn publish(&self, record: &Record) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed {
                producer: NAME.to_string(),
            });
        }

        let line = self.render_line(record);
        let mut writer = self.writer.lock().await;
        let io_error = |e: std::io::Error| Error::Publish {
            producer: NAME.to_string(),
            reason: e.to_string(),
            context: [("path".to_string(), self.path.clone())].into(),
        };
        writer
            .write_all(line.to_string().as_bytes())
            .await
            .map_err(io_error)?;
        writer.write_all(b"\n").await.map_err(io_error)?;
        writer.flush().await.map_err(io_error)?;

        self.ack.confirm(record);
        Ok(())
    }

    async fn close(&self, deadline: Duration) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        let flush = async {
            self.writer.lock().await.flush().await.map_err(|e| Error::Publish {
                producer: NAME.to_string(),
                reason: e.to_string(),
                context: [("path".to_string(), self.path.clone())].into(),
            })
        };
        tokio::time::timeout(deadline, flush)
            .await
            .map_err(|_| Error::Publish {
                producer: NAME.to_string(),
                reason: "flush exceeded close deadline".into(),
                context: [("path".to_string(), self.path.clone())].into(),
            })?
    }
}

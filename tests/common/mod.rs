// Shared by several integration test binaries; not every binary uses
// every helper.
#![allow(dead_code)]

use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use fleet_ingest::{
    config::Config,
    envelope::Envelope,
    producer::{Producer, ReliableAckHandle},
    record::{Record, TypeTag},
};
use futures::{SinkExt, StreamExt};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls_pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

/// Throwaway CA plus a server certificate, written out as PEM files the
/// server configuration can point at.
pub struct TestTls {
    pub dir: tempfile::TempDir,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_ca: PathBuf,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

impl TestTls {
    pub fn generate() -> Self {
        // Pin the process-wide TLS provider; the binary does the same in
        // its init path.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let dir = tempfile::tempdir().expect("tempdir");

        let mut ca_params = CertificateParams::new(vec![]).expect("ca params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().expect("ca key");
        let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

        let server_params =
            CertificateParams::new(vec!["localhost".to_string()]).expect("server params");
        let server_key = KeyPair::generate().expect("server key");
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .expect("server cert");

        let server_cert_path = dir.path().join("server.pem");
        let server_key_path = dir.path().join("server-key.pem");
        let client_ca_path = dir.path().join("vehicles-ca.pem");
        std::fs::write(&server_cert_path, server_cert.pem()).expect("write server cert");
        std::fs::write(&server_key_path, server_key.serialize_pem()).expect("write server key");
        std::fs::write(&client_ca_path, ca_cert.pem()).expect("write ca");

        Self {
            dir,
            server_cert: server_cert_path,
            server_key: server_key_path,
            client_ca: client_ca_path,
            ca_cert,
            ca_key,
        }
    }

    /// Issues a client certificate whose common name is the device id.
    pub fn client_identity(&self, device_id: &str) -> (String, String) {
        let mut params = CertificateParams::new(vec![]).expect("client params");
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, device_id);
        let key = KeyPair::generate().expect("client key");
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .expect("client cert");
        (cert.pem(), key.serialize_pem())
    }
}

/// Renders a full configuration document around the test TLS material.
/// `body` holds the per-test sections (records, ack sources, rate limits).
pub fn config_yaml(tls: &TestTls, port: u16, body: &str) -> String {
    format!(
        r#"listen_addr: "127.0.0.1:{port}"
namespace: test_ns
tls:
  server_cert: {server_cert}
  server_key: {server_key}
  client_ca: {client_ca}
backends:
  kafka:
    bootstrap_servers: "localhost:9092"
  nats:
    servers: ["nats://localhost:4222"]
{body}
"#,
        server_cert = tls.server_cert.display(),
        server_key = tls.server_key.display(),
        client_ca = tls.client_ca.display(),
    )
}

pub fn load_config(tls: &TestTls, port: u16, body: &str) -> Config {
    Config::from_yaml(&config_yaml(tls, port, body)).expect("test config")
}

/// Try to bind to a port.
fn try_bind_tcp<A: ToSocketAddrs>(addr: A) -> Option<u16> {
    Some(std::net::TcpListener::bind(addr).ok()?.local_addr().ok()?.port())
}

/// Finds a free TCP port for the listener.
pub fn available_tcp_port(first_port_to_scan: u16) -> u16 {
    let mut port = first_port_to_scan;
    while try_bind_tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_none() {
        port += 1;
        if port > 65534 {
            panic!("Could not find an available port for the listener");
        }
    }
    port
}

/// Waits until the listener accepts TCP connections.
pub async fn wait_until_listening(port: u16) {
    let started_at = std::time::Instant::now();
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            break;
        }
        if started_at.elapsed() > Duration::from_secs(5) {
            panic!("server not ready after 5 seconds (port: {port})");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// In-memory producer recording everything it is handed. Confirms durable
/// acceptance immediately on publish, like the file sink does.
pub struct RecordingProducer {
    name: String,
    fail: bool,
    ack: Option<ReliableAckHandle>,
    pub records: Mutex<Vec<Record>>,
    pub attempts: AtomicUsize,
}

impl RecordingProducer {
    pub fn new(name: &str, ack: Option<ReliableAckHandle>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            ack,
            records: Mutex::new(vec![]),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            ack: None,
            records: Mutex::new(vec![]),
            attempts: AtomicUsize::new(0),
        })
    }

    /// Builds a handle that makes this producer the designated ack source
    /// for the given tags.
    pub fn ack_handle(
        name: &str,
        tags: &[TypeTag],
        tx: &flume::Sender<fleet_ingest::producer::AckEvent>,
    ) -> ReliableAckHandle {
        ReliableAckHandle::new(name, HashSet::from_iter(tags.iter().copied()), tx.clone())
    }

    pub fn received(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<Bytes> {
        self.received().iter().map(|r| r.payload.clone()).collect()
    }
}

#[async_trait]
impl Producer for RecordingProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, record: &Record) -> Result<(), fleet_ingest::producer::Error> {
        let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(fleet_ingest::producer::Error::Publish {
                producer: self.name.clone(),
                reason: "backend unavailable".into(),
                context: Default::default(),
            });
        }
        self.records.lock().unwrap().push(record.clone());
        if let Some(ack) = &self.ack {
            ack.confirm(record);
        }
        Ok(())
    }

    async fn close(&self, _deadline: Duration) -> Result<(), fleet_ingest::producer::Error> {
        Ok(())
    }
}

type WireFramed = Framed<tokio_rustls::client::TlsStream<TcpStream>, tokio_util::codec::LengthDelimitedCodec>;

/// A vehicle-side test client speaking the framed envelope protocol over
/// mutually-authenticated TLS.
pub struct VehicleClient {
    pub device_id: String,
    framed: WireFramed,
}

impl VehicleClient {
    pub async fn connect(tls: &TestTls, port: u16, device_id: &str) -> Self {
        let (cert_pem, key_pem) = tls.client_identity(device_id);

        let mut roots = rustls::RootCertStore::empty();
        for cert in CertificateDer::pem_file_iter(&tls.client_ca).expect("ca pem") {
            roots.add(cert.expect("ca cert")).expect("add ca");
        }
        let client_cert: Vec<CertificateDer<'static>> =
            CertificateDer::pem_slice_iter(cert_pem.as_bytes())
                .collect::<Result<_, _>>()
                .expect("client cert");
        let client_key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes()).expect("client key");

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(client_cert, client_key)
            .expect("client tls config");

        let tcp = TcpStream::connect(("127.0.0.1", port)).await.expect("tcp connect");
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from("localhost").expect("server name");
        let stream = connector.connect(server_name, tcp).await.expect("tls connect");

        Self {
            device_id: device_id.to_string(),
            framed: Framed::new(stream, fleet_ingest::envelope::frame_codec(1024 * 1024)),
        }
    }

    pub async fn send(&mut self, txid: &[u8], topic: &[u8], payload: &[u8]) {
        let envelope = Envelope {
            txid: Bytes::copy_from_slice(txid),
            sender_id: Bytes::from(format!("vehicle_device.{}", self.device_id)),
            message_topic: Bytes::copy_from_slice(topic),
            payload: Bytes::copy_from_slice(payload),
        };
        self.framed
            .send(envelope.to_bytes())
            .await
            .expect("send envelope");
    }

    /// Sends an envelope whose sender id disagrees with the connection
    /// identity.
    pub async fn send_as(&mut self, sender_id: &[u8], txid: &[u8], topic: &[u8], payload: &[u8]) {
        let envelope = Envelope {
            txid: Bytes::copy_from_slice(txid),
            sender_id: Bytes::copy_from_slice(sender_id),
            message_topic: Bytes::copy_from_slice(topic),
            payload: Bytes::copy_from_slice(payload),
        };
        self.framed
            .send(envelope.to_bytes())
            .await
            .expect("send envelope");
    }

    /// Next inbound frame within the timeout, decoded as an envelope.
    pub async fn recv(&mut self, within: Duration) -> Option<Envelope> {
        match tokio::time::timeout(within, self.framed.next()).await {
            Ok(Some(Ok(frame))) => Some(Envelope::from_bytes(&frame).expect("decode frame")),
            _ => None,
        }
    }

    /// Asserts the server closes the connection within the window.
    pub async fn expect_close(&mut self, within: Duration) {
        match tokio::time::timeout(within, self.framed.next()).await {
            Ok(None) | Ok(Some(Err(_))) => {}
            Ok(Some(Ok(_))) => panic!("expected close, received a frame"),
            Err(_) => panic!("connection still open after {within:?}"),
        }
    }
}

/// Polls until the predicate holds or the deadline passes.
pub async fn eventually<F: Fn() -> bool>(within: Duration, predicate: F) -> bool {
    let started_at = std::time::Instant::now();
    while started_at.elapsed() < within {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

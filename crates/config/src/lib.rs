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

//! Configuration of the ingestion server.
//!
//! A single YAML document declares the bind address, TLS material, the
//! record routing tables, the backend blocks, and the operational knobs.
//! The configuration is loaded once at startup and never reloaded.

use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use record::TypeTag;
use serde::Deserialize;
use tracing::debug;
use validator::Validate;

/// Errors for the config module.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read or parsed.
    #[error("invalid configuration file `{file}` - {message}")]
    InvalidConfig {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// A routing section names an unknown record type tag.
    #[error("unknown record type '{tag}' in section '{section}' (config file '{file}')")]
    UnknownTypeTag {
        /// The path to the config file.
        file: String,
        /// The section holding the bad tag.
        section: &'static str,
        /// The offending tag.
        tag: String,
    },

    /// A routing section names a producer without a backend block.
    #[error("producer '{producer}' for record type '{record_type}' has no backend block (config file '{file}')")]
    MissingBackend {
        /// The path to the config file.
        file: String,
        /// The record type whose list names the producer.
        record_type: String,
        /// The unbacked producer name.
        producer: String,
    },

    /// An ack designate is missing from its own tag's fan-out list.
    #[error("ack source '{producer}' for record type '{record_type}' is not in that type's fan-out list (config file '{file}')")]
    AckSourceNotInFanOut {
        /// The path to the config file.
        file: String,
        /// The record type whose designate is broken.
        record_type: String,
        /// The designated producer name.
        producer: String,
    },
}

/// The certificate field the vehicle identity is read from.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySourceConfig {
    /// Subject common name.
    CommonName,
    /// First URI subject-alternative-name.
    SanUri,
}

impl Default for IdentitySourceConfig {
    fn default() -> Self {
        IdentitySourceConfig::CommonName
    }
}

impl From<IdentitySourceConfig> for identity::IdentitySource {
    fn from(value: IdentitySourceConfig) -> Self {
        match value {
            IdentitySourceConfig::CommonName => identity::IdentitySource::CommonName,
            IdentitySourceConfig::SanUri => identity::IdentitySource::SanUri,
        }
    }
}

/// TLS material paths.
#[derive(Deserialize, Debug, Clone)]
pub struct TlsConfig {
    /// Server certificate chain, PEM.
    pub server_cert: PathBuf,
    /// Server private key, PEM.
    pub server_key: PathBuf,
    /// CA bundle trusted to sign vehicle client certificates, PEM.
    pub client_ca: PathBuf,
}

/// Per-identity token-bucket parameters.
#[derive(Deserialize, Debug, Clone, Validate)]
pub struct RateLimitConfig {
    /// Whether admission control is applied at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sustained refill rate.
    #[serde(default = "default_records_per_second")]
    #[validate(range(min = 1))]
    pub records_per_second: u32,
    /// Bucket capacity.
    #[serde(default = "default_burst")]
    #[validate(range(min = 1))]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            records_per_second: default_records_per_second(),
            burst: default_burst(),
        }
    }
}

/// Acknowledgement path parameters.
#[derive(Deserialize, Debug, Clone, Validate)]
pub struct AckConfig {
    /// TTL of an in-flight correlation entry.
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub timeout: Duration,
    /// Capacity of each connection's outbound ack queue.
    #[serde(default = "default_ack_queue_size")]
    #[validate(range(min = 1, max = 1000))]
    pub queue_size: usize,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            timeout: default_ack_timeout(),
            queue_size: default_ack_queue_size(),
        }
    }
}

/// Connection lifecycle parameters.
#[derive(Deserialize, Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on the TLS handshake.
    #[serde(with = "humantime_serde", default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,
    /// Close the connection after this long without an inbound frame.
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    /// Time a draining connection gets to flush pending acks.
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    pub drain_timeout: Duration,
    /// Hard deadline on process shutdown.
    #[serde(with = "humantime_serde", default = "default_shutdown_deadline")]
    pub shutdown_deadline: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: default_handshake_timeout(),
            idle_timeout: default_idle_timeout(),
            drain_timeout: default_drain_timeout(),
            shutdown_deadline: default_shutdown_deadline(),
        }
    }
}

/// How severe a lost subject-bus connection is for the process.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectSeverity {
    /// Log a warning and rely on the client's reconnect.
    Warn,
    /// Log an error and mark the backend unhealthy.
    Error,
    /// Mark the backend unhealthy and fail publishes until it recovers.
    Fatal,
}

impl Default for DisconnectSeverity {
    fn default() -> Self {
        DisconnectSeverity::Error
    }
}

/// Partitioned commit log backend block.
#[derive(Deserialize, Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated broker list.
    pub bootstrap_servers: String,
    /// Bound on a single publish enqueue.
    #[serde(with = "humantime_serde", default = "default_publish_timeout")]
    pub publish_timeout: Duration,
    /// Extra librdkafka settings, passed through verbatim.
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

/// Subject bus backend block.
#[derive(Deserialize, Debug, Clone)]
pub struct NatsConfig {
    /// Server URLs.
    pub servers: Vec<String>,
    /// Severity of a lost connection.
    #[serde(default)]
    pub disconnect_severity: DisconnectSeverity,
    /// Bound on a single publish.
    #[serde(with = "humantime_serde", default = "default_publish_timeout")]
    pub publish_timeout: Duration,
}

/// Raw socket bus backend block.
#[derive(Deserialize, Debug, Clone)]
pub struct ZmqConfig {
    /// Endpoint the PUB socket binds.
    pub endpoint: String,
}

/// Local file sink backend block.
#[derive(Deserialize, Debug, Clone)]
pub struct FileConfig {
    /// Append-only output path, one JSON line per record.
    pub path: PathBuf,
}

/// The set of configured backend blocks. A producer name used in the
/// routing tables must have its block present here.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct BackendsConfig {
    /// Partitioned commit log.
    pub kafka: Option<KafkaConfig>,
    /// Subject bus.
    pub nats: Option<NatsConfig>,
    /// Raw socket bus.
    pub zmq: Option<ZmqConfig>,
    /// Local file sink.
    pub file: Option<FileConfig>,
}

impl BackendsConfig {
    /// Whether a block exists for the named producer.
    pub fn contains(&self, producer: &str) -> bool {
        match producer {
            "kafka" => self.kafka.is_some(),
            "nats" => self.nats.is_some(),
            "zmq" => self.zmq.is_some(),
            "file" => self.file.is_some(),
            _ => false,
        }
    }
}

/// Monitoring configuration.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct MonitoringConfig {
    /// Address of the prometheus scrape endpoint; disabled when absent.
    pub prometheus_addr: Option<SocketAddr>,
}

/// Ingestion server configuration.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Address the TLS listener binds.
    pub listen_addr: SocketAddr,
    /// Topic/subject prefix isolating environments sharing a backend.
    pub namespace: String,
    /// Certificate field holding the vehicle identity.
    #[serde(default)]
    pub identity_source: IdentitySourceConfig,
    /// TLS material paths.
    pub tls: TlsConfig,
    /// Record type tag to ordered fan-out list.
    pub records: HashMap<String, Vec<String>>,
    /// Record type tag to designated ack source.
    #[serde(default)]
    pub reliable_ack_sources: HashMap<String, String>,
    /// Emit decoded JSON payloads on the file sink.
    #[serde(default)]
    pub transmit_decoded_records: bool,
    /// Admission control parameters.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Acknowledgement path parameters.
    #[serde(default)]
    pub ack: AckConfig,
    /// Connection lifecycle parameters.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upper bound on a single wire frame, prefix excluded.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Backend blocks.
    #[serde(default)]
    pub backends: BackendsConfig,
    /// Monitoring configuration.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Loads and checks the configuration of the ingestion server.
    ///
    /// # Argument
    /// * `config_file_path` - Path to the configuration
    pub fn from_file<P: AsRef<Path>>(config_file_path: P) -> Result<Self, Error> {
        let config_file_name = config_file_path.as_ref().display().to_string();

        debug!("loading {}", config_file_name);

        let config_file = File::open(config_file_path).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;
        let reader = BufReader::new(config_file);
        let config: Config = serde_yaml::from_reader(reader).map_err(|err| Error::InvalidConfig {
            file: config_file_name.clone(),
            message: err.to_string(),
        })?;
        config.check(&config_file_name)?;

        debug!("{} loaded", config_file_name);

        Ok(config)
    }

    /// Parses and checks an in-memory configuration document.
    pub fn from_yaml(document: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(document).map_err(|err| Error::InvalidConfig {
            file: "<inline>".to_string(),
            message: err.to_string(),
        })?;
        config.check("<inline>")?;
        Ok(config)
    }

    /// The `records` table with parsed type tags.
    pub fn routes(&self) -> Result<HashMap<TypeTag, Vec<String>>, Error> {
        self.records
            .iter()
            .map(|(tag, producers)| {
                let tag = parse_tag(tag, "records", "<config>")?;
                Ok((tag, producers.clone()))
            })
            .collect()
    }

    /// The `reliable_ack_sources` table with parsed type tags.
    pub fn ack_routes(&self) -> Result<HashMap<TypeTag, String>, Error> {
        self.reliable_ack_sources
            .iter()
            .map(|(tag, producer)| {
                let tag = parse_tag(tag, "reliable_ack_sources", "<config>")?;
                Ok((tag, producer.clone()))
            })
            .collect()
    }

    /// The names of every producer referenced by the routing tables, in a
    /// stable order.
    pub fn referenced_producers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .values()
            .flatten()
            .chain(self.reliable_ack_sources.values())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// The configured identity source.
    pub fn identity_source(&self) -> identity::IdentitySource {
        self.identity_source.into()
    }

    /// Structural validation beyond what serde enforces.
    fn check(&self, file: &str) -> Result<(), Error> {
        self.rate_limit
            .validate()
            .and_then(|_| self.ack.validate())
            .map_err(|err| Error::InvalidConfig {
                file: file.to_string(),
                message: err.to_string(),
            })?;

        for (tag, producers) in &self.records {
            let _parsed = parse_tag(tag, "records", file)?;
            for producer in producers {
                if !self.backends.contains(producer) {
                    return Err(Error::MissingBackend {
                        file: file.to_string(),
                        record_type: tag.clone(),
                        producer: producer.clone(),
                    });
                }
            }
        }

        for (tag, producer) in &self.reliable_ack_sources {
            let _parsed = parse_tag(tag, "reliable_ack_sources", file)?;
            let in_fan_out = self
                .records
                .get(tag)
                .map(|producers| producers.contains(producer))
                .unwrap_or(false);
            if !in_fan_out {
                return Err(Error::AckSourceNotInFanOut {
                    file: file.to_string(),
                    record_type: tag.clone(),
                    producer: producer.clone(),
                });
            }
        }

        Ok(())
    }
}

fn parse_tag(tag: &str, section: &'static str, file: &str) -> Result<TypeTag, Error> {
    tag.parse::<TypeTag>().map_err(|_| Error::UnknownTypeTag {
        file: file.to_string(),
        section,
        tag: tag.to_string(),
    })
}

fn default_true() -> bool {
    true
}

fn default_records_per_second() -> u32 {
    100
}

fn default_burst() -> u32 {
    200
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ack_queue_size() -> usize {
    64
}

fn default_handshake_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_deadline() -> Duration {
    Duration::from_secs(30)
}

fn default_publish_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

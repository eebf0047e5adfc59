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

//! The ingestion server.
//!
//! Ties the pieces together: the mutually-authenticated listener, one
//! handler per vehicle connection, the process-wide connection registry,
//! per-identity admission control, and the reliable-ack coordinator.
//! Producers are built by the caller and handed in; the server never
//! touches backend sockets itself.

use std::{collections::HashMap, sync::Arc, time::Duration};

use config::Config;
use producer::{AckEvent, Producer};
use router::Router;
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

pub mod ack;
pub mod limiter;
pub mod registry;

mod connection;
mod listener;
mod tls;

use ack::{AckCoordinator, AckCoordinatorHandle};
use limiter::IngressLimiter;
use registry::Registry;

pub use ack::event_channel;

/// Idle rate-limit buckets are evicted on this period.
const LIMITER_SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// All the errors that can occur while starting or running the server.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// TLS material could not be loaded or assembled.
    #[error("tls setup failure (item: {item}, reason: {reason})")]
    Tls {
        /// Which configured item failed.
        item: &'static str,
        /// The failure reason.
        reason: String,
    },

    /// The listen address could not be bound.
    #[error("bind failure (addr: {addr}, reason: {reason})")]
    Bind {
        /// The configured listen address.
        addr: std::net::SocketAddr,
        /// The failure reason.
        reason: String,
    },

    /// The routing table is invalid.
    #[error("routing error (reason: {0})")]
    Router(#[from] router::Error),

    /// The configuration is invalid.
    #[error("configuration error (reason: {0})")]
    Config(#[from] config::Error),
}

/// State shared by every connection handler.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) router: Router,
    pub(crate) limiter: IngressLimiter,
    pub(crate) registry: Registry,
    pub(crate) acks: AckCoordinatorHandle,
}

/// The assembled ingestion server.
pub struct Server {
    config: Config,
    producers: HashMap<String, Arc<dyn Producer>>,
    router: Router,
    ack_events: flume::Receiver<AckEvent>,
}

impl Server {
    /// Assembles the server from validated configuration, the constructed
    /// producer set, and the receive side of the ack event channel the
    /// producers were wired with.
    pub fn new(
        config: Config,
        producers: HashMap<String, Arc<dyn Producer>>,
        ack_events: flume::Receiver<AckEvent>,
    ) -> Result<Self, Error> {
        let router = Router::new(&config.routes()?, &config.ack_routes()?, &producers)?;
        Ok(Self {
            config,
            producers,
            router,
            ack_events,
        })
    }

    /// Runs until the shutdown token is cancelled, then drains connections
    /// under the configured deadline and closes the producers.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let Self {
            config,
            producers,
            router,
            ack_events,
        } = self;

        let acceptor = tls::build_acceptor(&config.tls)?;
        let listener =
            TcpListener::bind(config.listen_addr)
                .await
                .map_err(|e| Error::Bind {
                    addr: config.listen_addr,
                    reason: e.to_string(),
                })?;
        tracing::info!(addr = %config.listen_addr, "listening for vehicle connections");

        let coordinator =
            AckCoordinator::new(ack_events, config.ack_routes()?, config.ack.timeout);
        let acks = coordinator.handle();
        let coordinator_task = tokio::spawn(coordinator.run(shutdown.child_token()));

        let shared = Arc::new(Shared {
            router,
            limiter: IngressLimiter::new(&config.rate_limit),
            registry: Registry::new(),
            acks,
            config: config.clone(),
        });

        let sweep_shared = shared.clone();
        let sweep_shutdown = shutdown.child_token();
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIMITER_SWEEP_PERIOD);
            loop {
                tokio::select! {
                    _ = sweep_shutdown.cancelled() => break,
                    _ = interval.tick() => sweep_shared.limiter.sweep(),
                }
            }
        });

        let tracker = TaskTracker::new();
        listener::run_listener(
            shared.clone(),
            acceptor,
            listener,
            shutdown.clone(),
            tracker.clone(),
        )
        .await;

        // Connection handlers are draining; give them the hard deadline.
        let _ = tracker.close();
        if tokio::time::timeout(config.connection.shutdown_deadline, tracker.wait())
            .await
            .is_err()
        {
            metrics::counter!("drain_deadline_exceeded_total").increment(1);
            tracing::warn!("connections still draining at the shutdown deadline");
        }

        let _ = coordinator_task.await;
        sweep_task.abort();

        for (name, producer) in &producers {
            if let Err(error) = producer.close(config.connection.drain_timeout).await {
                tracing::error!(producer = %name, %error, "producer close failed");
            }
        }

        tracing::info!("server stopped");
        Ok(())
    }
}

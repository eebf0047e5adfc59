//! Reliable-ack coordination.
//!
//! A single owner task holds every connection's in-flight table (keyed by
//! `(txid, type_tag)`) and the sender side of its outbound ack queue. The
//! rest of the process talks to it through messages: connection handlers
//! register, track, and unregister; durable-acceptance signals from the
//! producers are forwarded into the same inbox, so a record's tracking
//! entry is always applied before its confirmation can be observed.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use producer::AckEvent;
use record::TypeTag;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// An acknowledgement queued for write on the originating connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    /// Transaction id of the acknowledged record.
    pub txid: Bytes,
    /// Type tag of the acknowledged record.
    pub type_tag: TypeTag,
}

/// Counters kept by the coordinator.
#[derive(Debug, Default)]
pub struct AckStats {
    enqueued: AtomicU64,
    orphaned: AtomicU64,
    expired: AtomicU64,
    dropped: AtomicU64,
}

impl AckStats {
    /// Ack frames enqueued onto a connection's outbound queue.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }
    /// Confirmations with no matching in-flight entry.
    pub fn orphaned(&self) -> u64 {
        self.orphaned.load(Ordering::Relaxed)
    }
    /// In-flight entries that aged out.
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }
    /// Acks discarded because the connection or its queue was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub(crate) enum Command {
    Register {
        device_id: String,
        conn_id: Uuid,
        queue: mpsc::Sender<AckFrame>,
    },
    Unregister {
        device_id: String,
        conn_id: Uuid,
    },
    Track {
        device_id: String,
        conn_id: Uuid,
        txid: Bytes,
        type_tag: TypeTag,
    },
    Confirm(AckEvent),
}

/// Cheap handle used by connection handlers to talk to the coordinator.
#[derive(Clone)]
pub struct AckCoordinatorHandle {
    cmd_tx: flume::Sender<Command>,
}

impl AckCoordinatorHandle {
    /// Registers a connection and returns the receive side of its outbound
    /// ack queue. Registering an identity again replaces the prior
    /// connection's table.
    pub async fn register(
        &self,
        device_id: &str,
        conn_id: Uuid,
        queue_size: usize,
    ) -> mpsc::Receiver<AckFrame> {
        let (queue, rx) = mpsc::channel(queue_size);
        let _ = self
            .cmd_tx
            .send_async(Command::Register {
                device_id: device_id.to_string(),
                conn_id,
                queue,
            })
            .await;
        rx
    }

    /// Drops the connection's table. Frames already enqueued stay in the
    /// queue for the write loop to flush; later confirmations are
    /// discarded and counted.
    pub async fn unregister(&self, device_id: &str, conn_id: Uuid) {
        let _ = self
            .cmd_tx
            .send_async(Command::Unregister {
                device_id: device_id.to_string(),
                conn_id,
            })
            .await;
    }

    /// Adds an in-flight correlation entry for a just-dispatched record.
    pub async fn track(&self, device_id: &str, conn_id: Uuid, txid: Bytes, type_tag: TypeTag) {
        let _ = self
            .cmd_tx
            .send_async(Command::Track {
                device_id: device_id.to_string(),
                conn_id,
                txid,
                type_tag,
            })
            .await;
    }
}

/// The channel producers deliver durable-acceptance signals on.
pub fn event_channel() -> (flume::Sender<AckEvent>, flume::Receiver<AckEvent>) {
    flume::bounded(1024)
}

struct ConnAcks {
    conn_id: Uuid,
    queue: mpsc::Sender<AckFrame>,
    inflight: HashMap<(Bytes, TypeTag), Instant>,
}

/// The coordinator task.
pub struct AckCoordinator {
    cmd_tx: flume::Sender<Command>,
    cmd_rx: flume::Receiver<Command>,
    events: flume::Receiver<AckEvent>,
    ack_sources: HashMap<TypeTag, String>,
    ttl: Duration,
    stats: Arc<AckStats>,
}

impl AckCoordinator {
    /// Creates the coordinator.
    ///
    /// `events` is the receive side of [`event_channel`]; `ack_sources`
    /// names the designated ack source per type tag; `ttl` bounds the life
    /// of an in-flight entry.
    pub fn new(
        events: flume::Receiver<AckEvent>,
        ack_sources: HashMap<TypeTag, String>,
        ttl: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = flume::bounded(1024);
        Self {
            cmd_tx,
            cmd_rx,
            events,
            ack_sources,
            ttl,
            stats: Arc::new(AckStats::default()),
        }
    }

    /// A handle for connection handlers.
    pub fn handle(&self) -> AckCoordinatorHandle {
        AckCoordinatorHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// The coordinator's counters.
    pub fn stats(&self) -> Arc<AckStats> {
        self.stats.clone()
    }

    /// Runs until shutdown. Consumes the coordinator; spawn once at
    /// startup.
    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            cmd_tx,
            cmd_rx,
            events,
            ack_sources,
            ttl,
            stats,
        } = self;

        // Confirmations join the same inbox as tracking commands so the
        // inbox order proves a Track is applied before its Confirm.
        let forward_tx = cmd_tx;
        let forward = tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                if forward_tx.send_async(Command::Confirm(event)).await.is_err() {
                    break;
                }
            }
        });

        let mut state: HashMap<String, ConnAcks> = HashMap::new();
        let mut sweep = tokio::time::interval((ttl / 4).max(Duration::from_millis(25)));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => expire(&mut state, ttl, &stats),
                cmd = cmd_rx.recv_async() => match cmd {
                    Ok(cmd) => apply(&mut state, &ack_sources, cmd, &stats),
                    Err(_) => break,
                },
            }
        }

        forward.abort();
        tracing::info!("ack coordinator stopped");
    }
}

fn apply(
    state: &mut HashMap<String, ConnAcks>,
    ack_sources: &HashMap<TypeTag, String>,
    cmd: Command,
    stats: &AckStats,
) {
    match cmd {
        Command::Register {
            device_id,
            conn_id,
            queue,
        } => {
            let replaced = state.insert(
                device_id,
                ConnAcks {
                    conn_id,
                    queue,
                    inflight: HashMap::new(),
                },
            );
            if let Some(old) = replaced {
                drop_inflight(old.inflight.len(), stats);
            }
        }

        Command::Unregister { device_id, conn_id } => {
            if state.get(&device_id).map(|c| c.conn_id) == Some(conn_id) {
                if let Some(old) = state.remove(&device_id) {
                    drop_inflight(old.inflight.len(), stats);
                }
            }
        }

        Command::Track {
            device_id,
            conn_id,
            txid,
            type_tag,
        } => {
            match state.get_mut(&device_id) {
                Some(conn) if conn.conn_id == conn_id => {
                    let _ = conn.inflight.insert((txid, type_tag), Instant::now());
                }
                // The connection was replaced or closed between dispatch
                // and tracking; its ack can never be delivered.
                _ => drop_inflight(1, stats),
            }
        }

        Command::Confirm(event) => {
            if ack_sources.get(&event.type_tag) != Some(&event.source) {
                return;
            }
            let Some(conn) = state.get_mut(&event.device_id) else {
                let _ = stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ack_dropped_total", "reason" => "connection_closed")
                    .increment(1);
                return;
            };
            if conn
                .inflight
                .remove(&(event.txid.clone(), event.type_tag))
                .is_none()
            {
                let _ = stats.orphaned.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ack_orphan_total").increment(1);
                return;
            }
            let frame = AckFrame {
                txid: event.txid,
                type_tag: event.type_tag,
            };
            match conn.queue.try_send(frame) {
                Ok(()) => {
                    let _ = stats.enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    let _ = stats.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("ack_dropped_total", "reason" => "queue_full").increment(1);
                }
            }
        }
    }
}

fn expire(state: &mut HashMap<String, ConnAcks>, ttl: Duration, stats: &AckStats) {
    for conn in state.values_mut() {
        let before = conn.inflight.len();
        conn.inflight.retain(|_, tracked_at| tracked_at.elapsed() <= ttl);
        let aged_out = before - conn.inflight.len();
        if aged_out > 0 {
            let _ = stats.expired.fetch_add(aged_out as u64, Ordering::Relaxed);
            metrics::counter!("ack_expired_total").increment(aged_out as u64);
        }
    }
}

fn drop_inflight(count: usize, stats: &AckStats) {
    if count > 0 {
        let _ = stats.dropped.fetch_add(count as u64, Ordering::Relaxed);
        metrics::counter!("ack_dropped_total", "reason" => "connection_closed")
            .increment(count as u64);
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, time::Duration};

    use bytes::Bytes;
    use producer::AckEvent;
    use record::TypeTag;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::ack::{event_channel, AckCoordinator};

    fn confirm(device_id: &str, txid: &'static [u8], tag: TypeTag, source: &str) -> AckEvent {
        AckEvent {
            device_id: device_id.to_string(),
            txid: Bytes::from_static(txid),
            type_tag: tag,
            source: source.to_string(),
        }
    }

    fn coordinator(ttl: Duration) -> (AckCoordinator, flume::Sender<AckEvent>) {
        let (event_tx, event_rx) = event_channel();
        let ack_sources = HashMap::from([(TypeTag::V, "kafka".to_string())]);
        (AckCoordinator::new(event_rx, ack_sources, ttl), event_tx)
    }

    #[tokio::test]
    async fn tracked_then_confirmed_enqueues_one_frame() {
        let (coordinator, event_tx) = coordinator(Duration::from_secs(30));
        let handle = coordinator.handle();
        let stats = coordinator.stats();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(shutdown.clone()));

        let conn_id = Uuid::new_v4();
        let mut queue = handle.register("X", conn_id, 8).await;
        handle
            .track("X", conn_id, Bytes::from_static(&[0x01]), TypeTag::V)
            .await;

        // Only the designated source may trigger the ack.
        event_tx
            .send_async(confirm("X", &[0x01], TypeTag::V, "nats"))
            .await
            .unwrap();
        event_tx
            .send_async(confirm("X", &[0x01], TypeTag::V, "kafka"))
            .await
            .unwrap();

        let frame = queue.recv().await.unwrap();
        assert_eq!(frame.txid.as_ref(), &[0x01]);
        assert_eq!(frame.type_tag, TypeTag::V);
        assert_eq!(stats.enqueued(), 1);
        assert_eq!(stats.orphaned(), 0);

        // A second confirmation for the same txid is an orphan: the entry
        // was consumed by the first one.
        event_tx
            .send_async(confirm("X", &[0x01], TypeTag::V, "kafka"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.orphaned(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn confirmation_for_closed_connection_is_discarded() {
        let (coordinator, event_tx) = coordinator(Duration::from_secs(30));
        let handle = coordinator.handle();
        let stats = coordinator.stats();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(shutdown.clone()));

        let conn_id = Uuid::new_v4();
        let mut queue = handle.register("X", conn_id, 8).await;
        handle
            .track("X", conn_id, Bytes::from_static(&[0x02]), TypeTag::V)
            .await;
        handle.unregister("X", conn_id).await;

        event_tx
            .send_async(confirm("X", &[0x02], TypeTag::V, "kafka"))
            .await
            .unwrap();

        // Queue sender dropped on unregister; no frame ever arrives.
        assert!(queue.recv().await.is_none());
        assert!(stats.dropped() >= 1);
        assert_eq!(stats.enqueued(), 0);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn replacement_discards_the_prior_table() {
        let (coordinator, event_tx) = coordinator(Duration::from_secs(30));
        let handle = coordinator.handle();
        let stats = coordinator.stats();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(shutdown.clone()));

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let mut first_queue = handle.register("X", first, 8).await;
        handle
            .track("X", first, Bytes::from_static(&[0x03]), TypeTag::V)
            .await;
        let mut second_queue = handle.register("X", second, 8).await;

        event_tx
            .send_async(confirm("X", &[0x03], TypeTag::V, "kafka"))
            .await
            .unwrap();

        // The first connection's queue was dropped with its table; the
        // confirmation finds no entry under the new connection.
        assert!(first_queue.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.orphaned(), 1);
        assert!(second_queue.try_recv().is_err());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn inflight_entries_expire_after_the_ttl() {
        let ttl = Duration::from_secs(30);
        let (coordinator, event_tx) = coordinator(ttl);
        let handle = coordinator.handle();
        let stats = coordinator.stats();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(coordinator.run(shutdown.clone()));

        let conn_id = Uuid::new_v4();
        let mut queue = handle.register("X", conn_id, 8).await;
        handle
            .track("X", conn_id, Bytes::from_static(&[0x04]), TypeTag::V)
            .await;

        // Past the TTL plus a full sweep period, the entry must be gone.
        tokio::time::sleep(ttl + ttl / 2).await;
        assert_eq!(stats.expired(), 1);

        // A late confirmation is an orphan, not an ack.
        event_tx
            .send_async(confirm("X", &[0x04], TypeTag::V, "kafka"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.orphaned(), 1);
        assert!(queue.try_recv().is_err());

        shutdown.cancel();
        task.await.unwrap();
    }
}

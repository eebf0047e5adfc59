//! Per-connection handler.
//!
//! Each accepted vehicle connection runs one handler task with two
//! cooperating halves: the read loop pulls framed envelopes, validates
//! them, and hands records to the router; the write loop drains the
//! outbound ack queue and is the connection's single writer. Shutdown is
//! cooperative: cancelling the connection token stops the read loop after
//! the current record, pending acks get a bounded drain window, then the
//! transport is torn down.

use std::{sync::Arc, time::SystemTime};

use bytes::Bytes;
use envelope::{
    payload::{ConnectivityStatus, VehicleConnectivity},
    Envelope,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use identity::Identity;
use record::{Record, TypeTag};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::Shared;

/// Why a connection left its read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    RemoteClosed,
    ReadError,
    EnvelopeParse,
    IdentityMismatch,
    Idle,
    Shutdown,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::RemoteClosed => "remote_closed",
            CloseReason::ReadError => "read_error",
            CloseReason::EnvelopeParse => "envelope_parse",
            CloseReason::IdentityMismatch => "identity_mismatch",
            CloseReason::Idle => "idle",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

type WireSink = SplitSink<Framed<TlsStream<TcpStream>, LengthDelimitedCodec>, Bytes>;

/// Runs the connection until it closes, then drains and cleans up.
pub(crate) async fn run_connection(
    shared: Arc<Shared>,
    stream: TlsStream<TcpStream>,
    identity: Identity,
    conn_id: Uuid,
    cancel: CancellationToken,
) {
    let device_id = identity.device_id().to_string();
    let framed = Framed::new(stream, envelope::frame_codec(shared.config.max_frame_bytes));
    let (sink, mut wire) = framed.split();

    let ack_rx = shared
        .acks
        .register(&device_id, conn_id, shared.config.ack.queue_size)
        .await;
    let sender_id = Bytes::copy_from_slice(identity.sender_id().as_bytes());
    let mut write_task = tokio::spawn(write_loop(sink, ack_rx, sender_id));

    let idle_timeout = shared.config.connection.idle_timeout;
    let close_reason = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break CloseReason::Shutdown,
            next = tokio::time::timeout(idle_timeout, wire.next()) => next,
        };

        let frame = match next {
            Err(_) => break CloseReason::Idle,
            Ok(None) => break CloseReason::RemoteClosed,
            Ok(Some(Err(error))) => {
                tracing::warn!(device_id = %device_id, %error, "frame read failed");
                break CloseReason::ReadError;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let envelope = match Envelope::from_bytes(&frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                // Firmware bug or adversarial peer; the channel is no
                // longer trustworthy.
                tracing::warn!(device_id = %device_id, %error, "malformed envelope");
                metrics::counter!("envelope_parse_errors_total").increment(1);
                break CloseReason::EnvelopeParse;
            }
        };

        if !identity.matches_sender_id(&envelope.sender_id) {
            metrics::counter!("identity_mismatch_total").increment(1);
            tracing::warn!(
                device_id = %device_id,
                envelope_sender = %String::from_utf8_lossy(&envelope.sender_id),
                "envelope identity does not match transport identity"
            );
            break CloseReason::IdentityMismatch;
        }

        let Some(type_tag) = TypeTag::from_topic(&envelope.message_topic) else {
            metrics::counter!("router_unknown_tag_total").increment(1);
            continue;
        };

        if !shared.limiter.try_admit(&device_id) {
            metrics::counter!("rate_limited_total").increment(1);
            continue;
        }

        let record = Record::from_envelope(envelope, identity.clone(), type_tag);
        metrics::counter!("records_received_total", "record_type" => type_tag.as_str())
            .increment(1);

        // The correlation entry must exist before any backend can confirm.
        if shared.router.is_ack_eligible(&record) {
            shared
                .acks
                .track(&device_id, conn_id, record.txid.clone(), type_tag)
                .await;
        }
        shared.router.dispatch(&record).await;
    };

    // Draining: the slot is released, new reads stop, pending acks get a
    // bounded window to reach the wire.
    let _removed = shared.registry.unregister(&device_id, conn_id);
    shared.acks.unregister(&device_id, conn_id).await;
    let drained =
        tokio::time::timeout(shared.config.connection.drain_timeout, &mut write_task).await;
    if drained.is_err() {
        write_task.abort();
        metrics::counter!("drain_deadline_exceeded_total").increment(1);
    }

    metrics::counter!("connections_closed_total", "reason" => close_reason.as_str()).increment(1);
    tracing::info!(
        device_id = %device_id,
        %conn_id,
        reason = close_reason.as_str(),
        "vehicle disconnected"
    );

    synthesize_connectivity(&shared, &identity, conn_id, ConnectivityStatus::Disconnected).await;
}

/// The connection's single writer: every outbound frame goes through here.
async fn write_loop(
    mut sink: WireSink,
    mut ack_rx: tokio::sync::mpsc::Receiver<crate::ack::AckFrame>,
    sender_id: Bytes,
) {
    while let Some(frame) = ack_rx.recv().await {
        let envelope = Envelope::ack(frame.txid, sender_id.clone(), frame.type_tag.as_str());
        if let Err(error) = sink.send(envelope.to_bytes()).await {
            tracing::warn!(%error, "ack write failed");
            break;
        }
        metrics::counter!("ack_sent_total", "record_type" => frame.type_tag.as_str())
            .increment(1);
    }
}

/// Routes a connection lifecycle event through the same path as
/// vehicle-sourced records. Synthetic records never engage the ack path.
pub(crate) async fn synthesize_connectivity(
    shared: &Shared,
    identity: &Identity,
    conn_id: Uuid,
    status: ConnectivityStatus,
) {
    let created_at = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    let event = VehicleConnectivity {
        vin: identity.device_id().to_string(),
        connection_id: conn_id.to_string(),
        status: status as i32,
        created_at,
        network_interface: "tls_tcp".to_string(),
    };
    let record = Record::synthetic(identity.clone(), TypeTag::Connectivity, event.to_bytes());
    shared.router.dispatch(&record).await;
}

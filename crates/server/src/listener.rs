//! Accept loop and handshake.
//!
//! Accepts TCP connections, performs the mutually-authenticated TLS
//! handshake under a deadline, extracts the vehicle identity from the peer
//! certificate, and registers the connection. Handshake failures close the
//! socket with no diagnostic to the peer. An identity that is already
//! connected displaces its prior connection (last-writer-wins).

use std::{net::SocketAddr, sync::Arc, time::Instant};

use envelope::payload::ConnectivityStatus;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

use crate::{
    connection::{run_connection, synthesize_connectivity},
    registry::LiveConn,
    tls, Shared,
};

/// Accepts connections until shutdown. Each accepted socket gets its own
/// task on the tracker; the caller waits on the tracker to drain them.
pub(crate) async fn run_listener(
    shared: Arc<Shared>,
    acceptor: TlsAcceptor,
    listener: TcpListener,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, remote_addr)) => {
                    let shared = shared.clone();
                    let acceptor = acceptor.clone();
                    let shutdown = shutdown.clone();
                    let _handle = tracker.spawn(async move {
                        handle_accept(shared, acceptor, tcp, remote_addr, shutdown).await;
                    });
                }
                Err(error) => {
                    // Transient accept errors (fd pressure); keep serving.
                    tracing::warn!(%error, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            },
        }
    }
    tracing::info!("listener stopped");
}

async fn handle_accept(
    shared: Arc<Shared>,
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    remote_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    let handshake = acceptor.accept(tcp);
    let stream = match tokio::time::timeout(shared.config.connection.handshake_timeout, handshake)
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            metrics::counter!("handshake_rejected_total", "reason" => "tls").increment(1);
            tracing::debug!(%remote_addr, %error, "TLS handshake rejected");
            return;
        }
        Err(_) => {
            metrics::counter!("handshake_rejected_total", "reason" => "timeout").increment(1);
            tracing::debug!(%remote_addr, "TLS handshake timed out");
            return;
        }
    };

    let identity = match tls::peer_identity(&stream, shared.config.identity_source()) {
        Ok(identity) => identity,
        Err(error) => {
            metrics::counter!("handshake_rejected_total", "reason" => "identity").increment(1);
            tracing::warn!(%remote_addr, %error, "no usable identity in peer certificate");
            return;
        }
    };

    let conn_id = Uuid::new_v4();
    let cancel = shutdown.child_token();
    let displaced = shared.registry.register(LiveConn {
        conn_id,
        device_id: identity.device_id().to_string(),
        remote_addr,
        cancel: cancel.clone(),
        opened_at: Instant::now(),
    });
    if let Some(old) = displaced {
        metrics::counter!("connection_replaced_total").increment(1);
        tracing::info!(
            device_id = %identity.device_id(),
            old_conn_id = %old.conn_id,
            new_conn_id = %conn_id,
            "connection replaced, draining the old one"
        );
        old.cancel.cancel();
    }

    tracing::info!(
        device_id = %identity.device_id(),
        %conn_id,
        %remote_addr,
        "vehicle connected"
    );
    synthesize_connectivity(&shared, &identity, conn_id, ConnectivityStatus::Connected).await;

    run_connection(shared, stream, identity, conn_id, cancel).await;
}

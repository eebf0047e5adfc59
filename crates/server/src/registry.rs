//! Process-wide live-connection table.
//!
//! Keyed by device id; at most one live connection per identity. A new
//! registration for an occupied slot displaces the prior connection
//! atomically, so the caller can push it into draining (last-writer-wins).

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Mutex,
    time::Instant,
};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything the rest of the process may know about a live connection.
#[derive(Clone)]
pub struct LiveConn {
    /// Server-assigned connection id.
    pub conn_id: Uuid,
    /// Device id of the connected vehicle.
    pub device_id: String,
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// Cancelling this token pushes the connection into draining.
    pub cancel: CancellationToken,
    /// Accept time.
    pub opened_at: Instant,
}

/// The live-connection table.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<HashMap<String, LiveConn>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, returning the connection it displaced, if
    /// any. Insertion and displacement are one atomic step.
    pub fn register(&self, conn: LiveConn) -> Option<LiveConn> {
        let displaced = self
            .inner
            .lock()
            .expect("registry lock poisoned")
            .insert(conn.device_id.clone(), conn);
        metrics::gauge!("connections_active").set(self.len() as f64);
        displaced
    }

    /// Removes the connection, but only while it still owns its slot. A
    /// displaced connection unregistering late must not evict its
    /// replacement.
    pub fn unregister(&self, device_id: &str, conn_id: Uuid) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let removed = match inner.get(device_id) {
            Some(live) if live.conn_id == conn_id => inner.remove(device_id).is_some(),
            _ => false,
        };
        drop(inner);
        metrics::gauge!("connections_active").set(self.len() as f64);
        removed
    }

    /// Looks up the live connection for a device id.
    pub fn lookup(&self, device_id: &str) -> Option<LiveConn> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .get(device_id)
            .cloned()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Fan-out of outbound events to many subscriber connections
//!
//! # Design
//!
//! The broadcaster never owns a subscriber. It keeps a weak reference to
//! each registered [`OutboundConnection`]; the request handler that created
//! the connection owns it. A broadcast takes a snapshot of the live members
//! under the membership lock and writes outside of it, so registrations
//! racing with a broadcast are neither lost nor able to corrupt iteration.
//!
//! Members whose write fails are pruned, and the others are unaffected.
//! A member that stops draining its stream fails once the connection's write
//! timeout elapses, so it delays a broadcast by at most that long.
//! Broadcasts are serialized so every subscriber sees events in call order.

use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::connection::OutboundConnection;
use crate::error::SseError;
use crate::types::OutboundEvent;

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Subscribers the event was written to
    pub delivered: usize,
    /// Subscribers removed because their connection failed or was closed
    pub pruned: usize,
}

/// Registry of subscriber connections
#[derive(Default)]
pub struct Broadcaster {
    members: Mutex<Vec<Weak<OutboundConnection>>>,
    broadcast_lock: tokio::sync::Mutex<()>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; registering the same connection twice is a no-op
    pub fn register(&self, connection: &Arc<OutboundConnection>) {
        let weak = Arc::downgrade(connection);
        let mut members = self.members.lock();
        if members.iter().any(|m| Weak::ptr_eq(m, &weak)) {
            return;
        }
        members.push(weak);
        debug!(connection = connection.id(), members = members.len(), "Registered subscriber");
    }

    /// Remove a connection without closing it
    pub fn unregister(&self, connection: &Arc<OutboundConnection>) -> bool {
        let weak = Arc::downgrade(connection);
        let mut members = self.members.lock();
        let before = members.len();
        members.retain(|m| !Weak::ptr_eq(m, &weak));
        before != members.len()
    }

    /// Number of registered connections still owned by someone
    pub fn len(&self) -> usize {
        self.members.lock().iter().filter(|m| m.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write `event` to every live subscriber
    pub async fn broadcast(&self, event: &OutboundEvent) -> BroadcastReport {
        let _ordering = self.broadcast_lock.lock().await;
        let snapshot = self.snapshot();

        let results = join_all(snapshot.iter().map(|connection| connection.write(event))).await;

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (connection, result) in snapshot.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(SseError::TransportFailure(reason)) => {
                    debug!(connection = connection.id(), %reason, "Pruning failed subscriber");
                    failed.push(Arc::downgrade(connection));
                }
                Err(SseError::ClosedConnection) => {
                    debug!(connection = connection.id(), "Pruning closed subscriber");
                    failed.push(Arc::downgrade(connection));
                }
                Err(err) => {
                    // Encoding errors hit every subscriber alike; nobody is pruned
                    warn!(connection = connection.id(), error = %err, "Broadcast write failed");
                }
            }
        }

        if !failed.is_empty() {
            let mut members = self.members.lock();
            members.retain(|m| !failed.iter().any(|f| Weak::ptr_eq(m, f)));
            report.pruned = failed.len();
        }
        report
    }

    /// Close every member and clear the set
    ///
    /// Does not wait for a broadcast in progress; its pending writes fail.
    pub async fn close_all(&self) {
        let members: Vec<_> = std::mem::take(&mut *self.members.lock());
        let live: Vec<_> = members.iter().filter_map(Weak::upgrade).collect();

        join_all(live.iter().map(|connection| connection.close())).await;
        info!(closed = live.len(), "Closed all subscribers");
    }

    /// Live members; dead weak references are dropped on the way
    fn snapshot(&self) -> Vec<Arc<OutboundConnection>> {
        let mut members = self.members.lock();
        let mut live = Vec::with_capacity(members.len());
        members.retain(|m| match m.upgrade() {
            Some(connection) => {
                live.push(connection);
                true
            }
            None => false,
        });
        live
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster").field("members", &self.len()).finish()
    }
}

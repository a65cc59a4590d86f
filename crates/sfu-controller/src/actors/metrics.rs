//! Mailbox monitoring and actor counters.
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Registry   | < 100  | 100-500 | > 500    |
//! | Room       | < 100  | 100-500 | > 500    |
//! | Connection | < 32   | 32-128  | > 128    |
//!
//! Counters here are in-process views; each change is mirrored to the
//! Prometheus gauges in [`crate::observability::metrics`].

use crate::observability::metrics;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for the registry and room actors.
pub const ROOM_MAILBOX_NORMAL: usize = 100;
pub const ROOM_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for connection actors.
pub const CONNECTION_MAILBOX_NORMAL: usize = 32;
pub const CONNECTION_MAILBOX_WARNING: usize = 128;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RoomRegistryActor` (singleton).
    Registry,
    /// `RoomActor` (one per room).
    Room,
    /// `ConnectionActor` (one per signaling connection).
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Room => ROOM_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth of one actor's mailbox.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Room id, peer id, or `"registry"`.
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record a message entering the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);

        match self.level_for_depth(new_depth) {
            MailboxLevel::Critical => {
                warn!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if new_depth == self.actor_type.normal_threshold() + 1 => {
                debug!(
                    target: "sfu.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }

        if self.actor_type == ActorType::Registry {
            metrics::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);
        }
    }

    /// Record a message leaving the mailbox.
    pub fn record_dequeue(&self) {
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        self.messages_processed.fetch_add(1, Ordering::Relaxed);

        if self.actor_type == ActorType::Registry {
            metrics::set_actor_mailbox_depth(
                self.actor_type.as_str(),
                previous.saturating_sub(1),
            );
        }
    }

    /// Record a message that could not be queued.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_message_dropped(self.actor_type.as_str());
        warn!(
            target: "sfu.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Process-wide actor counters, shared by every actor.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    active_rooms: AtomicUsize,
    active_peers: AtomicUsize,
    active_connections: AtomicUsize,
    actor_panics: AtomicU64,
    total_messages_processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let rooms = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_rooms_active(rooms);
    }

    pub fn room_removed(&self) {
        let rooms = decrement(&self.active_rooms);
        metrics::set_rooms_active(rooms);
    }

    pub fn peer_joined(&self) {
        let peers = self.active_peers.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_peers_active(peers);
    }

    pub fn peer_left(&self) {
        let peers = decrement(&self.active_peers);
        metrics::set_peers_active(peers);
    }

    pub fn connection_created(&self) {
        let connections = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_connections_active(connections);
    }

    pub fn connection_closed(&self) {
        let connections = decrement(&self.active_connections);
        metrics::set_connections_active(connections);
    }

    /// Record an actor task that panicked.
    pub fn record_panic(&self, actor_type: ActorType) {
        let total_panics = self.actor_panics.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_actor_panic(actor_type.as_str());
        tracing::error!(
            target: "sfu.actor.panic",
            actor_type = actor_type.as_str(),
            total_panics,
            "Actor panic detected - indicates bug, investigation required"
        );
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.active_peers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.total_messages_processed.load(Ordering::Relaxed)
    }
}

/// Saturating decrement, returns the new value.
fn decrement(counter: &AtomicUsize) -> usize {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)))
        .unwrap_or(0)
        .saturating_sub(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_labels_and_thresholds() {
        assert_eq!(ActorType::Registry.as_str(), "registry");
        assert_eq!(ActorType::Room.as_str(), "room");
        assert_eq!(ActorType::Connection.as_str(), "connection");

        assert_eq!(ActorType::Room.normal_threshold(), 100);
        assert_eq!(ActorType::Room.warning_threshold(), 500);
        assert_eq!(ActorType::Connection.normal_threshold(), 32);
        assert_eq!(ActorType::Connection.warning_threshold(), 128);
    }

    #[test]
    fn test_mailbox_monitor_tracks_peak() {
        let monitor = MailboxMonitor::new(ActorType::Room, "R1");

        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_enqueue();
        assert_eq!(monitor.current_depth(), 3);
        assert_eq!(monitor.peak_depth(), 3);

        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 2);
        assert_eq!(monitor.peak_depth(), 3);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_mailbox_monitor_dequeue_never_underflows() {
        let monitor = MailboxMonitor::new(ActorType::Registry, "registry");
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
    }

    #[test]
    fn test_connection_mailbox_levels() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "peer-a");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        for _ in 0..40 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        for _ in 0..100 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_mailbox_monitor_drop() {
        let monitor = MailboxMonitor::new(ActorType::Connection, "peer-a");
        monitor.record_drop();
        monitor.record_drop();
        assert_eq!(monitor.messages_dropped(), 2);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();

        metrics.room_created();
        metrics.peer_joined();
        metrics.peer_joined();
        metrics.connection_created();
        assert_eq!(metrics.room_count(), 1);
        assert_eq!(metrics.peer_count(), 2);
        assert_eq!(metrics.connection_count(), 1);

        metrics.peer_left();
        metrics.peer_left();
        metrics.peer_left();
        metrics.room_removed();
        metrics.connection_closed();
        assert_eq!(metrics.peer_count(), 0);
        assert_eq!(metrics.room_count(), 0);
        assert_eq!(metrics.connection_count(), 0);
    }

    #[test]
    fn test_actor_metrics_panics() {
        let metrics = ActorMetrics::new();
        metrics.record_panic(ActorType::Room);
        metrics.record_panic(ActorType::Connection);
        assert_eq!(metrics.panic_count(), 2);
    }
}

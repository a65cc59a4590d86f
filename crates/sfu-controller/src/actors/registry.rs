//! `RoomRegistryActor` - singleton supervisor of all room actors.
//!
//! The registry:
//! - Maps room ids to running `RoomActor`s
//! - Allocates one router per room, exactly once per room id
//! - Removes rooms that report themselves empty
//! - Cancels every room on shutdown
//!
//! # First-Join Guard
//!
//! Router allocation runs in a spawned task so the registry keeps serving
//! other rooms meanwhile. Callers asking for a room whose router is still
//! being allocated are queued on the pending entry and all receive the same
//! room handle once allocation completes. Concurrent first joins therefore
//! create a single router.
//!
//! # Epochs
//!
//! Every room instance gets a new epoch. A room's removal request carries its
//! epoch, so a stale request never removes a newer room with the same id.

use crate::config::Config;
use crate::errors::SfuError;
use crate::media::{RouterAllocator, RouterHandle};

use super::connection::ConnectionActorHandle;
use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomSettings};

use common::types::{PeerId, RoomId};
use signaling_protocol::message::JoinResponse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 500;

/// A join that races a room teardown is retried against a fresh lookup.
const MAX_JOIN_ATTEMPTS: usize = 3;

/// How long to wait for a removed room's task to finish.
const ROOM_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry limits.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Maximum concurrent rooms (0 = unlimited).
    pub max_rooms: usize,
    pub room: RoomSettings,
}

impl RegistrySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_rooms: config.max_rooms,
            room: RoomSettings {
                max_peers: config.max_peers_per_room,
                negotiation_timeout: config.negotiation_timeout(),
            },
        }
    }
}

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor and return its handle.
    #[must_use]
    pub fn new(
        allocator: RouterAllocator,
        settings: RegistrySettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = RoomRegistryActor {
            allocator,
            settings,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            pending: HashMap::new(),
            next_epoch: 1,
            routers_allocated: 0,
            accepting_new: true,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Return the room, creating it and its router if it does not exist.
    pub async fn get_or_create_room(&self, room_id: RoomId) -> Result<RoomActorHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Join a peer to a room, creating the room on first join.
    ///
    /// Retries when the room closed between lookup and join.
    pub async fn join_room(
        &self,
        room_id: RoomId,
        peer_id: PeerId,
        display_name: String,
        connection: ConnectionActorHandle,
    ) -> Result<(RoomActorHandle, JoinResponse), SfuError> {
        let mut last_error = SfuError::RoomClosed(room_id.to_string());

        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            let room = self.get_or_create_room(room_id.clone()).await?;
            match room
                .join(peer_id.clone(), display_name.clone(), connection.clone())
                .await
            {
                Ok(response) => return Ok((room, response)),
                Err(SfuError::RoomClosed(reason)) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        peer_id = %peer_id,
                        attempt,
                        "Room closed during join, retrying"
                    );
                    last_error = SfuError::RoomClosed(reason);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    /// Ask the registry to drop a room. Returns `true` if the entry for
    /// `epoch` was removed.
    pub async fn room_closed(&self, room_id: RoomId, epoch: u64) -> Result<bool, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::RoomClosed {
                room_id,
                epoch,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_room(&self, room_id: RoomId) -> Result<Option<RoomActorHandle>, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting rooms and shut every room down, waiting up to
    /// `deadline` for each.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token for work that must stop with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Managed room with its task handle.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    created_at: Instant,
}

/// The `RoomRegistryActor` implementation.
struct RoomRegistryActor {
    allocator: RouterAllocator,
    settings: RegistrySettings,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Used to hand rooms a registry handle and to report allocations.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<RoomId, ManagedRoom>,
    /// Rooms whose router is being allocated, with the callers waiting on them.
    pending: HashMap<RoomId, Vec<oneshot::Sender<Result<RoomActorHandle, SfuError>>>>,
    next_epoch: u64,
    routers_allocated: u64,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "sfu.actor.registry")]
    async fn run(mut self) {
        info!(target: "sfu.actor.registry", "RoomRegistryActor started");

        let mut health_check = tokio::time::interval(Duration::from_secs(5));

        loop {
            self.check_room_health();

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.accepting_new = false;
                    self.graceful_shutdown(Duration::from_secs(30)).await;
                    break;
                }

                _ = health_check.tick() => {}

                msg = self.receiver.recv() => {
                    match msg {
                        Some(RegistryMessage::Shutdown { deadline, respond_to }) => {
                            self.accepting_new = false;
                            self.graceful_shutdown(deadline).await;
                            let _ = respond_to.send(Ok(()));
                            self.cancel_token.cancel();
                            break;
                        }
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.registry",
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            routers_allocated = self.routers_allocated,
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => self.get_or_create_room(room_id, respond_to),

            RegistryMessage::RoomCreated { room_id, result } => {
                self.room_created(room_id, result).await;
            }

            RegistryMessage::RoomClosed {
                room_id,
                epoch,
                respond_to,
            } => {
                let _ = respond_to.send(self.remove_room(&room_id, epoch));
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let room = self.rooms.get(&room_id).map(|r| r.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    room_count: self.rooms.len(),
                    pending_creations: self.pending.len(),
                    routers_allocated: self.routers_allocated,
                    is_draining: !self.accepting_new,
                    mailbox_depth: self.mailbox.current_depth(),
                });
            }

            RegistryMessage::Shutdown { respond_to, .. } => {
                // Handled in the run loop.
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    fn get_or_create_room(
        &mut self,
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    ) {
        if let Some(room) = self.rooms.get(&room_id) {
            let _ = respond_to.send(Ok(room.handle.clone()));
            return;
        }

        if !self.accepting_new {
            let _ = respond_to.send(Err(SfuError::Draining));
            return;
        }

        if let Some(waiters) = self.pending.get_mut(&room_id) {
            waiters.push(respond_to);
            return;
        }

        let max_rooms = self.settings.max_rooms;
        if max_rooms > 0 && self.rooms.len() + self.pending.len() >= max_rooms {
            warn!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                max_rooms,
                "Room limit reached"
            );
            let _ = respond_to.send(Err(SfuError::TooManyRooms));
            return;
        }

        let Some(sender) = self.self_sender.upgrade() else {
            let _ = respond_to.send(Err(SfuError::Draining));
            return;
        };

        self.pending.insert(room_id.clone(), vec![respond_to]);

        debug!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            "Allocating router for new room"
        );

        let allocator = self.allocator.clone();
        tokio::spawn(async move {
            let result = allocator.create_router().await;
            if let Err(mpsc::error::SendError(RegistryMessage::RoomCreated {
                result: Ok(router),
                ..
            })) = sender
                .send(RegistryMessage::RoomCreated { room_id, result })
                .await
            {
                router.close().await;
            }
        });
    }

    async fn room_created(&mut self, room_id: RoomId, result: Result<RouterHandle, SfuError>) {
        let waiters = self.pending.remove(&room_id).unwrap_or_default();

        let router = match result {
            Ok(router) => router,
            Err(e) => {
                error!(
                    target: "sfu.actor.registry",
                    room_id = %room_id,
                    error = %e,
                    "Router allocation failed"
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                return;
            }
        };
        self.routers_allocated += 1;

        let registry = self.self_sender.upgrade().map(|sender| RoomRegistryHandle {
            sender,
            cancel_token: self.cancel_token.clone(),
        });
        let Some(registry) = registry.filter(|_| self.accepting_new) else {
            router.close().await;
            for waiter in waiters {
                let _ = waiter.send(Err(SfuError::Draining));
            }
            return;
        };

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            epoch,
            router,
            registry,
            self.settings.room,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: Instant::now(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            epoch,
            waiters = waiters.len(),
            total_rooms = self.rooms.len(),
            "Room created"
        );

        for waiter in waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }
    }

    fn remove_room(&mut self, room_id: &RoomId, epoch: u64) -> bool {
        if self.rooms.get(room_id).map(|r| r.handle.epoch()) != Some(epoch) {
            debug!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                epoch,
                "Ignoring close for stale room"
            );
            return false;
        }

        let Some(managed) = self.rooms.remove(room_id) else {
            return false;
        };
        self.metrics.room_removed();

        info!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            epoch,
            lifetime_secs = managed.created_at.elapsed().as_secs(),
            remaining_rooms = self.rooms.len(),
            "Room removed"
        );

        let room_id = room_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_EXIT_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room task ended with error"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room task did not exit in time"
                    );
                }
            }
        });

        true
    }

    /// Reap room tasks that exited without deregistering.
    fn check_room_health(&mut self) {
        let finished: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            self.metrics.room_removed();

            let metrics = Arc::clone(&self.metrics);
            tokio::spawn(async move {
                match managed.task_handle.await {
                    Err(e) if e.is_panic() => {
                        error!(
                            target: "sfu.actor.registry",
                            room_id = %room_id,
                            "Room actor panicked"
                        );
                        metrics.record_panic(ActorType::Room);
                    }
                    _ => {
                        warn!(
                            target: "sfu.actor.registry",
                            room_id = %room_id,
                            "Room actor exited without deregistering"
                        );
                    }
                }
            });
        }
    }

    async fn graceful_shutdown(&mut self, deadline: Duration) {
        info!(
            target: "sfu.actor.registry",
            rooms = self.rooms.len(),
            pending = self.pending.len(),
            "Shutting down all rooms"
        );

        for (_, waiters) in self.pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SfuError::Draining));
            }
        }

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room shut down"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room task failed during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        room_id = %room_id,
                        "Room shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(target: "sfu.actor.registry", "All rooms shut down");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::connection::{ConnectionActor, OutboundFrame};
    use crate::actors::messages::LeaveReason;
    use crate::config::default_media_codecs;
    use crate::media::{WorkerPool, WorkerSettings};

    fn registry(max_rooms: usize, max_peers: usize) -> (RoomRegistryHandle, RouterAllocator) {
        let settings = WorkerSettings {
            listen_ip: "0.0.0.0".parse().unwrap(),
            announced_ip: "127.0.0.1".to_string(),
            min_port: 42000,
            max_port: 42099,
        };
        let pool = WorkerPool::spawn_local(2, &settings).unwrap();
        let allocator = RouterAllocator::new(Arc::new(pool), default_media_codecs());
        let settings = RegistrySettings {
            max_rooms,
            room: RoomSettings {
                max_peers,
                negotiation_timeout: Duration::ZERO,
            },
        };
        (
            RoomRegistryHandle::new(allocator.clone(), settings, ActorMetrics::new()),
            allocator,
        )
    }

    fn connection(peer: &str) -> (ConnectionActorHandle, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(64);
        let (handle, _task) = ConnectionActor::spawn(
            PeerId::parse(peer).unwrap(),
            tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        (handle, rx)
    }

    #[tokio::test]
    async fn test_concurrent_first_join_allocates_one_router() {
        let (registry, allocator) = registry(0, 0);
        let room_id = RoomId::parse("R1").unwrap();

        let lookups = (0..8).map(|_| registry.get_or_create_room(room_id.clone()));
        let rooms = futures::future::join_all(lookups).await;

        let epochs: Vec<u64> = rooms.into_iter().map(|r| r.unwrap().epoch()).collect();
        assert!(epochs.windows(2).all(|w| w.first() == w.last()));
        assert_eq!(allocator.live_routers(), 1);

        let status = registry.get_status().await.unwrap();
        assert_eq!(status.room_count, 1);
        assert_eq!(status.routers_allocated, 1);
        assert_eq!(status.pending_creations, 0);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let (registry, _) = registry(1, 0);

        registry
            .get_or_create_room(RoomId::parse("R1").unwrap())
            .await
            .unwrap();
        let err = registry
            .get_or_create_room(RoomId::parse("R2").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::TooManyRooms));
    }

    #[tokio::test]
    async fn test_stale_epoch_is_ignored() {
        let (registry, _) = registry(0, 0);
        let room_id = RoomId::parse("R1").unwrap();
        let room = registry.get_or_create_room(room_id.clone()).await.unwrap();

        assert!(!registry
            .room_closed(room_id.clone(), room.epoch() + 1)
            .await
            .unwrap());
        assert!(registry.get_room(room_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_last_leave_removes_room_and_router() {
        let (registry, allocator) = registry(0, 0);
        let room_id = RoomId::parse("R1").unwrap();
        let peer_id = PeerId::parse("alice").unwrap();
        let (conn, _rx) = connection("alice");

        let (room, response) = registry
            .join_room(room_id.clone(), peer_id.clone(), "Alice".to_string(), conn)
            .await
            .unwrap();
        assert!(response.peers.is_empty());
        assert_eq!(allocator.live_routers(), 1);

        room.close_peer(peer_id, LeaveReason::Voluntary)
            .await
            .unwrap();

        assert!(registry.get_room(room_id.clone()).await.unwrap().is_none());
        assert_eq!(allocator.live_routers(), 0);

        // A later join recreates the room under a new epoch.
        let (conn, _rx) = connection("bob");
        let (again, _) = registry
            .join_room(room_id, PeerId::parse("bob").unwrap(), "Bob".to_string(), conn)
            .await
            .unwrap();
        assert!(again.epoch() > room.epoch());
    }

    #[tokio::test]
    async fn test_room_full() {
        let (registry, _) = registry(0, 1);
        let room_id = RoomId::parse("R1").unwrap();

        let (a, _rx_a) = connection("a");
        registry
            .join_room(room_id.clone(), PeerId::parse("a").unwrap(), "A".to_string(), a)
            .await
            .unwrap();

        let (b, _rx_b) = connection("b");
        let err = registry
            .join_room(room_id, PeerId::parse("b").unwrap(), "B".to_string(), b)
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::RoomFull(_)));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_rooms() {
        let (registry, allocator) = registry(0, 0);
        registry
            .get_or_create_room(RoomId::parse("R1").unwrap())
            .await
            .unwrap();

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(registry.is_cancelled());
        assert_eq!(allocator.live_routers(), 0);

        let err = registry
            .get_or_create_room(RoomId::parse("R2").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::Internal(_)));
    }
}

//! `RoomActor` - per-room actor that owns peers and their media resources.
//!
//! Each `RoomActor`:
//! - Owns one router and the peers joined to it
//! - Creates, connects and closes transports, producers and consumers
//! - Fans out notifications to the other peers of the room
//! - Deregisters itself from the registry when its last peer leaves
//!
//! # Engine Calls
//!
//! Engine calls run in spawned tasks and report back as
//! [`RoomMessage::EngineCompleted`]. Room maps are only touched while a
//! message is being handled, never across an engine call. A completion whose
//! peer (or transport, or producer) disappeared in the meantime closes the
//! resource it just created and fails the request.
//!
//! # Negotiation Timeout
//!
//! Every [`NEGOTIATION_CHECK_INTERVAL`] the room removes peers that joined at
//! least `negotiation_timeout` ago and still have no connected transport, and
//! closes their signaling connection.

use crate::errors::SfuError;
use crate::media::negotiation::{
    can_consume, validate_dtls_parameters, validate_producer_parameters,
};
use crate::media::RouterHandle;
use crate::observability::metrics;

use super::connection::ConnectionActorHandle;
use super::messages::{EngineCompletion, LeaveReason, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::peer::{Consumer, Peer, Producer};
use super::registry::RoomRegistryHandle;

use common::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use signaling_protocol::message::{JoinResponse, ProducerInfo};
use signaling_protocol::rtp::{MediaKind, RtpCapabilities, RtpParameters};
use signaling_protocol::transport::{
    ConsumerInfo, DtlsParameters, TransportDirection, TransportInfo,
};
use signaling_protocol::Notification;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How often peers are checked against the negotiation timeout.
pub const NEGOTIATION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Per-room limits.
#[derive(Debug, Clone, Copy)]
pub struct RoomSettings {
    /// Maximum peers in one room (0 = unlimited).
    pub max_peers: usize,
    /// Zero disables the check.
    pub negotiation_timeout: Duration,
}

/// Handle to a `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
    epoch: u64,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Registry generation of this room. A room recreated under the same id
    /// gets a new epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SfuError>>) -> RoomMessage,
    ) -> Result<T, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| SfuError::RoomClosed(self.room_id.to_string()))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Add a peer to the room.
    ///
    /// Fails with [`SfuError::RoomClosed`] if the room was torn down while the
    /// request was queued; the caller should look the room up again.
    pub async fn join(
        &self,
        peer_id: PeerId,
        display_name: String,
        connection: ConnectionActorHandle,
    ) -> Result<JoinResponse, SfuError> {
        self.request(|respond_to| RoomMessage::Join {
            peer_id,
            display_name,
            connection,
            respond_to,
        })
        .await
    }

    pub async fn create_transport(
        &self,
        peer_id: PeerId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, SfuError> {
        self.request(|respond_to| RoomMessage::CreateTransport {
            peer_id,
            direction,
            respond_to,
        })
        .await
    }

    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::ConnectTransport {
            peer_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await
    }

    /// Create a producer. Other peers are notified before this returns.
    pub async fn produce(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SfuError> {
        self.request(|respond_to| RoomMessage::Produce {
            peer_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await
    }

    pub async fn close_producer(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::CloseProducer {
            peer_id,
            producer_id,
            respond_to,
        })
        .await
    }

    pub async fn consume(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, SfuError> {
        self.request(|respond_to| RoomMessage::Consume {
            peer_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await
    }

    pub async fn resume_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::ResumeConsumer {
            peer_id,
            consumer_id,
            respond_to,
        })
        .await
    }

    pub async fn close_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::CloseConsumer {
            peer_id,
            consumer_id,
            respond_to,
        })
        .await
    }

    /// Remove a peer with its full close cascade. Unknown peers are a no-op.
    pub async fn close_peer(&self, peer_id: PeerId, reason: LeaveReason) -> Result<(), SfuError> {
        self.request(|respond_to| RoomMessage::ClosePeer {
            peer_id,
            reason,
            respond_to,
        })
        .await
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| SfuError::RoomClosed(self.room_id.to_string()))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Whether the actor has stopped accepting messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    epoch: u64,
    router: RouterHandle,
    registry: RoomRegistryHandle,
    receiver: mpsc::Receiver<RoomMessage>,
    /// For engine tasks to report back without keeping the room alive.
    self_sender: mpsc::WeakSender<RoomMessage>,
    cancel_token: CancellationToken,
    settings: RoomSettings,
    peers: HashMap<PeerId, Peer>,
    next_join_seq: u64,
    /// Set once the room deregistered; the loop exits after the current message.
    closing: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor over an already allocated router.
    pub fn spawn(
        room_id: RoomId,
        epoch: u64,
        router: RouterHandle,
        registry: RoomRegistryHandle,
        settings: RoomSettings,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            epoch,
            router,
            registry,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            settings,
            peers: HashMap::new(),
            next_join_seq: 0,
            closing: false,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            epoch,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "sfu.actor.room",
        fields(room_id = %self.room_id, epoch = self.epoch, router_id = %self.router.router_id())
    )]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            epoch = self.epoch,
            router_id = %self.router.router_id(),
            worker_id = %self.router.worker_id(),
            "RoomActor started"
        );

        // First check one interval after creation, so a room whose creator
        // has not joined yet is not torn down as empty.
        let mut negotiation_check = tokio::time::interval_at(
            Instant::now() + NEGOTIATION_CHECK_INTERVAL,
            NEGOTIATION_CHECK_INTERVAL,
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = negotiation_check.tick() => {
                    self.check_negotiation_timeouts().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }

            if self.closing {
                break;
            }
        }

        self.drain_mailbox().await;

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            epoch = self.epoch,
            peers = self.peers.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                peer_id,
                display_name,
                connection,
                respond_to,
            } => {
                let result = self.handle_join(peer_id, display_name, connection);
                let _ = respond_to.send(result);
                if self.peers.is_empty() {
                    self.teardown().await;
                }
            }

            RoomMessage::CreateTransport {
                peer_id,
                direction,
                respond_to,
            } => self.handle_create_transport(peer_id, direction, respond_to),

            RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => self.handle_connect_transport(peer_id, transport_id, dtls_parameters, respond_to),

            RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => self.handle_produce(peer_id, transport_id, kind, rtp_parameters, respond_to),

            RoomMessage::CloseProducer {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_close_producer(&peer_id, producer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Consume {
                peer_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => self.handle_consume(
                peer_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            ),

            RoomMessage::ResumeConsumer {
                peer_id,
                consumer_id,
                respond_to,
            } => self.handle_resume_consumer(peer_id, consumer_id, respond_to),

            RoomMessage::CloseConsumer {
                peer_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.handle_close_consumer(&peer_id, consumer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ClosePeer {
                peer_id,
                reason,
                respond_to,
            } => {
                self.close_peer(&peer_id, reason).await;
                if self.peers.is_empty() {
                    self.teardown().await;
                }
                let _ = respond_to.send(Ok(()));
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }

            RoomMessage::EngineCompleted(completion) => {
                self.apply_completion(completion).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    fn handle_join(
        &mut self,
        peer_id: PeerId,
        display_name: String,
        connection: ConnectionActorHandle,
    ) -> Result<JoinResponse, SfuError> {
        if self.peers.contains_key(&peer_id) {
            return Err(SfuError::InvalidRequest(
                "peer is already in this room".to_string(),
            ));
        }
        if self.settings.max_peers > 0 && self.peers.len() >= self.settings.max_peers {
            return Err(SfuError::RoomFull(self.room_id.to_string()));
        }

        let mut others: Vec<&Peer> = self.peers.values().collect();
        others.sort_by_key(|p| p.join_seq());
        let response = JoinResponse {
            peer_id: peer_id.clone(),
            router_rtp_capabilities: self.router.rtp_capabilities().clone(),
            peers: others.iter().map(|p| p.info()).collect(),
            existing_producers: others.iter().flat_map(|p| p.producer_infos()).collect(),
        };

        let peer = Peer::new(peer_id.clone(), display_name, self.next_join_seq, connection);
        self.next_join_seq += 1;

        self.broadcast(&peer_id, &Notification::PeerJoined(peer.info()));
        self.peers.insert(peer_id.clone(), peer);
        self.metrics.peer_joined();

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peers = self.peers.len(),
            existing_producers = response.existing_producers.len(),
            "Peer joined"
        );

        Ok(response)
    }

    /// Remove a peer: consumers, then producers (with their cascade), then
    /// transports, then the peer itself. The remaining peers get `peerLeft`.
    async fn close_peer(&mut self, peer_id: &PeerId, reason: LeaveReason) {
        let Some(mut peer) = self.peers.remove(peer_id) else {
            debug!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                "Peer already removed"
            );
            return;
        };

        let (consumers, producers, transports) = peer.take_resources();
        for consumer_id in &consumers {
            self.router.close_consumer(*consumer_id).await;
        }
        for producer_id in &producers {
            self.cascade_producer_close(*producer_id).await;
        }
        for transport_id in &transports {
            self.router.close_transport(*transport_id).await;
        }

        self.metrics.peer_left();
        metrics::record_peer_removed(reason.as_str(), peer.joined_at().elapsed());

        self.broadcast(
            peer_id,
            &Notification::PeerLeft {
                peer_id: peer_id.clone(),
            },
        );

        if reason == LeaveReason::NegotiationTimeout {
            peer.connection().close("negotiation timeout");
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            reason = reason.as_str(),
            consumers = consumers.len(),
            producers = producers.len(),
            transports = transports.len(),
            peers_remaining = self.peers.len(),
            "Peer left"
        );
    }

    async fn check_negotiation_timeouts(&mut self) {
        let timeout = self.settings.negotiation_timeout;
        if !timeout.is_zero() {
            let now = Instant::now();
            let expired: Vec<PeerId> = self
                .peers
                .values()
                .filter(|p| {
                    !p.has_connected_transport() && now.duration_since(p.joined_at()) >= timeout
                })
                .map(|p| p.peer_id().clone())
                .collect();

            for peer_id in expired {
                warn!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    timeout_secs = timeout.as_secs(),
                    "Peer did not connect a transport in time, removing"
                );
                self.close_peer(&peer_id, LeaveReason::NegotiationTimeout)
                    .await;
            }
        }

        if self.peers.is_empty() {
            self.teardown().await;
        }
    }

    /// Deregister from the registry and release the router.
    async fn teardown(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;

        let removed = tokio::select! {
            result = self.registry.room_closed(self.room_id.clone(), self.epoch) => {
                result.unwrap_or(false)
            }
            () = self.cancel_token.cancelled() => false,
        };
        self.router.close().await;

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            epoch = self.epoch,
            deregistered = removed,
            "Room empty, closed"
        );
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    fn handle_create_transport(
        &mut self,
        peer_id: PeerId,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportInfo, SfuError>>,
    ) {
        let Some(join_seq) = self.peers.get(&peer_id).map(Peer::join_seq) else {
            let _ = respond_to.send(Err(SfuError::PeerNotFound(peer_id.to_string())));
            return;
        };

        let router = self.router.clone();
        self.spawn_engine_call(async move {
            let result = router.create_transport(direction).await;
            EngineCompletion::TransportCreated {
                peer_id,
                join_seq,
                direction,
                result,
                respond_to,
            }
        });
    }

    fn handle_connect_transport(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    ) {
        let checked = self.owned_transport(&peer_id, &transport_id).and_then(|transport| {
            if transport.connected {
                return Err(SfuError::Negotiation(
                    "transport is already connected".to_string(),
                ));
            }
            validate_dtls_parameters(&dtls_parameters).map_err(SfuError::Negotiation)
        });
        if let Err(e) = checked {
            let _ = respond_to.send(Err(e));
            return;
        }

        let router = self.router.clone();
        self.spawn_engine_call(async move {
            let result = router.connect_transport(transport_id, dtls_parameters).await;
            EngineCompletion::TransportConnected {
                peer_id,
                transport_id,
                result,
                respond_to,
            }
        });
    }

    /// Look up a transport in the peer's own mapping only.
    fn owned_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
    ) -> Result<&super::peer::Transport, SfuError> {
        let peer = self
            .peers
            .get(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;
        peer.transport(transport_id)
            .ok_or(SfuError::TransportNotFound(*transport_id))
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    fn handle_produce(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<ProducerId, SfuError>>,
    ) {
        let checked = self.owned_transport(&peer_id, &transport_id).and_then(|transport| {
            if transport.direction != TransportDirection::Send {
                return Err(SfuError::Negotiation(
                    "produce requires a send transport".to_string(),
                ));
            }
            validate_producer_parameters(kind, &rtp_parameters, self.router.rtp_capabilities())
                .map_err(SfuError::Negotiation)
        });
        if let Err(e) = checked {
            let _ = respond_to.send(Err(e));
            return;
        }

        let router = self.router.clone();
        self.spawn_engine_call(async move {
            let result = router
                .produce(transport_id, kind, rtp_parameters.clone())
                .await;
            EngineCompletion::Produced {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                result,
                respond_to,
            }
        });
    }

    async fn handle_close_producer(
        &mut self,
        peer_id: &PeerId,
        producer_id: ProducerId,
    ) -> Result<(), SfuError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;

        if peer.remove_producer(&producer_id).is_none() {
            if peer.closed_producer(&producer_id) {
                return Ok(());
            }
            return Err(SfuError::ProducerNotFound(producer_id));
        }

        self.cascade_producer_close(producer_id).await;
        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            "Producer closed"
        );
        Ok(())
    }

    /// Close a producer that was already removed from its owner, and every
    /// consumer of it in every peer.
    async fn cascade_producer_close(&mut self, producer_id: ProducerId) {
        self.router.close_producer(producer_id).await;

        let mut closed = Vec::new();
        for peer in self.peers.values_mut() {
            for consumer_id in peer.remove_consumers_of(producer_id) {
                peer.connection().notify(Notification::ConsumerClosed {
                    consumer_id,
                    producer_id,
                });
                closed.push(consumer_id);
            }
        }

        for consumer_id in closed {
            self.router.close_consumer(consumer_id).await;
        }
    }

    /// Find a live producer and its owner.
    fn find_producer(&self, producer_id: &ProducerId) -> Option<(&Peer, &Producer)> {
        self.peers
            .values()
            .find_map(|peer| peer.producer(producer_id).map(|producer| (peer, producer)))
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    fn handle_consume(
        &mut self,
        peer_id: PeerId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumerInfo, SfuError>>,
    ) {
        let checked = self
            .owned_transport(&peer_id, &transport_id)
            .and_then(|transport| {
                if transport.direction != TransportDirection::Recv {
                    return Err(SfuError::Negotiation(
                        "consume requires a recv transport".to_string(),
                    ));
                }
                match self.find_producer(&producer_id) {
                    Some((owner, producer)) if owner.peer_id() != &peer_id => Ok(producer),
                    _ => Err(SfuError::ProducerNotFound(producer_id)),
                }
            })
            .and_then(|producer| {
                if can_consume(producer.kind, &producer.rtp_parameters, &rtp_capabilities) {
                    Ok(())
                } else {
                    Err(SfuError::Negotiation(format!(
                        "rtpCapabilities cannot receive {} producer",
                        producer.kind
                    )))
                }
            });
        if let Err(e) = checked {
            let _ = respond_to.send(Err(e));
            return;
        }

        let router = self.router.clone();
        self.spawn_engine_call(async move {
            let result = router
                .consume(transport_id, producer_id, rtp_capabilities)
                .await;
            EngineCompletion::Consumed {
                peer_id,
                transport_id,
                result,
                respond_to,
            }
        });
    }

    fn handle_resume_consumer(
        &mut self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    ) {
        let owned = match self.peers.get_mut(&peer_id) {
            None => Err(SfuError::PeerNotFound(peer_id.to_string())),
            Some(peer) => {
                if peer.consumer_mut(&consumer_id).is_some() {
                    Ok(())
                } else {
                    Err(SfuError::ConsumerNotFound(consumer_id))
                }
            }
        };
        if let Err(e) = owned {
            let _ = respond_to.send(Err(e));
            return;
        }

        let router = self.router.clone();
        self.spawn_engine_call(async move {
            let result = router.resume_consumer(consumer_id).await;
            EngineCompletion::ConsumerResumed {
                peer_id,
                consumer_id,
                result,
                respond_to,
            }
        });
    }

    async fn handle_close_consumer(
        &mut self,
        peer_id: &PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SfuError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;

        if peer.remove_consumer(&consumer_id).is_none() {
            if peer.closed_consumer(&consumer_id) {
                return Ok(());
            }
            return Err(SfuError::ConsumerNotFound(consumer_id));
        }

        self.router.close_consumer(consumer_id).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Engine completions
    // ------------------------------------------------------------------

    /// Run an engine call off the room loop and feed its result back in.
    fn spawn_engine_call<F>(&self, call: F)
    where
        F: std::future::Future<Output = EngineCompletion> + Send + 'static,
    {
        let sender = self.self_sender.clone();
        let router = self.router.clone();
        let room_id = self.room_id.to_string();
        tokio::spawn(async move {
            let completion = call.await;
            let Some(sender) = sender.upgrade() else {
                completion.abandon(&router, SfuError::RoomClosed(room_id)).await;
                return;
            };
            if let Err(mpsc::error::SendError(RoomMessage::EngineCompleted(completion))) =
                sender.send(RoomMessage::EngineCompleted(completion)).await
            {
                completion.abandon(&router, SfuError::RoomClosed(room_id)).await;
            }
        });
    }

    async fn apply_completion(&mut self, completion: EngineCompletion) {
        match completion {
            EngineCompletion::TransportCreated {
                peer_id,
                join_seq,
                direction,
                result,
                respond_to,
            } => {
                let member = self
                    .peers
                    .get_mut(&peer_id)
                    .filter(|peer| peer.join_seq() == join_seq);
                let result = match (result, member) {
                    (Err(e), _) => Err(self.router.error(e)),
                    (Ok(info), None) => {
                        self.router.close_transport(info.transport_id).await;
                        Err(SfuError::PeerNotFound(peer_id.to_string()))
                    }
                    (Ok(info), Some(peer)) => {
                        peer.add_transport(info.transport_id, direction);
                        metrics::record_resource_created("transport");
                        debug!(
                            target: "sfu.actor.room",
                            room_id = %self.room_id,
                            peer_id = %peer_id,
                            transport_id = %info.transport_id,
                            direction = direction.as_str(),
                            "Transport created"
                        );
                        Ok(info)
                    }
                };
                let _ = respond_to.send(result);
            }

            EngineCompletion::TransportConnected {
                peer_id,
                transport_id,
                result,
                respond_to,
            } => {
                let result = result.map_err(|e| self.router.error(e)).and_then(|()| {
                    let peer = self
                        .peers
                        .get_mut(&peer_id)
                        .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;
                    if peer.mark_connected(&transport_id) {
                        Ok(())
                    } else {
                        Err(SfuError::TransportNotFound(transport_id))
                    }
                });
                let _ = respond_to.send(result);
            }

            EngineCompletion::Produced {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                result,
                respond_to,
            } => {
                let result = match result {
                    Err(e) => Err(self.router.error(e)),
                    Ok(producer_id) => {
                        let registered =
                            self.register_producer(&peer_id, transport_id, producer_id, kind, rtp_parameters);
                        if registered.is_err() {
                            self.router.close_producer(producer_id).await;
                        }
                        registered.map(|()| producer_id)
                    }
                };
                let _ = respond_to.send(result);
            }

            EngineCompletion::Consumed {
                peer_id,
                transport_id,
                result,
                respond_to,
            } => {
                let result = match result {
                    Err(e) => Err(self.router.error(e)),
                    Ok(info) => {
                        let registered = self.register_consumer(&peer_id, transport_id, &info);
                        if registered.is_err() {
                            self.router.close_consumer(info.consumer_id).await;
                        }
                        registered.map(|()| info)
                    }
                };
                let _ = respond_to.send(result);
            }

            EngineCompletion::ConsumerResumed {
                peer_id,
                consumer_id,
                result,
                respond_to,
            } => {
                let result = result.map_err(|e| self.router.error(e)).and_then(|()| {
                    let consumer = self
                        .peers
                        .get_mut(&peer_id)
                        .and_then(|peer| peer.consumer_mut(&consumer_id))
                        .ok_or(SfuError::ConsumerNotFound(consumer_id))?;
                    consumer.paused = false;
                    Ok(())
                });
                let _ = respond_to.send(result);
            }
        }
    }

    /// Register a new producer and announce it to every other peer.
    fn register_producer(
        &mut self,
        peer_id: &PeerId,
        transport_id: TransportId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<(), SfuError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;
        if peer.transport(&transport_id).is_none() {
            return Err(SfuError::TransportNotFound(transport_id));
        }

        peer.add_producer(
            producer_id,
            Producer {
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        metrics::record_resource_created("producer");

        self.broadcast(
            peer_id,
            &Notification::NewProducerAvailable(ProducerInfo {
                peer_id: peer_id.clone(),
                producer_id,
                kind,
                rtp_parameters,
            }),
        );

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );
        Ok(())
    }

    fn register_consumer(
        &mut self,
        peer_id: &PeerId,
        transport_id: TransportId,
        info: &ConsumerInfo,
    ) -> Result<(), SfuError> {
        if self.find_producer(&info.producer_id).is_none() {
            return Err(SfuError::ProducerNotFound(info.producer_id));
        }
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;
        if peer.transport(&transport_id).is_none() {
            return Err(SfuError::TransportNotFound(transport_id));
        }

        peer.add_consumer(
            info.consumer_id,
            Consumer {
                producer_id: info.producer_id,
                paused: info.paused,
            },
        );
        metrics::record_resource_created("consumer");

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            consumer_id = %info.consumer_id,
            producer_id = %info.producer_id,
            "Consumer created"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Queue a notification to every peer except `except`.
    fn broadcast(&self, except: &PeerId, notification: &Notification) {
        for peer in self.peers.values() {
            if peer.peer_id() != except {
                peer.connection().notify(notification.clone());
            }
        }
    }

    fn get_state(&self) -> RoomState {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by_key(|p| p.join_seq());
        RoomState {
            room_id: self.room_id.clone(),
            router_id: self.router.router_id(),
            epoch: self.epoch,
            peers: peers.into_iter().map(Peer::state).collect(),
        }
    }

    /// Fail everything still queued once the loop has exited.
    async fn drain_mailbox(&mut self) {
        self.receiver.close();
        let room_closed = || SfuError::RoomClosed(self.room_id.to_string());

        while let Some(message) = self.receiver.recv().await {
            match message {
                RoomMessage::Join { respond_to, .. } => {
                    let _ = respond_to.send(Err(room_closed()));
                }
                RoomMessage::CreateTransport { respond_to, .. } => {
                    let _ = respond_to.send(Err(room_closed()));
                }
                RoomMessage::ConnectTransport { respond_to, .. }
                | RoomMessage::CloseProducer { respond_to, .. }
                | RoomMessage::ResumeConsumer { respond_to, .. }
                | RoomMessage::CloseConsumer { respond_to, .. } => {
                    let _ = respond_to.send(Err(room_closed()));
                }
                RoomMessage::Produce { respond_to, .. } => {
                    let _ = respond_to.send(Err(room_closed()));
                }
                RoomMessage::Consume { respond_to, .. } => {
                    let _ = respond_to.send(Err(room_closed()));
                }
                RoomMessage::ClosePeer { respond_to, .. } => {
                    let _ = respond_to.send(Ok(()));
                }
                RoomMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.get_state());
                }
                RoomMessage::EngineCompleted(completion) => {
                    completion.abandon(&self.router, room_closed()).await;
                }
            }
        }
    }

    /// Cancellation: drop every peer without contacting the registry.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peers = self.peers.len(),
            "Performing graceful shutdown"
        );

        for (_, peer) in self.peers.drain() {
            self.metrics.peer_left();
            metrics::record_peer_removed(
                LeaveReason::ServerShutdown.as_str(),
                peer.joined_at().elapsed(),
            );
            peer.connection().close("server shutting down");
        }

        self.closing = true;
        self.router.close().await;

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            "Graceful shutdown complete"
        );
    }
}

//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use super::connection::ConnectionActorHandle;
use super::room::RoomActorHandle;
use crate::errors::SfuError;
use crate::media::{EngineError, RouterHandle};

use common::types::{ConsumerId, PeerId, ProducerId, RoomId, RouterId, TransportId};
use signaling_protocol::message::JoinResponse;
use signaling_protocol::rtp::{MediaKind, RtpCapabilities, RtpParameters};
use signaling_protocol::transport::{
    ConsumerInfo, DtlsParameters, TransportDirection, TransportInfo,
};
use signaling_protocol::{Notification, Response};
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the room, creating it (and its router) if absent.
    GetOrCreateRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomActorHandle, SfuError>>,
    },

    /// Router allocation for a pending room finished.
    RoomCreated {
        room_id: RoomId,
        result: Result<RouterHandle, SfuError>,
    },

    /// A room became empty and asks to be removed.
    ///
    /// Responds `true` if the entry for this `epoch` was removed.
    RoomClosed {
        room_id: RoomId,
        epoch: u64,
        respond_to: oneshot::Sender<bool>,
    },

    /// Look up an existing room without creating it.
    GetRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop creating rooms and cancel every room actor.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    Join {
        peer_id: PeerId,
        display_name: String,
        connection: ConnectionActorHandle,
        respond_to: oneshot::Sender<Result<JoinResponse, SfuError>>,
    },

    CreateTransport {
        peer_id: PeerId,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportInfo, SfuError>>,
    },

    ConnectTransport {
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    Produce {
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<ProducerId, SfuError>>,
    },

    CloseProducer {
        peer_id: PeerId,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    Consume {
        peer_id: PeerId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumerInfo, SfuError>>,
    },

    ResumeConsumer {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    CloseConsumer {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    /// Remove a peer and everything it owns. A no-op for unknown peers.
    ClosePeer {
        peer_id: PeerId,
        reason: LeaveReason,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// An engine call started by the room finished.
    EngineCompleted(EngineCompletion),
}

/// Result of an engine call, routed back through the room mailbox so the
/// room applies it between other messages.
#[derive(Debug)]
pub enum EngineCompletion {
    TransportCreated {
        peer_id: PeerId,
        /// Membership the request was made under; a rejoined peer must not
        /// inherit the transport.
        join_seq: u64,
        direction: TransportDirection,
        result: Result<TransportInfo, EngineError>,
        respond_to: oneshot::Sender<Result<TransportInfo, SfuError>>,
    },
    TransportConnected {
        peer_id: PeerId,
        transport_id: TransportId,
        result: Result<(), EngineError>,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
    Produced {
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        result: Result<ProducerId, EngineError>,
        respond_to: oneshot::Sender<Result<ProducerId, SfuError>>,
    },
    Consumed {
        peer_id: PeerId,
        transport_id: TransportId,
        result: Result<ConsumerInfo, EngineError>,
        respond_to: oneshot::Sender<Result<ConsumerInfo, SfuError>>,
    },
    ConsumerResumed {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        result: Result<(), EngineError>,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

impl EngineCompletion {
    /// Give up on a completion the room can no longer apply: release the
    /// engine resource it created and fail the request.
    pub async fn abandon(self, router: &RouterHandle, error: SfuError) {
        match self {
            EngineCompletion::TransportCreated {
                result, respond_to, ..
            } => {
                if let Ok(info) = result {
                    router.close_transport(info.transport_id).await;
                }
                let _ = respond_to.send(Err(error));
            }
            EngineCompletion::TransportConnected { respond_to, .. }
            | EngineCompletion::ConsumerResumed { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            EngineCompletion::Produced {
                result, respond_to, ..
            } => {
                if let Ok(producer_id) = result {
                    router.close_producer(producer_id).await;
                }
                let _ = respond_to.send(Err(error));
            }
            EngineCompletion::Consumed {
                result, respond_to, ..
            } => {
                if let Ok(info) = result {
                    router.close_consumer(info.consumer_id).await;
                }
                let _ = respond_to.send(Err(error));
            }
        }
    }
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write the response to one client request.
    Respond { response: Response },

    /// Write a server-initiated notification.
    Notify { notification: Notification },

    /// Close the signaling connection.
    Close { reason: String },
}

// ----------------------------------------------------------------------------
// Supporting Types
// ----------------------------------------------------------------------------

/// Why a peer left its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Client sent `leave`.
    Voluntary,
    /// Signaling connection dropped.
    Disconnected,
    /// No transport connected within the negotiation timeout.
    NegotiationTimeout,
    /// Service is shutting down.
    ServerShutdown,
}

impl LeaveReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Voluntary => "voluntary",
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::NegotiationTimeout => "negotiation_timeout",
            LeaveReason::ServerShutdown => "server_shutdown",
        }
    }
}

/// Registry status (for health checks and tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    /// Rooms whose router is still being allocated.
    pub pending_creations: usize,
    /// Routers allocated by this registry over its lifetime.
    pub routers_allocated: u64,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Snapshot of a room.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: RoomId,
    pub router_id: RouterId,
    pub epoch: u64,
    /// Peers in join order.
    pub peers: Vec<PeerState>,
}

impl RoomState {
    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerState> {
        self.peers.iter().find(|p| &p.peer_id == peer_id)
    }

    /// Consumers in any peer that were created from `producer_id`.
    #[must_use]
    pub fn consumers_of(&self, producer_id: ProducerId) -> usize {
        self.peers
            .iter()
            .flat_map(|p| p.consumers.iter())
            .filter(|c| c.producer_id == producer_id)
            .count()
    }
}

/// Snapshot of one peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub peer_id: PeerId,
    pub display_name: String,
    pub transports: Vec<TransportState>,
    pub producer_ids: Vec<ProducerId>,
    pub consumers: Vec<ConsumerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportState {
    pub transport_id: TransportId,
    pub direction: TransportDirection,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerState {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub paused: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_leave_reason_labels() {
        assert_eq!(LeaveReason::Voluntary.as_str(), "voluntary");
        assert_eq!(LeaveReason::Disconnected.as_str(), "disconnected");
        assert_eq!(
            LeaveReason::NegotiationTimeout.as_str(),
            "negotiation_timeout"
        );
        assert_eq!(LeaveReason::ServerShutdown.as_str(), "server_shutdown");
    }

    #[test]
    fn test_room_state_consumers_of() {
        let producer_id = ProducerId::new();
        let other = ProducerId::new();
        let consumer = |producer_id| ConsumerState {
            consumer_id: ConsumerId::new(),
            producer_id,
            paused: true,
        };
        let peer = |name: &str, consumers| PeerState {
            peer_id: PeerId::parse(name).unwrap(),
            display_name: name.to_string(),
            transports: Vec::new(),
            producer_ids: Vec::new(),
            consumers,
        };
        let state = RoomState {
            room_id: RoomId::parse("R1").unwrap(),
            router_id: RouterId::new(),
            epoch: 1,
            peers: vec![
                peer("a", vec![consumer(producer_id), consumer(other)]),
                peer("b", vec![consumer(producer_id)]),
            ],
        };

        assert_eq!(state.consumers_of(producer_id), 2);
        assert_eq!(state.consumers_of(other), 1);
        assert!(state.peer(&PeerId::parse("b").unwrap()).is_some());
    }
}

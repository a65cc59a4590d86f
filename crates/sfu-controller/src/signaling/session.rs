//! Per-connection request handling.
//!
//! A [`SignalingSession`] turns each decoded request into one room operation
//! and exactly one response. It tracks whether the connection has joined a
//! room; every request except `join` and `leave` requires a joined session.

use crate::actors::{ConnectionActorHandle, LeaveReason, RoomActorHandle, RoomRegistryHandle};
use crate::errors::SfuError;
use crate::observability::metrics;

use common::types::{PeerId, RoomId};
use serde::Serialize;
use signaling_protocol::message::{
    ClientRequest, JoinRequest, OkResponse, ProduceResponse, Request, RequestId,
};
use signaling_protocol::Response;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Longest display name kept, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 128;

/// Name given to peers that join without one.
pub const DEFAULT_DISPLAY_NAME: &str = "Peer";

#[derive(Debug)]
enum SessionState {
    Idle,
    /// A join is in flight. `cancelled` is set by a leave or disconnect
    /// that arrives before it completes.
    Joining { cancelled: bool },
    Joined { room: RoomActorHandle },
    Closed,
}

/// Signaling state of one WebSocket connection.
#[derive(Debug)]
pub struct SignalingSession {
    peer_id: PeerId,
    registry: RoomRegistryHandle,
    connection: ConnectionActorHandle,
    state: Mutex<SessionState>,
}

impl SignalingSession {
    #[must_use]
    pub fn new(
        peer_id: PeerId,
        registry: RoomRegistryHandle,
        connection: ConnectionActorHandle,
    ) -> Self {
        Self {
            peer_id,
            registry,
            connection,
            state: Mutex::new(SessionState::Idle),
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Whether the session is currently a member of a room.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.lock()
            .map(|state| matches!(*state, SessionState::Joined { .. }))
            .unwrap_or(false)
    }

    /// Whether a join request is still waiting on its room.
    #[must_use]
    pub fn is_joining(&self) -> bool {
        self.lock()
            .map(|state| matches!(*state, SessionState::Joining { cancelled: false }))
            .unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>, SfuError> {
        self.state
            .lock()
            .map_err(|e| SfuError::Internal(format!("session state poisoned: {e}")))
    }

    fn joined_room(&self) -> Result<RoomActorHandle, SfuError> {
        match &*self.lock()? {
            SessionState::Joined { room } => Ok(room.clone()),
            _ => Err(SfuError::InvalidRequest(
                "join a room before sending this request".to_string(),
            )),
        }
    }

    /// Handle one request and build its response.
    pub async fn handle_request(&self, request: ClientRequest) -> Response {
        let ClientRequest { id, request } = request;
        let method = request.method();
        let start = Instant::now();

        let result = self.dispatch(id, request).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.error_type_label(),
        };
        metrics::record_request(method, outcome, start.elapsed());

        match result {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, SfuError::Internal(_) | SfuError::FatalWorker { .. }) {
                    warn!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id,
                        method,
                        error = %e,
                        "Request failed"
                    );
                } else {
                    debug!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id,
                        method,
                        error = %e,
                        "Request rejected"
                    );
                }
                Response::error(id, e.error_code(), e.client_message())
            }
        }
    }

    async fn dispatch(&self, id: RequestId, request: Request) -> Result<Response, SfuError> {
        match request {
            Request::Join(join) => {
                let response = self.join(join).await?;
                success(id, &response)
            }
            Request::Leave => {
                self.leave().await?;
                success(id, &OkResponse::OK)
            }
            Request::CreateTransport(req) => {
                let info = self
                    .joined_room()?
                    .create_transport(self.peer_id.clone(), req.direction)
                    .await?;
                success(id, &info)
            }
            Request::ConnectTransport(req) => {
                self.joined_room()?
                    .connect_transport(self.peer_id.clone(), req.transport_id, req.dtls_parameters)
                    .await?;
                success(id, &OkResponse::OK)
            }
            Request::Produce(req) => {
                let producer_id = self
                    .joined_room()?
                    .produce(
                        self.peer_id.clone(),
                        req.transport_id,
                        req.kind,
                        req.rtp_parameters,
                    )
                    .await?;
                success(id, &ProduceResponse { producer_id })
            }
            Request::CloseProducer(req) => {
                self.joined_room()?
                    .close_producer(self.peer_id.clone(), req.producer_id)
                    .await?;
                success(id, &OkResponse::OK)
            }
            Request::Consume(req) => {
                let info = self
                    .joined_room()?
                    .consume(
                        self.peer_id.clone(),
                        req.transport_id,
                        req.producer_id,
                        req.rtp_capabilities,
                    )
                    .await?;
                success(id, &info)
            }
            Request::ResumeConsumer(req) => {
                self.joined_room()?
                    .resume_consumer(self.peer_id.clone(), req.consumer_id)
                    .await?;
                success(id, &OkResponse::OK)
            }
            Request::CloseConsumer(req) => {
                self.joined_room()?
                    .close_consumer(self.peer_id.clone(), req.consumer_id)
                    .await?;
                success(id, &OkResponse::OK)
            }
        }
    }

    async fn join(
        &self,
        join: JoinRequest,
    ) -> Result<signaling_protocol::message::JoinResponse, SfuError> {
        let room_id =
            RoomId::parse(&join.room_id).map_err(|e| SfuError::InvalidRoom(e.to_string()))?;
        let display_name = normalize_display_name(&join.display_name);

        {
            let mut state = self.lock()?;
            match *state {
                SessionState::Idle => *state = SessionState::Joining { cancelled: false },
                SessionState::Closed => {
                    return Err(SfuError::InvalidRequest("connection is closing".to_string()))
                }
                SessionState::Joining { .. } | SessionState::Joined { .. } => {
                    return Err(SfuError::InvalidRequest("already joined a room".to_string()))
                }
            }
        }

        let joined = self
            .registry
            .join_room(
                room_id.clone(),
                self.peer_id.clone(),
                display_name,
                self.connection.clone(),
            )
            .await;

        let (room, response) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                let mut state = self.lock()?;
                if matches!(*state, SessionState::Joining { .. }) {
                    *state = SessionState::Idle;
                }
                return Err(e);
            }
        };

        let cancelled = {
            let mut state = self.lock()?;
            match *state {
                SessionState::Joining { cancelled: false } => {
                    *state = SessionState::Joined { room: room.clone() };
                    false
                }
                SessionState::Joining { cancelled: true } => {
                    *state = SessionState::Idle;
                    true
                }
                // Disconnected while joining.
                _ => true,
            }
        };

        if cancelled {
            let reason = if self.connection.is_cancelled() {
                LeaveReason::Disconnected
            } else {
                LeaveReason::Voluntary
            };
            room.close_peer(self.peer_id.clone(), reason).await?;
            return Err(SfuError::InvalidRequest(
                "left the room before join completed".to_string(),
            ));
        }

        info!(
            target: "sfu.signaling",
            peer_id = %self.peer_id,
            room_id = %room_id,
            "Session joined room"
        );
        Ok(response)
    }

    /// Leave the current room. A no-op when not in a room.
    async fn leave(&self) -> Result<(), SfuError> {
        let room = {
            let mut state = self.lock()?;
            match std::mem::replace(&mut *state, SessionState::Idle) {
                SessionState::Joined { room } => Some(room),
                SessionState::Joining { .. } => {
                    *state = SessionState::Joining { cancelled: true };
                    None
                }
                SessionState::Closed => {
                    *state = SessionState::Closed;
                    None
                }
                SessionState::Idle => None,
            }
        };

        if let Some(room) = room {
            room.close_peer(self.peer_id.clone(), LeaveReason::Voluntary)
                .await?;
            info!(
                target: "sfu.signaling",
                peer_id = %self.peer_id,
                room_id = %room.room_id(),
                "Session left room"
            );
        }
        Ok(())
    }

    /// The connection is gone: leave the room as if `leave` had been sent.
    pub async fn disconnect(&self) {
        let room = match self.lock() {
            Ok(mut state) => match std::mem::replace(&mut *state, SessionState::Closed) {
                SessionState::Joined { room } => Some(room),
                _ => None,
            },
            Err(e) => {
                warn!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id,
                    error = %e,
                    "Cannot read session state on disconnect"
                );
                None
            }
        };

        if let Some(room) = room {
            if let Err(e) = room
                .close_peer(self.peer_id.clone(), LeaveReason::Disconnected)
                .await
            {
                debug!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id,
                    error = %e,
                    "Room already gone on disconnect"
                );
            }
        }
    }
}

fn success<T: Serialize>(id: RequestId, data: &T) -> Result<Response, SfuError> {
    Response::success(id, data)
        .map_err(|e| SfuError::Internal(format!("response serialization failed: {e}")))
}

/// Trim and cap a client-supplied display name.
#[must_use]
pub fn normalize_display_name(name: &str) -> String {
    let trimmed: String = name.trim().chars().take(MAX_DISPLAY_NAME_CHARS).collect();
    let trimmed = trimmed.trim_end();
    if trimmed.is_empty() {
        DEFAULT_DISPLAY_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, ConnectionActor, RegistrySettings, RoomSettings};
    use crate::config::default_media_codecs;
    use crate::media::{RouterAllocator, WorkerPool, WorkerSettings};
    use signaling_protocol::message::{CreateTransportRequest, JoinResponse};
    use signaling_protocol::transport::TransportDirection;
    use signaling_protocol::ErrorCode;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn registry() -> RoomRegistryHandle {
        let settings = WorkerSettings {
            listen_ip: "0.0.0.0".parse().unwrap(),
            announced_ip: "127.0.0.1".to_string(),
            min_port: 43000,
            max_port: 43099,
        };
        let pool = WorkerPool::spawn_local(1, &settings).unwrap();
        let allocator = RouterAllocator::new(Arc::new(pool), default_media_codecs());
        RoomRegistryHandle::new(
            allocator,
            RegistrySettings {
                max_rooms: 0,
                room: RoomSettings {
                    max_peers: 0,
                    negotiation_timeout: Duration::ZERO,
                },
            },
            ActorMetrics::new(),
        )
    }

    fn session(registry: &RoomRegistryHandle, peer: &str) -> SignalingSession {
        let (tx, _rx) = mpsc::channel(64);
        let peer_id = PeerId::parse(peer).unwrap();
        let (connection, _task) = ConnectionActor::spawn(
            peer_id.clone(),
            tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        SignalingSession::new(peer_id, registry.clone(), connection)
    }

    fn join_request(id: RequestId, room_id: &str) -> ClientRequest {
        ClientRequest {
            id,
            request: Request::Join(JoinRequest {
                room_id: room_id.to_string(),
                display_name: "  Alice  ".to_string(),
            }),
        }
    }

    #[test]
    fn test_normalize_display_name() {
        assert_eq!(normalize_display_name("  Alice "), "Alice");
        assert_eq!(normalize_display_name("   "), "Peer");
        assert_eq!(normalize_display_name(""), "Peer");
        let long = "x".repeat(200);
        assert_eq!(normalize_display_name(&long).chars().count(), 128);
    }

    #[tokio::test]
    async fn test_request_before_join_is_rejected() {
        let registry = registry();
        let session = session(&registry, "alice");

        let response = session
            .handle_request(ClientRequest {
                id: 4,
                request: Request::CreateTransport(CreateTransportRequest {
                    direction: TransportDirection::Send,
                }),
            })
            .await;

        assert_eq!(response.id, 4);
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_invalid_room_id() {
        let registry = registry();
        let session = session(&registry, "alice");

        let response = session.handle_request(join_request(1, "bad room!")).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRoom);
        assert!(!session.is_joined());
    }

    #[tokio::test]
    async fn test_join_then_second_join_rejected() {
        let registry = registry();
        let session = session(&registry, "alice");

        let response = session.handle_request(join_request(1, "R1")).await;
        assert!(response.ok);
        let joined: JoinResponse = response.data_as().unwrap();
        assert_eq!(joined.peer_id.as_str(), "alice");
        assert!(session.is_joined());

        let response = session.handle_request(join_request(2, "R2")).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_leave_without_join_is_ok_and_rejoin_allowed() {
        let registry = registry();
        let session = session(&registry, "alice");

        let response = session
            .handle_request(ClientRequest {
                id: 1,
                request: Request::Leave,
            })
            .await;
        assert!(response.ok);

        assert!(session.handle_request(join_request(2, "R1")).await.ok);
        let response = session
            .handle_request(ClientRequest {
                id: 3,
                request: Request::Leave,
            })
            .await;
        assert!(response.ok);
        assert!(!session.is_joined());
        assert!(registry
            .get_room(RoomId::parse("R1").unwrap())
            .await
            .unwrap()
            .is_none());

        assert!(session.handle_request(join_request(4, "R1")).await.ok);
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer() {
        let registry = registry();
        let alice = session(&registry, "alice");
        let bob = session(&registry, "bob");
        assert!(alice.handle_request(join_request(1, "R1")).await.ok);
        assert!(bob.handle_request(join_request(1, "R1")).await.ok);

        alice.disconnect().await;

        let room = registry
            .get_room(RoomId::parse("R1").unwrap())
            .await
            .unwrap()
            .unwrap();
        let state = room.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 1);
        assert!(state.peer(bob.peer_id()).is_some());

        let response = alice.handle_request(join_request(2, "R1")).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);
    }
}

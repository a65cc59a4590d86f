//! Test harness for the SFU control plane.
//!
//! [`TestSfu`] wires a real registry, allocator and worker pool over
//! [`MockWorker`]s. Tests can drive it in-process through [`TestPeer`]s, or
//! call [`TestSfu::serve`] to expose the real WebSocket endpoint on a random
//! local port.
//!
//! # Example
//! ```rust,ignore
//! let sfu = TestSfu::builder().negotiation_timeout(Duration::from_secs(30)).build();
//! let mut alice = sfu.peer("alice");
//! let joined = alice.join("R1").await;
//! let transport = alice.create_transport(TransportDirection::Send).await;
//! ```

use crate::fixtures::{client_capabilities, dtls_parameters};
use crate::mock_worker::MockWorker;

use common::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use sfu_controller::actors::{
    ActorMetrics, ConnectionActor, ConnectionActorHandle, OutboundFrame, RegistrySettings,
    RoomRegistryHandle, RoomSettings, RoomState,
};
use sfu_controller::config::default_media_codecs;
use sfu_controller::media::{MediaWorker, RouterAllocator, WorkerPool};
use sfu_controller::signaling::{signaling_router, SignalingSession, SignalingState};
use signaling_protocol::codec::decode_server_message;
use signaling_protocol::message::{
    CloseConsumerRequest, CloseProducerRequest, ConnectTransportRequest, ConsumeRequest,
    CreateTransportRequest, JoinRequest, JoinResponse, NotificationFrame, ProduceRequest,
    ProduceResponse, ResumeConsumerRequest,
};
use signaling_protocol::rtp::{MediaKind, RtpCapabilities, RtpParameters};
use signaling_protocol::transport::{ConsumerInfo, TransportDirection, TransportInfo};
use signaling_protocol::{ClientRequest, Request, Response, ServerMessage, DEFAULT_MAX_FRAME_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a peer waits for a notification before failing the test.
pub const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry, allocator and pool over mock workers.
pub struct TestSfu {
    registry: RoomRegistryHandle,
    allocator: RouterAllocator,
    pool: Arc<WorkerPool>,
    workers: Vec<Arc<MockWorker>>,
    metrics: Arc<ActorMetrics>,
    join_timeout: Duration,
    max_message_size: usize,
}

impl TestSfu {
    #[must_use]
    pub fn builder() -> TestSfuBuilder {
        TestSfuBuilder::default()
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn allocator(&self) -> &RouterAllocator {
        &self.allocator
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Mock worker by pool index.
    #[must_use]
    pub fn worker(&self, index: usize) -> &Arc<MockWorker> {
        &self.workers[index]
    }

    /// Routers created and not yet closed.
    #[must_use]
    pub fn live_routers(&self) -> usize {
        self.allocator.live_routers()
    }

    /// In-process peer with its own connection actor.
    #[must_use]
    pub fn peer(&self, peer_id: &str) -> TestPeer {
        let peer_id = PeerId::parse(peer_id).unwrap();
        let (outbound_tx, outbound) = mpsc::channel(256);
        let (connection, connection_task) = ConnectionActor::spawn(
            peer_id.clone(),
            outbound_tx,
            CancellationToken::new(),
            Arc::clone(&self.metrics),
        );
        let session = SignalingSession::new(peer_id, self.registry.clone(), connection.clone());

        TestPeer {
            session,
            connection,
            outbound,
            next_id: AtomicU64::new(1),
            _connection_task: connection_task,
        }
    }

    /// Snapshot of a room, if it exists.
    pub async fn room_state(&self, room_id: &str) -> Option<RoomState> {
        let room = self
            .registry
            .get_room(RoomId::parse(room_id).unwrap())
            .await
            .unwrap()?;
        room.get_state().await.ok()
    }

    /// Wait until the room is gone from the registry.
    pub async fn wait_room_removed(&self, room_id: &str) {
        let room_id = RoomId::parse(room_id).unwrap();
        tokio::time::timeout(NOTIFICATION_TIMEOUT, async {
            while self.registry.get_room(room_id.clone()).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("room {room_id} was not removed"));
    }

    /// Wait until exactly `expected` routers are live.
    pub async fn wait_live_routers(&self, expected: usize) {
        tokio::time::timeout(NOTIFICATION_TIMEOUT, async {
            while self.allocator.live_routers() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {expected} live routers, found {}",
                self.allocator.live_routers()
            )
        });
    }

    /// Serve the signaling endpoint on `127.0.0.1:0`.
    pub async fn serve(&self) -> Result<TestServer, anyhow::Error> {
        let cancel_token = self.registry.child_token();
        let state = Arc::new(SignalingState {
            registry: self.registry.clone(),
            metrics: Arc::clone(&self.metrics),
            max_message_size: self.max_message_size,
            join_timeout: self.join_timeout,
            cancel_token: cancel_token.clone(),
        });
        let app = signaling_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let server_token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_token.cancelled().await });
            if let Err(e) = server.await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(TestServer {
            addr,
            cancel_token,
            _handle: handle,
        })
    }
}

/// Builder for [`TestSfu`].
#[derive(Debug)]
pub struct TestSfuBuilder {
    worker_count: u32,
    workers: Vec<Arc<MockWorker>>,
    max_rooms: usize,
    max_peers: usize,
    negotiation_timeout: Duration,
    join_timeout: Duration,
    max_message_size: usize,
}

impl Default for TestSfuBuilder {
    fn default() -> Self {
        Self {
            worker_count: 1,
            workers: Vec::new(),
            max_rooms: 0,
            max_peers: 0,
            negotiation_timeout: Duration::ZERO,
            join_timeout: Duration::ZERO,
            max_message_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl TestSfuBuilder {
    /// Number of default mock workers. Ignored when workers are added explicitly.
    #[must_use]
    pub fn workers(mut self, count: u32) -> Self {
        self.worker_count = count;
        self
    }

    #[must_use]
    pub fn with_worker(mut self, worker: Arc<MockWorker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// Zero means unlimited.
    #[must_use]
    pub fn max_rooms(mut self, max_rooms: usize) -> Self {
        self.max_rooms = max_rooms;
        self
    }

    /// Zero means unlimited.
    #[must_use]
    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Zero disables the timeout.
    #[must_use]
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Zero disables the timeout.
    #[must_use]
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Start the pool and the registry. Must run inside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> TestSfu {
        let workers = if self.workers.is_empty() {
            (0..self.worker_count)
                .map(|id| MockWorker::builder().id(id).build())
                .collect()
        } else {
            self.workers
        };

        let pool = Arc::new(WorkerPool::new(
            workers
                .iter()
                .map(|w| Arc::clone(w) as Arc<dyn MediaWorker>)
                .collect(),
        ));
        let allocator = RouterAllocator::new(Arc::clone(&pool), default_media_codecs());
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            allocator.clone(),
            RegistrySettings {
                max_rooms: self.max_rooms,
                room: RoomSettings {
                    max_peers: self.max_peers,
                    negotiation_timeout: self.negotiation_timeout,
                },
            },
            Arc::clone(&metrics),
        );

        TestSfu {
            registry,
            allocator,
            pool,
            workers,
            metrics,
            join_timeout: self.join_timeout,
            max_message_size: self.max_message_size,
        }
    }
}

/// Signaling endpoint bound to a random local port.
pub struct TestServer {
    addr: SocketAddr,
    cancel_token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestServer {
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL for `peer_id`.
    #[must_use]
    pub fn ws_url(&self, peer_id: &str) -> String {
        format!("ws://{}/ws?peerId={}", self.addr, peer_id)
    }

    /// WebSocket URL without a peer id.
    #[must_use]
    pub fn anonymous_ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self._handle.abort();
    }
}

/// A peer driven directly through its [`SignalingSession`].
///
/// Request helpers that return typed data panic on an error response; use
/// [`TestPeer::request`] to inspect errors.
pub struct TestPeer {
    session: SignalingSession,
    connection: ConnectionActorHandle,
    outbound: mpsc::Receiver<OutboundFrame>,
    next_id: AtomicU64,
    _connection_task: JoinHandle<()>,
}

impl TestPeer {
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        self.session.peer_id()
    }

    #[must_use]
    pub fn session(&self) -> &SignalingSession {
        &self.session
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionActorHandle {
        &self.connection
    }

    /// Send a request with the next id.
    pub async fn request(&self, request: Request) -> Response {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .session
            .handle_request(ClientRequest { id, request })
            .await;
        assert_eq!(response.id, id, "response must echo the request id");
        response
    }

    pub async fn join(&self, room_id: &str) -> JoinResponse {
        let response = self
            .request(Request::Join(JoinRequest {
                room_id: room_id.to_string(),
                display_name: self.peer_id().as_str().to_string(),
            }))
            .await;
        expect_data(response)
    }

    pub async fn leave(&self) -> Response {
        self.request(Request::Leave).await
    }

    pub async fn create_transport(&self, direction: TransportDirection) -> TransportInfo {
        let response = self
            .request(Request::CreateTransport(CreateTransportRequest { direction }))
            .await;
        expect_data(response)
    }

    pub async fn connect_transport(&self, transport_id: TransportId) -> Response {
        self.request(Request::ConnectTransport(ConnectTransportRequest {
            transport_id,
            dtls_parameters: dtls_parameters(),
        }))
        .await
    }

    /// Create and connect a transport.
    pub async fn connected_transport(&self, direction: TransportDirection) -> TransportId {
        let transport = self.create_transport(direction).await;
        let response = self.connect_transport(transport.transport_id).await;
        assert!(response.ok, "connectTransport failed: {:?}", response.error);
        transport.transport_id
    }

    pub async fn produce_request(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Response {
        self.request(Request::Produce(ProduceRequest {
            transport_id,
            kind,
            rtp_parameters,
        }))
        .await
    }

    pub async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> ProducerId {
        let response = self.produce_request(transport_id, kind, rtp_parameters).await;
        expect_data::<ProduceResponse>(response).producer_id
    }

    pub async fn close_producer(&self, producer_id: ProducerId) -> Response {
        self.request(Request::CloseProducer(CloseProducerRequest { producer_id }))
            .await
    }

    pub async fn consume_with(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Response {
        self.request(Request::Consume(ConsumeRequest {
            transport_id,
            producer_id,
            rtp_capabilities,
        }))
        .await
    }

    /// Consume with capabilities matching the default router.
    pub async fn consume(&self, transport_id: TransportId, producer_id: ProducerId) -> ConsumerInfo {
        let response = self
            .consume_with(transport_id, producer_id, client_capabilities())
            .await;
        expect_data(response)
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Response {
        self.request(Request::ResumeConsumer(ResumeConsumerRequest { consumer_id }))
            .await
    }

    pub async fn close_consumer(&self, consumer_id: ConsumerId) -> Response {
        self.request(Request::CloseConsumer(CloseConsumerRequest { consumer_id }))
            .await
    }

    /// Next frame written to this peer's connection.
    pub async fn next_frame(&mut self) -> OutboundFrame {
        tokio::time::timeout(NOTIFICATION_TIMEOUT, self.outbound.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("connection actor stopped")
    }

    /// Next notification; fails on anything else.
    pub async fn next_notification(&mut self) -> NotificationFrame {
        match self.next_frame().await {
            OutboundFrame::Text(text) => match decode_server_message(&text).unwrap() {
                ServerMessage::Notification(frame) => frame,
                ServerMessage::Response(response) => {
                    panic!("expected a notification, got {response:?}")
                }
            },
            OutboundFrame::Close { reason } => {
                panic!("expected a notification, connection closed: {reason}")
            }
        }
    }

    /// Next notification with the given method, skipping others.
    pub async fn notification(&mut self, method: &str) -> NotificationFrame {
        loop {
            let frame = self.next_notification().await;
            if frame.method == method {
                return frame;
            }
        }
    }

    /// Notifications already queued, without waiting.
    pub fn drain_notifications(&mut self) -> Vec<NotificationFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                if let Ok(ServerMessage::Notification(n)) = decode_server_message(&text) {
                    frames.push(n);
                }
            }
        }
        frames
    }

    /// Wait for the connection to be closed by the server; returns the reason.
    pub async fn closed_reason(&mut self) -> String {
        loop {
            if let OutboundFrame::Close { reason } = self.next_frame().await {
                return reason;
            }
        }
    }
}

/// Decode a success payload, failing the test on an error response.
pub fn expect_data<T: serde::de::DeserializeOwned>(response: Response) -> T {
    assert!(
        response.ok,
        "request {} failed: {:?}",
        response.id, response.error
    );
    response.data_as().unwrap()
}

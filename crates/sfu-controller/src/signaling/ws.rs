//! WebSocket endpoint.
//!
//! `GET /ws?peerId=<id>` upgrades to a signaling connection. Each connection
//! gets a [`ConnectionActor`] for outbound frames, a writer task that owns the
//! socket sink, and a [`SignalingSession`] that handles requests. Every
//! request runs in its own task; responses and notifications are serialized
//! through the connection actor.

use super::session::SignalingSession;
use crate::actors::{ActorMetrics, ConnectionActor, OutboundFrame, RoomRegistryHandle};
use crate::observability::metrics;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use axum::Router;
use common::types::PeerId;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use signaling_protocol::{decode_request, CodecError, ErrorCode, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

/// Frames queued between the connection actor and the socket writer.
const OUTBOUND_BUFFER: usize = 64;

/// How long a closing connection waits for its in-flight requests.
const REQUEST_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the writer to flush after the reader stops.
const WRITER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state of the signaling endpoint.
#[derive(Debug)]
pub struct SignalingState {
    pub registry: RoomRegistryHandle,
    pub metrics: Arc<ActorMetrics>,
    /// Largest accepted text frame, in bytes.
    pub max_message_size: usize,
    /// Connections that have not joined a room by then are closed. Zero
    /// disables the timeout.
    pub join_timeout: Duration,
    /// Parent of every connection's token.
    pub cancel_token: CancellationToken,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    peer_id: Option<String>,
}

/// Build the signaling router.
pub fn signaling_router(state: Arc<SignalingState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(
    State(state): State<Arc<SignalingState>>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> HttpResponse {
    if state.cancel_token.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    let peer_id = match params.peer_id.as_deref() {
        Some(raw) => match PeerId::parse(raw) {
            Ok(peer_id) => peer_id,
            Err(e) => {
                debug!(target: "sfu.signaling", error = %e, "Rejecting invalid peerId");
                return (StatusCode::BAD_REQUEST, format!("invalid peerId: {e}")).into_response();
            }
        },
        None => PeerId::generate(),
    };

    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, peer_id, state))
}

#[instrument(skip_all, name = "sfu.signaling.connection", fields(peer_id = %peer_id))]
async fn handle_socket(socket: WebSocket, peer_id: PeerId, state: Arc<SignalingState>) {
    info!(target: "sfu.signaling", peer_id = %peer_id, "Signaling connection opened");

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);

    let (connection, connection_task) = ConnectionActor::spawn(
        peer_id.clone(),
        outbound_tx,
        state.cancel_token.child_token(),
        Arc::clone(&state.metrics),
    );

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let session = Arc::new(SignalingSession::new(
        peer_id.clone(),
        state.registry.clone(),
        connection.clone(),
    ));
    let mut requests = JoinSet::new();

    let join_deadline = tokio::time::sleep(state.join_timeout);
    tokio::pin!(join_deadline);
    let mut join_deadline_armed = !state.join_timeout.is_zero();

    loop {
        tokio::select! {
            () = connection.closed() => {
                debug!(target: "sfu.signaling", peer_id = %peer_id, "Connection closed by server");
                break;
            }

            () = &mut join_deadline, if join_deadline_armed => {
                if session.is_joining() {
                    // A slow room creation gets another full timeout.
                    join_deadline
                        .as_mut()
                        .reset(tokio::time::Instant::now() + state.join_timeout);
                    continue;
                }
                join_deadline_armed = false;
                if !session.is_joined() {
                    warn!(
                        target: "sfu.signaling",
                        peer_id = %peer_id,
                        timeout_secs = state.join_timeout.as_secs(),
                        "No join within timeout, closing connection"
                    );
                    connection.close("join timeout");
                }
            }

            Some(_) = requests.join_next(), if !requests.is_empty() => {}

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match decode_request(&text, state.max_message_size) {
                            Ok(request) => {
                                let session = Arc::clone(&session);
                                let connection = connection.clone();
                                requests.spawn(async move {
                                    let response = session.handle_request(request).await;
                                    if let Err(e) = connection.respond(response).await {
                                        debug!(
                                            target: "sfu.signaling",
                                            peer_id = %session.peer_id(),
                                            error = %e,
                                            "Response not delivered"
                                        );
                                    }
                                });
                            }
                            Err(e) => reject_frame(&connection, &peer_id, &e).await,
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        metrics::record_malformed_frame();
                        debug!(target: "sfu.signaling", peer_id = %peer_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(target: "sfu.signaling", peer_id = %peer_id, "Client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(target: "sfu.signaling", peer_id = %peer_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    // A dropped connection is an implicit leave.
    session.disconnect().await;

    let drained = tokio::time::timeout(REQUEST_DRAIN_TIMEOUT, async {
        while requests.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            target: "sfu.signaling",
            peer_id = %peer_id,
            "In-flight requests did not finish, aborting"
        );
        requests.abort_all();
    }

    connection.cancel();
    if let Err(e) = connection_task.await {
        warn!(target: "sfu.signaling", peer_id = %peer_id, error = ?e, "Connection actor failed");
    }
    if tokio::time::timeout(WRITER_EXIT_TIMEOUT, writer).await.is_err() {
        debug!(target: "sfu.signaling", peer_id = %peer_id, "Socket writer did not exit in time");
    }

    info!(target: "sfu.signaling", peer_id = %peer_id, "Signaling connection closed");
}

/// Answer a frame that failed to decode. Frames without a readable id get
/// no response.
async fn reject_frame(
    connection: &crate::actors::ConnectionActorHandle,
    peer_id: &PeerId,
    error: &CodecError,
) {
    metrics::record_malformed_frame();

    let Some(id) = error.request_id() else {
        debug!(
            target: "sfu.signaling",
            peer_id = %peer_id,
            error = %error,
            "Dropping undecodable frame"
        );
        return;
    };

    debug!(
        target: "sfu.signaling",
        peer_id = %peer_id,
        request_id = id,
        error = %error,
        "Rejecting invalid request"
    );
    let response = Response::error(id, ErrorCode::InvalidRequest, error.to_string());
    if let Err(e) = connection.respond(response).await {
        debug!(target: "sfu.signaling", peer_id = %peer_id, error = %e, "Response not delivered");
    }
}

//! `ConnectionActor` - per-signaling-connection writer.
//!
//! Each `ConnectionActor`:
//! - Serializes responses and notifications for exactly one client
//! - Forwards encoded frames to the socket writer as [`OutboundFrame`]s
//! - Is shared by the signaling session (responses) and the room (notifications)
//!
//! # Backpressure
//!
//! Responses wait for mailbox space. Notifications never wait: a client whose
//! mailbox is full would silently miss room state, so it is disconnected
//! instead.
//!
//! # Lifecycle
//!
//! Runs until `close`, cancellation, or the socket writer going away. The
//! actor cancels its own token on exit, so [`ConnectionActorHandle::closed`]
//! resolves for every exit path.

use crate::errors::SfuError;

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::observability::metrics;

use common::types::PeerId;
use signaling_protocol::{encode_server_message, Notification, Response, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 128;

/// A frame for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Encoded JSON text frame.
    Text(String),
    /// Close the socket.
    Close { reason: String },
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Queue the response to a client request.
    pub async fn respond(&self, response: Response) -> Result<(), SfuError> {
        self.sender
            .send(ConnectionMessage::Respond { response })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))
    }

    /// Queue a notification without waiting.
    ///
    /// Returns `false` if the notification was not queued. A full mailbox
    /// disconnects the client.
    pub fn notify(&self, notification: Notification) -> bool {
        match self.sender.try_send(ConnectionMessage::Notify { notification }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                warn!(
                    target: "sfu.actor.connection",
                    peer_id = %self.peer_id,
                    "Notification queue full, disconnecting slow client"
                );
                self.cancel_token.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the actor to close the socket.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self
            .sender
            .try_send(ConnectionMessage::Close { reason })
            .is_err()
        {
            self.cancel_token.cancel();
        }
    }

    /// Resolves once the actor has stopped or been cancelled.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    peer_id: PeerId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    outbound: mpsc::Sender<OutboundFrame>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a connection actor writing into `outbound`.
    pub fn spawn(
        peer_id: PeerId,
        outbound: mpsc::Sender<OutboundFrame>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            peer_id.as_str(),
        ));

        let actor = Self {
            peer_id: peer_id.clone(),
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            peer_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.actor.connection", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        self.metrics.connection_created();
        debug!(
            target: "sfu.actor.connection",
            peer_id = %self.peer_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.connection",
                        peer_id = %self.peer_id,
                        "ConnectionActor received cancellation signal"
                    );
                    let _ = self.outbound.try_send(OutboundFrame::Close {
                        reason: "connection cancelled".to_string(),
                    });
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "sfu.actor.connection",
                                peer_id = %self.peer_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.cancel_token.cancel();
        self.metrics.connection_closed();

        info!(
            target: "sfu.actor.connection",
            peer_id = %self.peer_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Respond { response } => {
                self.write(ServerMessage::from(response)).await
            }

            ConnectionMessage::Notify { notification } => {
                let method = notification.method();
                match notification.into_frame() {
                    Ok(frame) => {
                        metrics::record_notification(method);
                        self.write(ServerMessage::from(frame)).await
                    }
                    Err(e) => {
                        warn!(
                            target: "sfu.actor.connection",
                            peer_id = %self.peer_id,
                            method,
                            error = %e,
                            "Failed to encode notification"
                        );
                        false
                    }
                }
            }

            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "sfu.actor.connection",
                    peer_id = %self.peer_id,
                    reason = %reason,
                    "Closing connection"
                );
                let _ = self.outbound.send(OutboundFrame::Close { reason }).await;
                true
            }
        }
    }

    /// Encode and forward one message. Returns true if the writer is gone.
    async fn write(&mut self, message: ServerMessage) -> bool {
        let text = match encode_server_message(&message) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "sfu.actor.connection",
                    peer_id = %self.peer_id,
                    error = %e,
                    "Failed to encode server message"
                );
                return false;
            }
        };

        if self.outbound.send(OutboundFrame::Text(text)).await.is_err() {
            debug!(
                target: "sfu.actor.connection",
                peer_id = %self.peer_id,
                "Socket writer gone, stopping"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use signaling_protocol::codec::decode_server_message;
    use signaling_protocol::message::OkResponse;
    use signaling_protocol::ErrorCode;
    use std::time::Duration;

    fn spawn_connection(
        outbound_capacity: usize,
    ) -> (
        ConnectionActorHandle,
        JoinHandle<()>,
        mpsc::Receiver<OutboundFrame>,
        Arc<ActorMetrics>,
    ) {
        let (tx, rx) = mpsc::channel(outbound_capacity);
        let metrics = ActorMetrics::new();
        let (handle, task) = ConnectionActor::spawn(
            PeerId::parse("peer-a").unwrap(),
            tx,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );
        (handle, task, rx, metrics)
    }

    #[allow(clippy::panic)]
    fn text(frame: OutboundFrame) -> String {
        match frame {
            OutboundFrame::Text(text) => text,
            OutboundFrame::Close { reason } => panic!("unexpected close: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_responses_are_encoded_in_order() {
        let (handle, _task, mut rx, _metrics) = spawn_connection(8);

        handle
            .respond(Response::success(1, &OkResponse::OK).unwrap())
            .await
            .unwrap();
        handle
            .respond(Response::error(2, ErrorCode::NotFoundError, "gone"))
            .await
            .unwrap();

        let first = decode_server_message(&text(rx.recv().await.unwrap())).unwrap();
        let first = first.as_response().unwrap();
        assert_eq!(first.id, 1);
        assert!(first.ok);

        let second = decode_server_message(&text(rx.recv().await.unwrap())).unwrap();
        let second = second.as_response().unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.error.as_ref().unwrap().code, ErrorCode::NotFoundError);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_notification_frames() {
        let (handle, _task, mut rx, _metrics) = spawn_connection(8);

        assert!(handle.notify(Notification::PeerLeft {
            peer_id: PeerId::parse("peer-b").unwrap(),
        }));

        let message = decode_server_message(&text(rx.recv().await.unwrap())).unwrap();
        let frame = message.as_notification().unwrap();
        assert_eq!(frame.method, "peerLeft");
        assert_eq!(frame.data["peerId"], "peer-b");

        handle.cancel();
    }

    #[tokio::test]
    async fn test_close_forwards_close_frame_and_stops() {
        let (handle, task, mut rx, metrics) = spawn_connection(8);

        handle.close("negotiation timeout");

        assert_eq!(
            rx.recv().await.unwrap(),
            OutboundFrame::Close {
                reason: "negotiation timeout".to_string()
            }
        );
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_cancelled());
        assert_eq!(metrics.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_disconnects_client() {
        // Writer never drains, so the actor blocks on its first frame and
        // the mailbox fills up behind it.
        let (handle, _task, _rx, _metrics) = spawn_connection(1);

        let peer_id = PeerId::parse("peer-b").unwrap();
        let mut queued = 0;
        for _ in 0..(CONNECTION_CHANNEL_BUFFER + 8) {
            if !handle.notify(Notification::PeerLeft {
                peer_id: peer_id.clone(),
            }) {
                break;
            }
            queued += 1;
        }

        assert!(queued <= CONNECTION_CHANNEL_BUFFER + 2);
        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("slow client should be disconnected");
    }

    #[tokio::test]
    async fn test_writer_gone_stops_actor() {
        let (handle, task, rx, _metrics) = spawn_connection(8);
        drop(rx);

        handle
            .respond(Response::success(1, &OkResponse::OK).unwrap())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_cancelled());
    }
}

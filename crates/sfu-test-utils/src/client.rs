//! WebSocket signaling client for end-to-end tests.
//!
//! Sends requests with increasing ids and matches responses by id.
//! Notifications that arrive while waiting for a response are buffered and
//! handed out by [`SignalingClient::next_notification`].

use crate::harness::NOTIFICATION_TIMEOUT;

use futures::{SinkExt, StreamExt};
use signaling_protocol::codec::{decode_server_message, encode_request};
use signaling_protocol::message::{JoinRequest, JoinResponse, NotificationFrame, RequestId};
use signaling_protocol::{ClientRequest, Request, Response, ServerMessage};
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Test client speaking the signaling protocol.
pub struct SignalingClient {
    socket: Socket,
    next_id: RequestId,
    notifications: VecDeque<NotificationFrame>,
}

impl SignalingClient {
    /// Open a signaling connection.
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;
        Ok(Self {
            socket,
            next_id: 1,
            notifications: VecDeque::new(),
        })
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), anyhow::Error> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send frame: {}", e))
    }

    /// Send a request and wait for its response.
    pub async fn request(&mut self, request: Request) -> Result<Response, anyhow::Error> {
        let id = self.next_id;
        self.next_id += 1;

        let text = encode_request(&ClientRequest { id, request })
            .map_err(|e| anyhow::anyhow!("Failed to encode request: {}", e))?;
        self.send_text(text).await?;
        self.response(id).await
    }

    /// Wait for the response with `id`, buffering notifications.
    pub async fn response(&mut self, id: RequestId) -> Result<Response, anyhow::Error> {
        loop {
            match self.next_message().await? {
                ServerMessage::Response(response) if response.id == id => return Ok(response),
                ServerMessage::Response(other) => {
                    return Err(anyhow::anyhow!(
                        "Expected response {}, got {:?}",
                        id,
                        other
                    ))
                }
                ServerMessage::Notification(frame) => self.notifications.push_back(frame),
            }
        }
    }

    pub async fn join(
        &mut self,
        room_id: &str,
        display_name: &str,
    ) -> Result<JoinResponse, anyhow::Error> {
        let response = self
            .request(Request::Join(JoinRequest {
                room_id: room_id.to_string(),
                display_name: display_name.to_string(),
            }))
            .await?;
        if !response.ok {
            return Err(anyhow::anyhow!("Join failed: {:?}", response.error));
        }
        response
            .data_as()
            .map_err(|e| anyhow::anyhow!("Invalid join response: {}", e))
    }

    /// Next notification, buffered or read from the socket.
    pub async fn next_notification(&mut self) -> Result<NotificationFrame, anyhow::Error> {
        if let Some(frame) = self.notifications.pop_front() {
            return Ok(frame);
        }
        match self.next_message().await? {
            ServerMessage::Notification(frame) => Ok(frame),
            ServerMessage::Response(response) => Err(anyhow::anyhow!(
                "Expected a notification, got response {:?}",
                response
            )),
        }
    }

    /// Next server message, skipping control frames.
    pub async fn next_message(&mut self) -> Result<ServerMessage, anyhow::Error> {
        loop {
            let frame = tokio::time::timeout(NOTIFICATION_TIMEOUT, self.socket.next())
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for a server message"))?;
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return decode_server_message(&text)
                        .map_err(|e| anyhow::anyhow!("Invalid server message: {}", e));
                }
                Some(Ok(Message::Close(frame))) => {
                    return Err(anyhow::anyhow!("Connection closed: {:?}", frame));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(anyhow::anyhow!("WebSocket error: {}", e)),
                None => return Err(anyhow::anyhow!("Connection closed")),
            }
        }
    }

    /// Wait for the server to close the connection; returns the close reason.
    pub async fn closed(&mut self) -> Result<String, anyhow::Error> {
        loop {
            let frame = tokio::time::timeout(NOTIFICATION_TIMEOUT, self.socket.next())
                .await
                .map_err(|_| anyhow::anyhow!("Timed out waiting for close"))?;
            match frame {
                Some(Ok(Message::Close(frame))) => {
                    return Ok(frame.map(|f| f.reason.into_owned()).unwrap_or_default());
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return Ok(String::new()),
            }
        }
    }

    /// Close the connection from the client side.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.socket
            .close(None)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to close: {}", e))
    }
}

//! Signaling request, response and notification messages.
//!
//! Requests: `{"id": 7, "method": "produce", "data": {...}}`
//!
//! Responses: `{"response": true, "id": 7, "ok": true, "data": {...}}` or
//! `{"response": true, "id": 7, "ok": false, "error": {"code": "...", "reason": "..."}}`
//!
//! Notifications: `{"notification": true, "method": "peerLeft", "data": {...}}`

use crate::rtp::{MediaKind, RtpCapabilities, RtpParameters};
use crate::transport::{DtlsParameters, TransportDirection};
use common::types::{ConsumerId, PeerId, ProducerId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlation token chosen by the client for each request.
pub type RequestId = u64;

/// A decoded client request with its correlation token.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub id: RequestId,
    pub request: Request,
}

/// All requests a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Join(JoinRequest),
    CreateTransport(CreateTransportRequest),
    ConnectTransport(ConnectTransportRequest),
    Produce(ProduceRequest),
    CloseProducer(CloseProducerRequest),
    Consume(ConsumeRequest),
    ResumeConsumer(ResumeConsumerRequest),
    CloseConsumer(CloseConsumerRequest),
    Leave,
}

impl Request {
    /// Wire name of the request method. Also used as a bounded metric label.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Request::Join(_) => methods::JOIN,
            Request::CreateTransport(_) => methods::CREATE_TRANSPORT,
            Request::ConnectTransport(_) => methods::CONNECT_TRANSPORT,
            Request::Produce(_) => methods::PRODUCE,
            Request::CloseProducer(_) => methods::CLOSE_PRODUCER,
            Request::Consume(_) => methods::CONSUME,
            Request::ResumeConsumer(_) => methods::RESUME_CONSUMER,
            Request::CloseConsumer(_) => methods::CLOSE_CONSUMER,
            Request::Leave => methods::LEAVE,
        }
    }
}

/// Wire method names.
pub mod methods {
    pub const JOIN: &str = "join";
    pub const CREATE_TRANSPORT: &str = "createTransport";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const PRODUCE: &str = "produce";
    pub const CLOSE_PRODUCER: &str = "closeProducer";
    pub const CONSUME: &str = "consume";
    pub const RESUME_CONSUMER: &str = "resumeConsumer";
    pub const CLOSE_CONSUMER: &str = "closeConsumer";
    pub const LEAVE: &str = "leave";

    pub const NEW_PRODUCER_AVAILABLE: &str = "newProducerAvailable";
    pub const PEER_JOINED: &str = "peerJoined";
    pub const PEER_LEFT: &str = "peerLeft";
    pub const CONSUMER_CLOSED: &str = "consumerClosed";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransportRequest {
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerRequest {
    pub producer_id: ProducerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub transport_id: TransportId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest {
    pub consumer_id: ConsumerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseConsumerRequest {
    pub consumer_id: ConsumerId,
}

/// Another member of the room, as listed in the join response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub display_name: String,
}

/// A producer available for consumption. Sent in the join response and as
/// the `newProducerAvailable` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub peer_id: PeerId,
    pub router_rtp_capabilities: RtpCapabilities,
    pub peers: Vec<PeerInfo>,
    pub existing_producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: ProducerId,
}

/// Body of responses that carry no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub const OK: OkResponse = OkResponse { ok: true };
}

/// Error codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Room id malformed or rejected.
    InvalidRoom,
    /// Referenced id unknown within the caller's own scope.
    NotFoundError,
    /// The media engine could not allocate the resource.
    ResourceError,
    /// Negotiation parameters incompatible with the router.
    NegotiationError,
    /// A media worker failed.
    FatalWorkerError,
    /// Request malformed, unknown or not valid in the current session state.
    InvalidRequest,
    /// Unexpected server-side failure.
    InternalError,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRoom => "InvalidRoom",
            ErrorCode::NotFoundError => "NotFoundError",
            ErrorCode::ResourceError => "ResourceError",
            ErrorCode::NegotiationError => "NegotiationError",
            ErrorCode::FatalWorkerError => "FatalWorkerError",
            ErrorCode::InvalidRequest => "InvalidRequest",
            ErrorCode::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub reason: String,
}

/// Response to exactly one client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub response: bool,
    pub id: RequestId,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Build a success response from a typed payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn success<T: Serialize>(id: RequestId, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            response: true,
            id,
            ok: true,
            data: Some(serde_json::to_value(data)?),
            error: None,
        })
    }

    /// Build an error response.
    #[must_use]
    pub fn error(id: RequestId, code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            response: true,
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code,
                reason: reason.into(),
            }),
        }
    }

    /// Decode the success payload into a typed response body.
    ///
    /// # Errors
    ///
    /// Returns an error if the response carries no data or it does not match `T`.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }
}

/// Server-initiated event. No response is expected.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    NewProducerAvailable(ProducerInfo),
    PeerJoined(PeerInfo),
    PeerLeft { peer_id: PeerId },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerLeftData<'a> {
    peer_id: &'a PeerId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerClosedData {
    consumer_id: ConsumerId,
    producer_id: ProducerId,
}

impl Notification {
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Notification::NewProducerAvailable(_) => methods::NEW_PRODUCER_AVAILABLE,
            Notification::PeerJoined(_) => methods::PEER_JOINED,
            Notification::PeerLeft { .. } => methods::PEER_LEFT,
            Notification::ConsumerClosed { .. } => methods::CONSUMER_CLOSED,
        }
    }

    /// Convert into the wire envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented as JSON.
    pub fn into_frame(self) -> Result<NotificationFrame, serde_json::Error> {
        let method = self.method();
        let data = match self {
            Notification::NewProducerAvailable(info) => serde_json::to_value(info)?,
            Notification::PeerJoined(info) => serde_json::to_value(info)?,
            Notification::PeerLeft { peer_id } => {
                serde_json::to_value(PeerLeftData { peer_id: &peer_id })?
            }
            Notification::ConsumerClosed {
                consumer_id,
                producer_id,
            } => serde_json::to_value(ConsumerClosedData {
                consumer_id,
                producer_id,
            })?,
        };

        Ok(NotificationFrame {
            notification: true,
            method: method.to_string(),
            data,
        })
    }
}

/// Wire envelope of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationFrame {
    pub notification: bool,
    pub method: String,
    pub data: Value,
}

/// Any message the server writes to a signaling connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Notification(NotificationFrame),
}

impl From<Response> for ServerMessage {
    fn from(response: Response) -> Self {
        ServerMessage::Response(response)
    }
}

impl From<NotificationFrame> for ServerMessage {
    fn from(frame: NotificationFrame) -> Self {
        ServerMessage::Notification(frame)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_response_shape() {
        let response = Response::error(9, ErrorCode::NotFoundError, "transport not found");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({
                "response": true,
                "id": 9,
                "ok": false,
                "error": {"code": "NotFoundError", "reason": "transport not found"}
            })
        );
    }

    #[test]
    fn test_success_response_shape() {
        let response = Response::success(3, &OkResponse::OK).unwrap();
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            json!({"response": true, "id": 3, "ok": true, "data": {"ok": true}})
        );
    }

    #[test]
    fn test_peer_left_notification_frame() {
        let peer_id = PeerId::parse("alice").unwrap();
        let frame = Notification::PeerLeft { peer_id }.into_frame().unwrap();
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"notification": true, "method": "peerLeft", "data": {"peerId": "alice"}})
        );
    }

    #[test]
    fn test_server_message_untagged_distinguishes_kinds() {
        let response: ServerMessage =
            serde_json::from_value(json!({"response": true, "id": 1, "ok": true, "data": {}}))
                .unwrap();
        assert!(matches!(response, ServerMessage::Response(_)));

        let notification: ServerMessage = serde_json::from_value(
            json!({"notification": true, "method": "peerLeft", "data": {"peerId": "x"}}),
        )
        .unwrap();
        assert!(matches!(notification, ServerMessage::Notification(_)));
    }

    #[test]
    fn test_error_code_strings_match_serde() {
        for code in [
            ErrorCode::InvalidRoom,
            ErrorCode::NotFoundError,
            ErrorCode::ResourceError,
            ErrorCode::NegotiationError,
            ErrorCode::FatalWorkerError,
            ErrorCode::InvalidRequest,
            ErrorCode::InternalError,
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(code.as_str()));
        }
    }
}

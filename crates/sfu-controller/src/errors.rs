//! SFU Controller error types.
//!
//! Error types map to signaling `ErrorCode` values for client responses.
//! Internal details are logged server-side but not exposed to clients.

use crate::media::EngineError;
use common::types::{ConsumerId, ProducerId, TransportId, WorkerId};
use signaling_protocol::ErrorCode;
use thiserror::Error;

/// SFU Controller error type.
///
/// Maps to signaling `ErrorCode` values:
/// - `InvalidRoom`: `InvalidRoom`
/// - `TransportNotFound`, `ProducerNotFound`, `ConsumerNotFound`: `NotFoundError`
/// - `PeerNotFound`, `RoomClosed`, `RoomFull`, `TooManyRooms`, `Draining`,
///   `Resource`: `ResourceError`
/// - `Negotiation`: `NegotiationError`
/// - `FatalWorker`: `FatalWorkerError`
/// - `InvalidRequest`: `InvalidRequest`
/// - `Config`, `Internal`: `InternalError`
#[derive(Debug, Clone, Error)]
pub enum SfuError {
    /// Room id malformed or rejected.
    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    /// Request not valid in the current session state.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Transport id not owned by the calling peer.
    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    /// Producer id not known in the caller's scope.
    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    /// Consumer id not owned by the calling peer.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// Peer is no longer a member of the room (e.g. raced with disconnect).
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Room was torn down while the request was queued.
    #[error("Room closed: {0}")]
    RoomClosed(String),

    /// Room reached its peer limit.
    #[error("Room is full: {0}")]
    RoomFull(String),

    /// Server reached its room limit.
    #[error("Room limit reached")]
    TooManyRooms,

    /// Registry is shutting down.
    #[error("SFU is draining")]
    Draining,

    /// Media engine could not allocate a resource.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Negotiation parameters incompatible with the router.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// A media worker died. Not recoverable in-process.
    #[error("Worker {worker_id} failed: {reason}")]
    FatalWorker { worker_id: WorkerId, reason: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling `ErrorCode` for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SfuError::InvalidRoom(_) => ErrorCode::InvalidRoom,
            SfuError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            SfuError::TransportNotFound(_)
            | SfuError::ProducerNotFound(_)
            | SfuError::ConsumerNotFound(_) => ErrorCode::NotFoundError,
            SfuError::PeerNotFound(_)
            | SfuError::RoomClosed(_)
            | SfuError::RoomFull(_)
            | SfuError::TooManyRooms
            | SfuError::Draining
            | SfuError::Resource(_) => ErrorCode::ResourceError,
            SfuError::Negotiation(_) => ErrorCode::NegotiationError,
            SfuError::FatalWorker { .. } => ErrorCode::FatalWorkerError,
            SfuError::Config(_) | SfuError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Returns a bounded label string for the error variant (for metrics).
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SfuError::InvalidRoom(_) => "invalid_room",
            SfuError::InvalidRequest(_) => "invalid_request",
            SfuError::TransportNotFound(_) => "transport_not_found",
            SfuError::ProducerNotFound(_) => "producer_not_found",
            SfuError::ConsumerNotFound(_) => "consumer_not_found",
            SfuError::PeerNotFound(_) => "peer_not_found",
            SfuError::RoomClosed(_) => "room_closed",
            SfuError::RoomFull(_) => "room_full",
            SfuError::TooManyRooms => "too_many_rooms",
            SfuError::Draining => "draining",
            SfuError::Resource(_) => "resource",
            SfuError::Negotiation(_) => "negotiation",
            SfuError::FatalWorker { .. } => "fatal_worker",
            SfuError::Config(_) => "config",
            SfuError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Config(_) | SfuError::Internal(_) => "An internal error occurred".to_string(),
            SfuError::FatalWorker { .. } => "Media worker failed".to_string(),
            SfuError::PeerNotFound(_) => "Peer is no longer in the room".to_string(),
            SfuError::RoomClosed(_) => "Room was closed".to_string(),
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::InvalidRoom(msg)
            | SfuError::InvalidRequest(msg)
            | SfuError::Resource(msg)
            | SfuError::Negotiation(msg) => msg.clone(),
            SfuError::TransportNotFound(_)
            | SfuError::ProducerNotFound(_)
            | SfuError::ConsumerNotFound(_)
            | SfuError::RoomFull(_)
            | SfuError::TooManyRooms => self.to_string(),
        }
    }
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Negotiation(msg) => SfuError::Negotiation(msg),
            EngineError::Resource(msg) => SfuError::Resource(msg),
            EngineError::UnknownTransport(id) => SfuError::TransportNotFound(id),
            EngineError::UnknownProducer(id) => SfuError::ProducerNotFound(id),
            EngineError::UnknownConsumer(id) => SfuError::ConsumerNotFound(id),
            EngineError::UnknownRouter(id) => SfuError::Resource(format!("router {id} is gone")),
            EngineError::WorkerClosed(id) => SfuError::Resource(format!("{id} is not available")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::RouterId;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            SfuError::InvalidRoom("empty".to_string()).error_code(),
            ErrorCode::InvalidRoom
        );
        assert_eq!(
            SfuError::TransportNotFound(TransportId::new()).error_code(),
            ErrorCode::NotFoundError
        );
        assert_eq!(
            SfuError::ProducerNotFound(ProducerId::new()).error_code(),
            ErrorCode::NotFoundError
        );
        assert_eq!(
            SfuError::PeerNotFound("p".to_string()).error_code(),
            ErrorCode::ResourceError
        );
        assert_eq!(SfuError::TooManyRooms.error_code(), ErrorCode::ResourceError);
        assert_eq!(
            SfuError::Negotiation("codec".to_string()).error_code(),
            ErrorCode::NegotiationError
        );
        assert_eq!(
            SfuError::FatalWorker {
                worker_id: WorkerId(0),
                reason: "crashed".to_string()
            }
            .error_code(),
            ErrorCode::FatalWorkerError
        );
        assert_eq!(
            SfuError::Internal("channel".to_string()).error_code(),
            ErrorCode::InternalError
        );
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let err = SfuError::Internal("channel send failed: receiver dropped".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = SfuError::Config("SFU_RTC_MIN_PORT".to_string());
        assert!(!err.client_message().contains("SFU_RTC_MIN_PORT"));
    }

    #[test]
    fn test_client_message_keeps_negotiation_reason() {
        let err = SfuError::Negotiation("unsupported codec video/H265".to_string());
        assert_eq!(err.client_message(), "unsupported codec video/H265");
    }

    #[test]
    fn test_engine_error_conversion() {
        let id = TransportId::new();
        assert!(matches!(
            SfuError::from(EngineError::UnknownTransport(id)),
            SfuError::TransportNotFound(t) if t == id
        ));
        assert!(matches!(
            SfuError::from(EngineError::UnknownRouter(RouterId::new())),
            SfuError::Resource(_)
        ));
        assert_eq!(
            SfuError::from(EngineError::WorkerClosed(WorkerId(1))).error_code(),
            ErrorCode::ResourceError
        );
    }

    #[test]
    fn test_error_type_labels_are_bounded() {
        assert_eq!(SfuError::Draining.error_type_label(), "draining");
        assert_eq!(
            SfuError::RoomClosed("R1".to_string()).error_type_label(),
            "room_closed"
        );
    }
}

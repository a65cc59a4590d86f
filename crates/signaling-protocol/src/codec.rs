//! JSON codec for signaling frames.
//!
//! Decoding is two-staged: the envelope (`id`, `method`, `data`) is parsed
//! first so that a request with a readable id always gets a correlated error
//! response, even when its payload is malformed or its method is unknown.

use crate::message::{
    methods, ClientRequest, NotificationFrame, Request, RequestId, Response, ServerMessage,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Default maximum size of a single signaling frame (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame exceeds the configured size limit
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    /// Frame is not a request envelope; no id could be read
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Method name is not recognized
    #[error("Unknown method: {method}")]
    UnknownMethod { id: RequestId, method: String },

    /// Payload does not match the method's schema
    #[error("Invalid {method} payload: {reason}")]
    InvalidPayload {
        id: RequestId,
        method: String,
        reason: String,
    },

    /// Outbound message could not be serialized
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl CodecError {
    /// Correlation token of the offending request, if one could be read.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            CodecError::UnknownMethod { id, .. } | CodecError::InvalidPayload { id, .. } => {
                Some(*id)
            }
            CodecError::TooLarge { .. }
            | CodecError::Malformed(_)
            | CodecError::Serialization(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct RawRequest {
    id: RequestId,
    method: String,
    #[serde(default)]
    data: Value,
}

fn payload<T: DeserializeOwned>(id: RequestId, method: &str, data: Value) -> Result<T, CodecError> {
    serde_json::from_value(data).map_err(|e| CodecError::InvalidPayload {
        id,
        method: method.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a client request frame.
///
/// # Errors
///
/// Returns an error if the frame is too large, is not a request envelope, names
/// an unknown method, or carries a payload that does not match the method.
pub fn decode_request(text: &str, max_size: usize) -> Result<ClientRequest, CodecError> {
    if text.len() > max_size {
        return Err(CodecError::TooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let raw: RawRequest =
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let RawRequest { id, method, data } = raw;

    let request = match method.as_str() {
        methods::JOIN => Request::Join(payload(id, &method, data)?),
        methods::CREATE_TRANSPORT => Request::CreateTransport(payload(id, &method, data)?),
        methods::CONNECT_TRANSPORT => Request::ConnectTransport(payload(id, &method, data)?),
        methods::PRODUCE => Request::Produce(payload(id, &method, data)?),
        methods::CLOSE_PRODUCER => Request::CloseProducer(payload(id, &method, data)?),
        methods::CONSUME => Request::Consume(payload(id, &method, data)?),
        methods::RESUME_CONSUMER => Request::ResumeConsumer(payload(id, &method, data)?),
        methods::CLOSE_CONSUMER => Request::CloseConsumer(payload(id, &method, data)?),
        methods::LEAVE => Request::Leave,
        _ => return Err(CodecError::UnknownMethod { id, method }),
    };

    Ok(ClientRequest { id, request })
}

/// Encode a client request frame. Used by clients and test harnesses.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode_request(request: &ClientRequest) -> Result<String, CodecError> {
    let to_value = |v: Result<Value, serde_json::Error>| {
        v.map_err(|e| CodecError::Serialization(e.to_string()))
    };

    let data = match &request.request {
        Request::Join(r) => to_value(serde_json::to_value(r))?,
        Request::CreateTransport(r) => to_value(serde_json::to_value(r))?,
        Request::ConnectTransport(r) => to_value(serde_json::to_value(r))?,
        Request::Produce(r) => to_value(serde_json::to_value(r))?,
        Request::CloseProducer(r) => to_value(serde_json::to_value(r))?,
        Request::Consume(r) => to_value(serde_json::to_value(r))?,
        Request::ResumeConsumer(r) => to_value(serde_json::to_value(r))?,
        Request::CloseConsumer(r) => to_value(serde_json::to_value(r))?,
        Request::Leave => Value::Object(serde_json::Map::new()),
    };

    let envelope = serde_json::json!({
        "id": request.id,
        "method": request.request.method(),
        "data": data,
    });

    Ok(envelope.to_string())
}

/// Encode a server message (response or notification).
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server_message(message: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decode a server message. Used by clients and test harnesses.
///
/// # Errors
///
/// Returns an error if the text is neither a response nor a notification.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}

impl ServerMessage {
    /// Borrow the response, if this message is one.
    #[must_use]
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            ServerMessage::Response(r) => Some(r),
            ServerMessage::Notification(_) => None,
        }
    }

    /// Borrow the notification, if this message is one.
    #[must_use]
    pub fn as_notification(&self) -> Option<&NotificationFrame> {
        match self {
            ServerMessage::Notification(n) => Some(n),
            ServerMessage::Response(_) => None,
        }
    }
}

//! Signaling protocol for the SFU control plane.
//!
//! This crate defines the JSON messages exchanged over a signaling
//! WebSocket: requests correlated by an id, exactly one response per request,
//! and server-initiated notifications. It also carries the RTP, ICE and DTLS
//! parameter types negotiated through those messages.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod codec;
pub mod message;
pub mod rtp;
pub mod transport;

pub use codec::{decode_request, encode_server_message, CodecError, DEFAULT_MAX_FRAME_SIZE};
pub use message::{ClientRequest, ErrorCode, Notification, Request, Response, ServerMessage};

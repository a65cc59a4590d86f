//! Client signaling over WebSocket.
//!
//! - [`ws`] - Axum route, socket reader/writer tasks, join timeout
//! - [`session`] - Request dispatch and per-connection room membership

pub mod session;
pub mod ws;

pub use session::SignalingSession;
pub use ws::{signaling_router, SignalingState};

//! Actor model for the SFU control plane.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per active room)
//!         ├── owns one router and every peer's transports, producers, consumers
//!         └── notifies peers through their ConnectionActors
//!
//! ConnectionActor (one per signaling WebSocket)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One writer per room**: Room state is only mutated inside its actor
//! - **Engine calls off the loop**: Results come back as mailbox messages
//! - **CancellationToken propagation**: The registry hands rooms child tokens
//! - **Mailbox monitoring**: Depth thresholds with metrics (Room: 100/500, Connection: 32/128)
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistryActor` that creates and removes rooms
//! - [`room`] - `RoomActor` per active room
//! - [`peer`] - Per-peer resource bookkeeping owned by a room
//! - [`connection`] - `ConnectionActor` per signaling connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod room;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle, OutboundFrame};
pub use messages::*;
pub use metrics::{ActorMetrics, MailboxMonitor};
pub use peer::Peer;
pub use registry::{RegistrySettings, RoomRegistryHandle};
pub use room::{RoomActor, RoomActorHandle, RoomSettings};

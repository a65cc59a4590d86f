//! SFU Controller Library
//!
//! Control plane of a selective forwarding unit. It accepts WebSocket
//! signaling connections, groups peers into rooms, drives a pool of media
//! engine workers, and negotiates the transports, producers and consumers
//! that carry audio and video between participants.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool (fixed set of MediaWorkers, round-robin)
//! └── RouterAllocator (one router per room)
//!
//! RoomRegistryActor (singleton)
//! └── supervises N RoomActors
//!     └── RoomActor (one per active room)
//!         ├── owns peers, transports, producers, consumers
//!         └── notifies peers through ConnectionActors
//!
//! WebSocket connection
//! ├── SignalingSession (request -> room operation -> one response)
//! └── ConnectionActor (outbound responses and notifications)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry, room and connection actors
//! - [`media`] - Media engine abstraction, worker pool and router allocation
//! - [`signaling`] - WebSocket endpoint and per-connection request handling
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types mapped to signaling error codes

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod signaling;

//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU Controller.
//!
//! This crate provides a controllable media worker, signaling fixtures and a
//! server harness so control-plane behavior can be tested without a real
//! media engine.
//!
//! ## Modules
//!
//! - `mock_worker` - `MediaWorker` with failure injection, call delays and a kill switch
//! - `fixtures` - RTP parameters, receiver capabilities and DTLS parameters
//! - `harness` - In-process registry over mock workers, optionally served over WebSocket
//! - `client` - WebSocket signaling client for end-to-end tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let sfu = TestSfu::builder().workers(1).build();
//!     let server = sfu.serve().await.unwrap();
//!
//!     let mut alice = SignalingClient::connect(&server.ws_url("alice")).await.unwrap();
//!     let joined = alice.join("R1", "Alice").await.unwrap();
//!     assert!(joined.peers.is_empty());
//! }
//! ```
//!
//! ## Failure Injection
//!
//! ```rust,ignore
//! let worker = MockWorker::builder().failing_produce().build();
//! let sfu = TestSfu::builder().with_worker(worker.clone()).build();
//!
//! // produce now answers ResourceError
//! worker.kill(); // pool reports a fatal failure
//! ```

pub mod client;
pub mod fixtures;
pub mod harness;
pub mod mock_worker;

pub use client::SignalingClient;
pub use fixtures::*;
pub use harness::{expect_data, TestPeer, TestServer, TestSfu, TestSfuBuilder};
pub use mock_worker::{MockWorker, MockWorkerBuilder};

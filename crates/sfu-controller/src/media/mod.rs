//! Media engine abstraction.
//!
//! The control plane never touches RTP packets. It drives a set of media
//! workers through the [`MediaWorker`] trait:
//!
//! - [`WorkerPool`] owns the fixed set of workers and hands them out
//!   round-robin. A dead worker is a fatal, process-level failure.
//! - [`RouterAllocator`] creates one router per room on the next worker.
//! - [`LocalWorker`] is the in-process engine used by the binary.
//! - [`negotiation`] holds the RTP/DTLS parameter checks shared by engines.

pub mod local;
pub mod negotiation;
pub mod pool;
pub mod router;
pub mod worker;

pub use local::{LocalWorker, WorkerSettings};
pub use pool::WorkerPool;
pub use router::{RouterAllocator, RouterHandle};
pub use worker::{MediaWorker, RouterInfo, WorkerExit};

use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use thiserror::Error;

/// Errors reported by a media worker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Parameters are incompatible with the router or the remote endpoint.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The worker could not allocate a resource (ports, memory).
    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("unknown router {0}")]
    UnknownRouter(RouterId),

    #[error("unknown transport {0}")]
    UnknownTransport(TransportId),

    #[error("unknown producer {0}")]
    UnknownProducer(ProducerId),

    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),

    /// The worker stopped and no longer accepts commands.
    #[error("{0} is closed")]
    WorkerClosed(WorkerId),
}

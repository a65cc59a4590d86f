//! The `MediaWorker` trait - the seam between the control plane and a
//! media engine process.

use super::EngineError;
use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use signaling_protocol::rtp::{MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters};
use signaling_protocol::transport::{
    ConsumerInfo, DtlsParameters, TransportDirection, TransportInfo,
};
use std::fmt;

/// A router created on a worker.
#[derive(Debug, Clone)]
pub struct RouterInfo {
    pub router_id: RouterId,
    pub rtp_capabilities: RtpCapabilities,
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub reason: String,
    /// `true` when the worker was stopped through [`MediaWorker::close`].
    pub graceful: bool,
}

/// A media engine worker.
///
/// Every resource is addressed by its router so a worker can host many
/// rooms. Close operations are idempotent and infallible: closing something
/// that is already gone is a no-op. Closing a transport closes its producers
/// and consumers; closing a producer closes every consumer of it.
#[async_trait]
pub trait MediaWorker: Send + Sync + fmt::Debug {
    fn id(&self) -> WorkerId;

    async fn create_router(&self, codecs: &[RtpCodecCapability])
        -> Result<RouterInfo, EngineError>;

    async fn close_router(&self, router_id: RouterId);

    async fn create_webrtc_transport(
        &self,
        router_id: RouterId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError>;

    async fn connect_transport(
        &self,
        router_id: RouterId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        router_id: RouterId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    /// Create a consumer. Consumers start paused.
    async fn consume(
        &self,
        router_id: RouterId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError>;

    async fn resume_consumer(
        &self,
        router_id: RouterId,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError>;

    async fn close_transport(&self, router_id: RouterId, transport_id: TransportId);

    async fn close_producer(&self, router_id: RouterId, producer_id: ProducerId);

    async fn close_consumer(&self, router_id: RouterId, consumer_id: ConsumerId);

    /// Stop the worker.
    async fn close(&self);

    /// Resolves once the worker has stopped, for whatever reason.
    async fn closed(&self) -> WorkerExit;
}

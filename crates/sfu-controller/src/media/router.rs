//! `RouterAllocator` - creates the single router backing each room.

use super::pool::WorkerPool;
use super::worker::MediaWorker;
use super::EngineError;
use crate::errors::SfuError;
use crate::observability::metrics;

use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use signaling_protocol::rtp::{MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters};
use signaling_protocol::transport::{
    ConsumerInfo, DtlsParameters, TransportDirection, TransportInfo,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Allocates routers on the worker pool.
#[derive(Clone)]
pub struct RouterAllocator {
    pool: Arc<WorkerPool>,
    media_codecs: Arc<Vec<RtpCodecCapability>>,
    live_routers: Arc<AtomicUsize>,
}

impl RouterAllocator {
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>, media_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            pool,
            media_codecs: Arc::new(media_codecs),
            live_routers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a router on the next worker.
    pub async fn create_router(&self) -> Result<RouterHandle, SfuError> {
        let worker = self.pool.acquire_worker()?;
        let info = worker
            .create_router(&self.media_codecs)
            .await
            .map_err(|e| engine_failure(&self.pool, e))?;

        let live = self.live_routers.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_routers_active(live);

        debug!(
            target: "sfu.media.pool",
            worker_id = %worker.id(),
            router_id = %info.router_id,
            live_routers = live,
            "Router allocated"
        );

        Ok(RouterHandle {
            router_id: info.router_id,
            worker,
            pool: Arc::clone(&self.pool),
            rtp_capabilities: Arc::new(info.rtp_capabilities),
            live_routers: Arc::clone(&self.live_routers),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Routers created and not yet closed.
    #[must_use]
    pub fn live_routers(&self) -> usize {
        self.live_routers.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

/// Convert an engine error. A closed worker is reported as the pool's fatal
/// failure once the pool has recorded one.
fn engine_failure(pool: &WorkerPool, error: EngineError) -> SfuError {
    if matches!(error, EngineError::WorkerClosed(_)) {
        if let Some(fatal) = pool.failure() {
            return fatal;
        }
    }
    SfuError::from(error)
}

/// A router on a specific worker.
#[derive(Clone)]
pub struct RouterHandle {
    router_id: RouterId,
    worker: Arc<dyn MediaWorker>,
    pool: Arc<WorkerPool>,
    rtp_capabilities: Arc<RtpCapabilities>,
    live_routers: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterHandle")
            .field("router_id", &self.router_id)
            .field("worker_id", &self.worker.id())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RouterHandle {
    #[must_use]
    pub fn router_id(&self) -> RouterId {
        self.router_id
    }

    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker.id()
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    /// Map an error from one of this router's engine calls.
    #[must_use]
    pub fn error(&self, error: EngineError) -> SfuError {
        engine_failure(&self.pool, error)
    }

    pub async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError> {
        self.worker
            .create_webrtc_transport(self.router_id, direction)
            .await
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.worker
            .connect_transport(self.router_id, transport_id, dtls_parameters)
            .await
    }

    pub async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        self.worker
            .produce(self.router_id, transport_id, kind, rtp_parameters)
            .await
    }

    pub async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError> {
        self.worker
            .consume(self.router_id, transport_id, producer_id, rtp_capabilities)
            .await
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        self.worker
            .resume_consumer(self.router_id, consumer_id)
            .await
    }

    pub async fn close_transport(&self, transport_id: TransportId) {
        self.worker
            .close_transport(self.router_id, transport_id)
            .await;
    }

    pub async fn close_producer(&self, producer_id: ProducerId) {
        self.worker.close_producer(self.router_id, producer_id).await;
    }

    pub async fn close_consumer(&self, consumer_id: ConsumerId) {
        self.worker.close_consumer(self.router_id, consumer_id).await;
    }

    /// Close the router. Only the first call reaches the worker.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.worker.close_router(self.router_id).await;
        let live = self
            .live_routers
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        metrics::set_routers_active(live);
    }
}

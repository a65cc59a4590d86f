//! Mock media worker for control-plane testing.
//!
//! Wraps an in-process [`LocalWorker`] so negotiation and close cascades
//! behave like production, and adds knobs the real worker does not have:
//! - Fail router, transport or producer creation with a resource error
//! - Delay engine calls (useful with paused time)
//! - Kill the worker, which resolves `closed()` as an ungraceful exit
//! - Count routers created and closed
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockWorker;
//!
//! let worker = MockWorker::builder()
//!     .id(3)
//!     .router_delay(Duration::from_millis(50))
//!     .build();
//!
//! worker.set_fail_create_transport(true);
//! worker.kill();
//! ```

use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use sfu_controller::media::{EngineError, LocalWorker, MediaWorker, RouterInfo, WorkerExit, WorkerSettings};
use signaling_protocol::rtp::{MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters};
use signaling_protocol::transport::{
    ConsumerInfo, DtlsParameters, TransportDirection, TransportInfo,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reason reported by a killed worker.
pub const KILLED_REASON: &str = "worker killed";

/// Mock media worker.
#[derive(Debug)]
pub struct MockWorker {
    id: WorkerId,
    inner: LocalWorker,
    killed: CancellationToken,
    router_delay: Duration,
    call_delay: Duration,
    fail_create_router: AtomicBool,
    fail_create_transport: AtomicBool,
    fail_produce: AtomicBool,
    routers_created: AtomicUsize,
    routers_closed: AtomicUsize,
    producers_closed: AtomicUsize,
}

impl MockWorker {
    /// Create a new MockWorker builder.
    #[must_use]
    pub fn builder() -> MockWorkerBuilder {
        MockWorkerBuilder::default()
    }

    /// Stop answering and report an ungraceful exit to `closed()` waiters.
    pub fn kill(&self) {
        self.killed.cancel();
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.killed.is_cancelled()
    }

    pub fn set_fail_create_router(&self, fail: bool) {
        self.fail_create_router.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_create_transport(&self, fail: bool) {
        self.fail_create_transport.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_produce(&self, fail: bool) {
        self.fail_produce.store(fail, Ordering::SeqCst);
    }

    /// Routers successfully created on this worker.
    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::SeqCst)
    }

    /// `close_router` calls received.
    #[must_use]
    pub fn routers_closed(&self) -> usize {
        self.routers_closed.load(Ordering::SeqCst)
    }

    /// `close_producer` calls received.
    #[must_use]
    pub fn producers_closed(&self) -> usize {
        self.producers_closed.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<(), EngineError> {
        if self.killed.is_cancelled() {
            return Err(EngineError::WorkerClosed(self.id));
        }
        Ok(())
    }

    async fn delay(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn injected(flag: &AtomicBool, what: &str) -> Result<(), EngineError> {
        if flag.load(Ordering::SeqCst) {
            return Err(EngineError::Resource(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaWorker for MockWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError> {
        self.delay(self.router_delay).await;
        self.check_alive()?;
        Self::injected(&self.fail_create_router, "router")?;
        let info = self.inner.create_router(codecs).await?;
        self.routers_created.fetch_add(1, Ordering::SeqCst);
        Ok(info)
    }

    async fn close_router(&self, router_id: RouterId) {
        self.routers_closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close_router(router_id).await;
    }

    async fn create_webrtc_transport(
        &self,
        router_id: RouterId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError> {
        self.delay(self.call_delay).await;
        self.check_alive()?;
        Self::injected(&self.fail_create_transport, "transport")?;
        self.inner.create_webrtc_transport(router_id, direction).await
    }

    async fn connect_transport(
        &self,
        router_id: RouterId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.delay(self.call_delay).await;
        self.check_alive()?;
        self.inner
            .connect_transport(router_id, transport_id, dtls_parameters)
            .await
    }

    async fn produce(
        &self,
        router_id: RouterId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        self.delay(self.call_delay).await;
        self.check_alive()?;
        Self::injected(&self.fail_produce, "producer")?;
        self.inner
            .produce(router_id, transport_id, kind, rtp_parameters)
            .await
    }

    async fn consume(
        &self,
        router_id: RouterId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError> {
        self.delay(self.call_delay).await;
        self.check_alive()?;
        self.inner
            .consume(router_id, transport_id, producer_id, rtp_capabilities)
            .await
    }

    async fn resume_consumer(
        &self,
        router_id: RouterId,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError> {
        self.check_alive()?;
        self.inner.resume_consumer(router_id, consumer_id).await
    }

    async fn close_transport(&self, router_id: RouterId, transport_id: TransportId) {
        self.inner.close_transport(router_id, transport_id).await;
    }

    async fn close_producer(&self, router_id: RouterId, producer_id: ProducerId) {
        self.producers_closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close_producer(router_id, producer_id).await;
    }

    async fn close_consumer(&self, router_id: RouterId, consumer_id: ConsumerId) {
        self.inner.close_consumer(router_id, consumer_id).await;
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    async fn closed(&self) -> WorkerExit {
        tokio::select! {
            exit = self.inner.closed() => exit,
            () = self.killed.cancelled() => WorkerExit {
                reason: KILLED_REASON.to_string(),
                graceful: false,
            },
        }
    }
}

/// Builder for [`MockWorker`].
#[derive(Debug)]
pub struct MockWorkerBuilder {
    id: u32,
    min_port: u16,
    max_port: u16,
    router_delay: Duration,
    call_delay: Duration,
    fail_create_router: bool,
    fail_create_transport: bool,
    fail_produce: bool,
}

impl Default for MockWorkerBuilder {
    fn default() -> Self {
        Self {
            id: 0,
            min_port: 45000,
            max_port: 45999,
            router_delay: Duration::ZERO,
            call_delay: Duration::ZERO,
            fail_create_router: false,
            fail_create_transport: false,
            fail_produce: false,
        }
    }
}

impl MockWorkerBuilder {
    #[must_use]
    pub fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    /// Port range used for ICE candidates.
    #[must_use]
    pub fn ports(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Delay every `create_router` call.
    #[must_use]
    pub fn router_delay(mut self, delay: Duration) -> Self {
        self.router_delay = delay;
        self
    }

    /// Delay transport, produce and consume calls.
    #[must_use]
    pub fn call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    #[must_use]
    pub fn failing_create_router(mut self) -> Self {
        self.fail_create_router = true;
        self
    }

    #[must_use]
    pub fn failing_create_transport(mut self) -> Self {
        self.fail_create_transport = true;
        self
    }

    #[must_use]
    pub fn failing_produce(mut self) -> Self {
        self.fail_produce = true;
        self
    }

    /// Spawn the underlying worker. Must run inside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> Arc<MockWorker> {
        let id = WorkerId(self.id);
        let settings = WorkerSettings {
            listen_ip: "127.0.0.1".parse().unwrap(),
            announced_ip: "127.0.0.1".to_string(),
            min_port: self.min_port,
            max_port: self.max_port,
        };

        Arc::new(MockWorker {
            id,
            inner: LocalWorker::spawn(id, settings, CancellationToken::new()),
            killed: CancellationToken::new(),
            router_delay: self.router_delay,
            call_delay: self.call_delay,
            fail_create_router: AtomicBool::new(self.fail_create_router),
            fail_create_transport: AtomicBool::new(self.fail_create_transport),
            fail_produce: AtomicBool::new(self.fail_produce),
            routers_created: AtomicUsize::new(0),
            routers_closed: AtomicUsize::new(0),
            producers_closed: AtomicUsize::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfu_controller::config::default_media_codecs;

    #[tokio::test]
    async fn test_router_counters() {
        let worker = MockWorker::builder().build();
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        assert_eq!(worker.routers_created(), 1);

        worker.close_router(router.router_id).await;
        assert_eq!(worker.routers_closed(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_is_resource_error() {
        let worker = MockWorker::builder().failing_create_router().build();
        let result = worker.create_router(&default_media_codecs()).await;
        assert!(matches!(result, Err(EngineError::Resource(_))));
        assert_eq!(worker.routers_created(), 0);

        worker.set_fail_create_router(false);
        assert!(worker.create_router(&default_media_codecs()).await.is_ok());
    }

    #[tokio::test]
    async fn test_kill_resolves_closed_ungracefully() {
        let worker = MockWorker::builder().id(7).build();
        worker.kill();

        let exit = worker.closed().await;
        assert!(!exit.graceful);
        assert_eq!(exit.reason, KILLED_REASON);

        let result = worker.create_router(&default_media_codecs()).await;
        assert_eq!(result.unwrap_err(), EngineError::WorkerClosed(WorkerId(7)));
    }

    #[tokio::test]
    async fn test_close_is_graceful() {
        let worker = MockWorker::builder().build();
        worker.close().await;
        assert!(worker.closed().await.graceful);
    }
}

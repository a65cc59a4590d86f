//! `LocalWorker` - in-process media engine worker.
//!
//! Each worker is an actor owning its routers and the transports, producers
//! and consumers inside them. It performs the full control-plane negotiation
//! (ICE credentials, host candidates on a per-worker port slice, DTLS
//! fingerprint checks, RTP capability matching) and tracks resource
//! lifetimes, including close cascades.
//!
//! A supervisor task watches the actor; when it ends (graceful close or
//! panic) the exit is published to everyone awaiting [`MediaWorker::closed`].

use super::negotiation::{
    can_consume, certificate_fingerprint, consumer_parameters, router_capabilities,
    validate_dtls_parameters, validate_producer_parameters,
};
use super::worker::{MediaWorker, RouterInfo, WorkerExit};
use super::EngineError;

use async_trait::async_trait;
use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use signaling_protocol::rtp::{MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters};
use signaling_protocol::transport::{
    ConsumerInfo, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceCandidateType,
    IceParameters, IceProtocol, IceTcpType, TransportDirection, TransportInfo,
};
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the worker mailbox.
const WORKER_CHANNEL_BUFFER: usize = 1000;

const UDP_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const TCP_CANDIDATE_PRIORITY: u32 = 1_076_302_078;

/// Network settings of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub listen_ip: IpAddr,
    pub announced_ip: String,
    /// Inclusive port range reserved for this worker.
    pub min_port: u16,
    pub max_port: u16,
}

impl WorkerSettings {
    /// Split the port range into `count` contiguous, non-overlapping slices.
    ///
    /// Returns fewer slices than requested when the range has fewer ports
    /// than `count`.
    #[must_use]
    pub fn partition(&self, count: usize) -> Vec<WorkerSettings> {
        let total = usize::from(self.max_port.saturating_sub(self.min_port)) + 1;
        let count = count.min(total).max(1);
        let base = total / count;
        let extra = total % count;

        let mut slices = Vec::with_capacity(count);
        let mut start = usize::from(self.min_port);
        for index in 0..count {
            let len = base + usize::from(index < extra);
            let end = start + len - 1;
            let (Ok(min_port), Ok(max_port)) = (u16::try_from(start), u16::try_from(end)) else {
                break;
            };
            slices.push(WorkerSettings {
                listen_ip: self.listen_ip,
                announced_ip: self.announced_ip.clone(),
                min_port,
                max_port,
            });
            start = end + 1;
        }
        slices
    }
}

/// Resource counts of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub paused_consumers: usize,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages handled by the worker actor.
enum WorkerCommand {
    CreateRouter {
        codecs: Vec<RtpCodecCapability>,
        respond_to: Reply<RouterInfo>,
    },
    CloseRouter {
        router_id: RouterId,
        respond_to: oneshot::Sender<()>,
    },
    CreateTransport {
        router_id: RouterId,
        direction: TransportDirection,
        respond_to: Reply<TransportInfo>,
    },
    ConnectTransport {
        router_id: RouterId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: Reply<()>,
    },
    Produce {
        router_id: RouterId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: Reply<ProducerId>,
    },
    Consume {
        router_id: RouterId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        respond_to: Reply<ConsumerInfo>,
    },
    ResumeConsumer {
        router_id: RouterId,
        consumer_id: ConsumerId,
        respond_to: Reply<()>,
    },
    CloseTransport {
        router_id: RouterId,
        transport_id: TransportId,
        respond_to: oneshot::Sender<()>,
    },
    CloseProducer {
        router_id: RouterId,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<()>,
    },
    CloseConsumer {
        router_id: RouterId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<()>,
    },
    Stats {
        respond_to: oneshot::Sender<WorkerStats>,
    },
}

/// Handle to an in-process media worker.
#[derive(Debug)]
pub struct LocalWorker {
    id: WorkerId,
    sender: mpsc::Sender<WorkerCommand>,
    cancel_token: CancellationToken,
    exit: watch::Receiver<Option<WorkerExit>>,
}

impl LocalWorker {
    /// Spawn a worker actor and its supervisor.
    #[must_use]
    pub fn spawn(id: WorkerId, settings: WorkerSettings, cancel_token: CancellationToken) -> Self {
        let (sender, receiver) = mpsc::channel(WORKER_CHANNEL_BUFFER);
        let (exit_tx, exit) = watch::channel(None);

        let actor = WorkerActor::new(id, settings, receiver, cancel_token.clone());
        let task_handle = tokio::spawn(actor.run());

        tokio::spawn(async move {
            let exit = match task_handle.await {
                Ok(exit) => exit,
                Err(join_error) => {
                    error!(
                        target: "sfu.media.worker",
                        worker_id = %id,
                        error = ?join_error,
                        "Worker task failed"
                    );
                    WorkerExit {
                        reason: if join_error.is_panic() {
                            "worker panicked".to_string()
                        } else {
                            "worker task aborted".to_string()
                        },
                        graceful: false,
                    }
                }
            };
            exit_tx.send_replace(Some(exit));
        });

        Self {
            id,
            sender,
            cancel_token,
            exit,
        }
    }

    /// Current resource counts.
    pub async fn stats(&self) -> Result<WorkerStats, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerCommand::Stats { respond_to: tx })
            .await
            .map_err(|_| EngineError::WorkerClosed(self.id))?;
        rx.await.map_err(|_| EngineError::WorkerClosed(self.id))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> WorkerCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| EngineError::WorkerClosed(self.id))?;
        rx.await.map_err(|_| EngineError::WorkerClosed(self.id))?
    }

    async fn notify_close(&self, build: impl FnOnce(oneshot::Sender<()>) -> WorkerCommand) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(build(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[async_trait]
impl MediaWorker for LocalWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError> {
        let codecs = codecs.to_vec();
        self.request(|respond_to| WorkerCommand::CreateRouter { codecs, respond_to })
            .await
    }

    async fn close_router(&self, router_id: RouterId) {
        self.notify_close(|respond_to| WorkerCommand::CloseRouter {
            router_id,
            respond_to,
        })
        .await;
    }

    async fn create_webrtc_transport(
        &self,
        router_id: RouterId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError> {
        self.request(|respond_to| WorkerCommand::CreateTransport {
            router_id,
            direction,
            respond_to,
        })
        .await
    }

    async fn connect_transport(
        &self,
        router_id: RouterId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.request(|respond_to| WorkerCommand::ConnectTransport {
            router_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await
    }

    async fn produce(
        &self,
        router_id: RouterId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        self.request(|respond_to| WorkerCommand::Produce {
            router_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await
    }

    async fn consume(
        &self,
        router_id: RouterId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError> {
        self.request(|respond_to| WorkerCommand::Consume {
            router_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await
    }

    async fn resume_consumer(
        &self,
        router_id: RouterId,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError> {
        self.request(|respond_to| WorkerCommand::ResumeConsumer {
            router_id,
            consumer_id,
            respond_to,
        })
        .await
    }

    async fn close_transport(&self, router_id: RouterId, transport_id: TransportId) {
        self.notify_close(|respond_to| WorkerCommand::CloseTransport {
            router_id,
            transport_id,
            respond_to,
        })
        .await;
    }

    async fn close_producer(&self, router_id: RouterId, producer_id: ProducerId) {
        self.notify_close(|respond_to| WorkerCommand::CloseProducer {
            router_id,
            producer_id,
            respond_to,
        })
        .await;
    }

    async fn close_consumer(&self, router_id: RouterId, consumer_id: ConsumerId) {
        self.notify_close(|respond_to| WorkerCommand::CloseConsumer {
            router_id,
            consumer_id,
            respond_to,
        })
        .await;
    }

    async fn close(&self) {
        self.cancel_token.cancel();
        let _ = self.closed().await;
    }

    async fn closed(&self) -> WorkerExit {
        let mut exit = self.exit.clone();
        let state = match exit.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        state.unwrap_or_else(|| WorkerExit {
            reason: "worker supervisor gone".to_string(),
            graceful: false,
        })
    }
}

/// Ports handed out to transports of one worker.
#[derive(Debug)]
struct PortAllocator {
    min_port: u16,
    max_port: u16,
    next: u16,
    in_use: BTreeSet<u16>,
}

impl PortAllocator {
    fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            min_port,
            max_port,
            next: min_port,
            in_use: BTreeSet::new(),
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        let total = usize::from(self.max_port - self.min_port) + 1;
        if self.in_use.len() >= total {
            return None;
        }
        loop {
            let candidate = self.next;
            self.next = if candidate >= self.max_port {
                self.min_port
            } else {
                candidate + 1
            };
            if self.in_use.insert(candidate) {
                return Some(candidate);
            }
        }
    }

    fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

#[derive(Debug)]
struct TransportState {
    direction: TransportDirection,
    port: u16,
    dtls_connected: bool,
    next_mid: u32,
}

#[derive(Debug)]
struct ProducerState {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug)]
struct ConsumerState {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Debug, Default)]
struct RouterState {
    rtp_capabilities: RtpCapabilities,
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
}

impl RouterState {
    /// Remove a producer and every consumer of it.
    fn remove_producer(&mut self, producer_id: ProducerId) -> usize {
        if self.producers.remove(&producer_id).is_none() {
            return 0;
        }
        let before = self.consumers.len();
        self.consumers.retain(|_, c| c.producer_id != producer_id);
        before - self.consumers.len()
    }
}

struct WorkerActor {
    id: WorkerId,
    settings: WorkerSettings,
    receiver: mpsc::Receiver<WorkerCommand>,
    cancel_token: CancellationToken,
    routers: HashMap<RouterId, RouterState>,
    ports: PortAllocator,
    fingerprint: DtlsFingerprint,
}

impl WorkerActor {
    fn new(
        id: WorkerId,
        settings: WorkerSettings,
        receiver: mpsc::Receiver<WorkerCommand>,
        cancel_token: CancellationToken,
    ) -> Self {
        let mut rng = rand::thread_rng();
        let certificate: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
        let ports = PortAllocator::new(settings.min_port, settings.max_port);

        Self {
            id,
            settings,
            receiver,
            cancel_token,
            routers: HashMap::new(),
            ports,
            fingerprint: certificate_fingerprint(&certificate),
        }
    }

    #[instrument(skip_all, name = "sfu.media.worker", fields(worker_id = %self.id))]
    async fn run(mut self) -> WorkerExit {
        info!(
            target: "sfu.media.worker",
            worker_id = %self.id,
            min_port = self.settings.min_port,
            max_port = self.settings.max_port,
            "Media worker started"
        );

        let reason = loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    break "worker closed";
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(command) => self.handle_command(command),
                        None => break "all handles dropped",
                    }
                }
            }
        };

        info!(
            target: "sfu.media.worker",
            worker_id = %self.id,
            routers_remaining = self.routers.len(),
            reason,
            "Media worker stopped"
        );

        WorkerExit {
            reason: reason.to_string(),
            graceful: true,
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::CreateRouter { codecs, respond_to } => {
                let _ = respond_to.send(self.create_router(&codecs));
            }
            WorkerCommand::CloseRouter {
                router_id,
                respond_to,
            } => {
                self.close_router(router_id);
                let _ = respond_to.send(());
            }
            WorkerCommand::CreateTransport {
                router_id,
                direction,
                respond_to,
            } => {
                let _ = respond_to.send(self.create_transport(router_id, direction));
            }
            WorkerCommand::ConnectTransport {
                router_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let _ =
                    respond_to.send(self.connect_transport(router_id, transport_id, &dtls_parameters));
            }
            WorkerCommand::Produce {
                router_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let _ = respond_to.send(self.produce(router_id, transport_id, kind, rtp_parameters));
            }
            WorkerCommand::Consume {
                router_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let _ = respond_to.send(self.consume(
                    router_id,
                    transport_id,
                    producer_id,
                    &rtp_capabilities,
                ));
            }
            WorkerCommand::ResumeConsumer {
                router_id,
                consumer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.resume_consumer(router_id, consumer_id));
            }
            WorkerCommand::CloseTransport {
                router_id,
                transport_id,
                respond_to,
            } => {
                self.close_transport(router_id, transport_id);
                let _ = respond_to.send(());
            }
            WorkerCommand::CloseProducer {
                router_id,
                producer_id,
                respond_to,
            } => {
                if let Some(router) = self.routers.get_mut(&router_id) {
                    let cascaded = router.remove_producer(producer_id);
                    debug!(
                        target: "sfu.media.worker",
                        worker_id = %self.id,
                        producer_id = %producer_id,
                        consumers_closed = cascaded,
                        "Producer closed"
                    );
                }
                let _ = respond_to.send(());
            }
            WorkerCommand::CloseConsumer {
                router_id,
                consumer_id,
                respond_to,
            } => {
                if let Some(router) = self.routers.get_mut(&router_id) {
                    router.consumers.remove(&consumer_id);
                }
                let _ = respond_to.send(());
            }
            WorkerCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
        }
    }

    fn router(&self, router_id: RouterId) -> Result<&RouterState, EngineError> {
        self.routers
            .get(&router_id)
            .ok_or(EngineError::UnknownRouter(router_id))
    }

    fn router_mut(&mut self, router_id: RouterId) -> Result<&mut RouterState, EngineError> {
        self.routers
            .get_mut(&router_id)
            .ok_or(EngineError::UnknownRouter(router_id))
    }

    fn create_router(&mut self, codecs: &[RtpCodecCapability]) -> Result<RouterInfo, EngineError> {
        let rtp_capabilities = router_capabilities(codecs).map_err(EngineError::Negotiation)?;
        let router_id = RouterId::new();

        self.routers.insert(
            router_id,
            RouterState {
                rtp_capabilities: rtp_capabilities.clone(),
                ..RouterState::default()
            },
        );

        debug!(
            target: "sfu.media.worker",
            worker_id = %self.id,
            router_id = %router_id,
            total_routers = self.routers.len(),
            "Router created"
        );

        Ok(RouterInfo {
            router_id,
            rtp_capabilities,
        })
    }

    fn close_router(&mut self, router_id: RouterId) {
        if let Some(router) = self.routers.remove(&router_id) {
            for transport in router.transports.values() {
                self.ports.release(transport.port);
            }
            debug!(
                target: "sfu.media.worker",
                worker_id = %self.id,
                router_id = %router_id,
                transports_closed = router.transports.len(),
                "Router closed"
            );
        }
    }

    fn create_transport(
        &mut self,
        router_id: RouterId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, EngineError> {
        self.router(router_id)?;
        let port = self.ports.allocate().ok_or_else(|| {
            warn!(
                target: "sfu.media.worker",
                worker_id = %self.id,
                min_port = self.settings.min_port,
                max_port = self.settings.max_port,
                "RTC port range exhausted"
            );
            EngineError::Resource(format!("no free RTC port on {}", self.id))
        })?;

        let transport_id = TransportId::new();
        let announced = self.settings.announced_ip.clone();
        let info = TransportInfo {
            transport_id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: vec![
                IceCandidate {
                    foundation: "udpcandidate".to_string(),
                    priority: UDP_CANDIDATE_PRIORITY,
                    address: announced.clone(),
                    protocol: IceProtocol::Udp,
                    port,
                    candidate_type: IceCandidateType::Host,
                    tcp_type: None,
                },
                IceCandidate {
                    foundation: "tcpcandidate".to_string(),
                    priority: TCP_CANDIDATE_PRIORITY,
                    address: announced,
                    protocol: IceProtocol::Tcp,
                    port,
                    candidate_type: IceCandidateType::Host,
                    tcp_type: Some(IceTcpType::Passive),
                },
            ],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![self.fingerprint.clone()],
            },
        };

        self.router_mut(router_id)?.transports.insert(
            transport_id,
            TransportState {
                direction,
                port,
                dtls_connected: false,
                next_mid: 0,
            },
        );

        debug!(
            target: "sfu.media.worker",
            worker_id = %self.id,
            router_id = %router_id,
            transport_id = %transport_id,
            direction = %direction,
            port,
            "Transport created"
        );

        Ok(info)
    }

    fn connect_transport(
        &mut self,
        router_id: RouterId,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        let transport = self
            .router_mut(router_id)?
            .transports
            .get_mut(&transport_id)
            .ok_or(EngineError::UnknownTransport(transport_id))?;

        if transport.dtls_connected {
            return Err(EngineError::Negotiation(
                "transport is already connected".to_string(),
            ));
        }
        validate_dtls_parameters(dtls_parameters).map_err(EngineError::Negotiation)?;
        transport.dtls_connected = true;
        Ok(())
    }

    fn produce(
        &mut self,
        router_id: RouterId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        let router = self.router_mut(router_id)?;
        let transport = router
            .transports
            .get(&transport_id)
            .ok_or(EngineError::UnknownTransport(transport_id))?;
        if transport.direction != TransportDirection::Send {
            return Err(EngineError::Negotiation(
                "cannot produce on a recv transport".to_string(),
            ));
        }

        validate_producer_parameters(kind, &rtp_parameters, &router.rtp_capabilities)
            .map_err(EngineError::Negotiation)?;

        let producer_id = ProducerId::new();
        router.producers.insert(
            producer_id,
            ProducerState {
                transport_id,
                kind,
                rtp_parameters,
            },
        );
        Ok(producer_id)
    }

    fn consume(
        &mut self,
        router_id: RouterId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError> {
        let router = self.router_mut(router_id)?;
        let producer = router
            .producers
            .get(&producer_id)
            .ok_or(EngineError::UnknownProducer(producer_id))?;
        let kind = producer.kind;

        if !can_consume(kind, &producer.rtp_parameters, rtp_capabilities) {
            return Err(EngineError::Negotiation(format!(
                "receiver cannot consume {kind} producer"
            )));
        }

        let transport = router
            .transports
            .get_mut(&transport_id)
            .ok_or(EngineError::UnknownTransport(transport_id))?;
        if transport.direction != TransportDirection::Recv {
            return Err(EngineError::Negotiation(
                "cannot consume on a send transport".to_string(),
            ));
        }
        let mid = transport.next_mid.to_string();
        transport.next_mid += 1;

        let mut rng = rand::thread_rng();
        let rtp_parameters = consumer_parameters(
            kind,
            &producer.rtp_parameters,
            rtp_capabilities,
            rng.gen_range(100_000_000..900_000_000),
            rng.gen_range(100_000_000..900_000_000),
            Some(mid),
        )
        .map_err(EngineError::Negotiation)?;

        let consumer_id = ConsumerId::new();
        router.consumers.insert(
            consumer_id,
            ConsumerState {
                transport_id,
                producer_id,
                paused: true,
            },
        );

        Ok(ConsumerInfo {
            consumer_id,
            producer_id,
            kind,
            rtp_parameters,
            paused: true,
        })
    }

    fn resume_consumer(
        &mut self,
        router_id: RouterId,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError> {
        let consumer = self
            .router_mut(router_id)?
            .consumers
            .get_mut(&consumer_id)
            .ok_or(EngineError::UnknownConsumer(consumer_id))?;
        consumer.paused = false;
        Ok(())
    }

    fn close_transport(&mut self, router_id: RouterId, transport_id: TransportId) {
        let Some(router) = self.routers.get_mut(&router_id) else {
            return;
        };
        let Some(transport) = router.transports.remove(&transport_id) else {
            return;
        };
        self.ports.release(transport.port);

        let producers: Vec<ProducerId> = router
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect();
        for producer_id in &producers {
            router.remove_producer(*producer_id);
        }
        router
            .consumers
            .retain(|_, c| c.transport_id != transport_id);

        debug!(
            target: "sfu.media.worker",
            worker_id = %self.id,
            transport_id = %transport_id,
            producers_closed = producers.len(),
            "Transport closed"
        );
    }

    fn stats(&self) -> WorkerStats {
        self.routers
            .values()
            .fold(WorkerStats::default(), |mut stats, router| {
                stats.routers += 1;
                stats.transports += router.transports.len();
                stats.producers += router.producers.len();
                stats.consumers += router.consumers.len();
                stats.paused_consumers += router.consumers.values().filter(|c| c.paused).count();
                stats
            })
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use signaling_protocol::rtp::{RtpCodecParameters, RtpEncodingParameters};

    fn settings(min_port: u16, max_port: u16) -> WorkerSettings {
        WorkerSettings {
            listen_ip: "0.0.0.0".parse().unwrap(),
            announced_ip: "127.0.0.1".to_string(),
            min_port,
            max_port,
        }
    }

    fn spawn_worker(min_port: u16, max_port: u16) -> LocalWorker {
        LocalWorker::spawn(
            WorkerId(0),
            settings(min_port, max_port),
            CancellationToken::new(),
        )
    }

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![certificate_fingerprint(b"client")],
        }
    }

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: Default::default(),
                rtcp_feedback: Vec::new(),
            }],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1234),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_partition_covers_range_without_overlap() {
        let slices = settings(40000, 40009).partition(3);
        assert_eq!(slices.len(), 3);
        assert_eq!((slices[0].min_port, slices[0].max_port), (40000, 40003));
        assert_eq!((slices[1].min_port, slices[1].max_port), (40004, 40006));
        assert_eq!((slices[2].min_port, slices[2].max_port), (40007, 40009));
    }

    #[test]
    fn test_partition_caps_at_port_count() {
        let slices = settings(40000, 40001).partition(4);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_port_allocator_reuses_released_ports() {
        let mut ports = PortAllocator::new(5000, 5001);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_ne!(a, b);
        assert!(ports.allocate().is_none());

        ports.release(a);
        assert_eq!(ports.allocate(), Some(a));
    }

    #[tokio::test]
    async fn test_transport_negotiation_flow() {
        let worker = spawn_worker(40000, 40010);
        let router = worker.create_router(&default_media_codecs()).await.unwrap();

        let send = worker
            .create_webrtc_transport(router.router_id, TransportDirection::Send)
            .await
            .unwrap();
        assert_eq!(send.ice_parameters.username_fragment.len(), 16);
        assert_eq!(send.ice_parameters.password.len(), 32);
        assert_eq!(send.ice_candidates.len(), 2);
        assert_eq!(send.ice_candidates[0].address, "127.0.0.1");
        assert_eq!(send.dtls_parameters.fingerprints.len(), 1);

        worker
            .connect_transport(router.router_id, send.transport_id, client_dtls())
            .await
            .unwrap();
        let again = worker
            .connect_transport(router.router_id, send.transport_id, client_dtls())
            .await;
        assert!(matches!(again, Err(EngineError::Negotiation(_))));

        let producer_id = worker
            .produce(
                router.router_id,
                send.transport_id,
                MediaKind::Audio,
                opus_parameters(),
            )
            .await
            .unwrap();

        let recv = worker
            .create_webrtc_transport(router.router_id, TransportDirection::Recv)
            .await
            .unwrap();
        let consumer = worker
            .consume(
                router.router_id,
                recv.transport_id,
                producer_id,
                router.rtp_capabilities.clone(),
            )
            .await
            .unwrap();
        assert!(consumer.paused);
        assert_eq!(consumer.producer_id, producer_id);
        assert_eq!(consumer.rtp_parameters.mid.as_deref(), Some("0"));

        worker
            .resume_consumer(router.router_id, consumer.consumer_id)
            .await
            .unwrap();

        let stats = worker.stats().await.unwrap();
        assert_eq!(stats.transports, 2);
        assert_eq!(stats.producers, 1);
        assert_eq!(stats.consumers, 1);
        assert_eq!(stats.paused_consumers, 0);

        worker.close().await;
    }

    #[tokio::test]
    async fn test_unknown_resources_are_reported() {
        let worker = spawn_worker(40000, 40010);
        let router = worker.create_router(&default_media_codecs()).await.unwrap();

        let missing = TransportId::new();
        let result = worker
            .connect_transport(router.router_id, missing, client_dtls())
            .await;
        assert_eq!(result, Err(EngineError::UnknownTransport(missing)));

        let missing_router = RouterId::new();
        let result = worker
            .create_webrtc_transport(missing_router, TransportDirection::Send)
            .await;
        assert_eq!(result, Err(EngineError::UnknownRouter(missing_router)));

        worker.close().await;
    }

    #[tokio::test]
    async fn test_produce_rejects_unsupported_codec() {
        let worker = spawn_worker(40000, 40010);
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        let send = worker
            .create_webrtc_transport(router.router_id, TransportDirection::Send)
            .await
            .unwrap();

        let mut params = opus_parameters();
        params.codecs[0].mime_type = "audio/G722".to_string();
        params.codecs[0].clock_rate = 8000;
        let result = worker
            .produce(router.router_id, send.transport_id, MediaKind::Audio, params)
            .await;
        assert!(matches!(result, Err(EngineError::Negotiation(_))));

        worker.close().await;
    }

    #[tokio::test]
    async fn test_close_producer_cascades_to_consumers() {
        let worker = spawn_worker(40000, 40010);
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        let send = worker
            .create_webrtc_transport(router.router_id, TransportDirection::Send)
            .await
            .unwrap();
        let recv = worker
            .create_webrtc_transport(router.router_id, TransportDirection::Recv)
            .await
            .unwrap();
        let producer_id = worker
            .produce(
                router.router_id,
                send.transport_id,
                MediaKind::Audio,
                opus_parameters(),
            )
            .await
            .unwrap();
        worker
            .consume(
                router.router_id,
                recv.transport_id,
                producer_id,
                router.rtp_capabilities.clone(),
            )
            .await
            .unwrap();

        worker.close_producer(router.router_id, producer_id).await;
        // Idempotent
        worker.close_producer(router.router_id, producer_id).await;

        let stats = worker.stats().await.unwrap();
        assert_eq!(stats.producers, 0);
        assert_eq!(stats.consumers, 0);

        worker.close().await;
    }

    #[tokio::test]
    async fn test_port_exhaustion_and_release() {
        let worker = spawn_worker(40000, 40000);
        let router = worker.create_router(&default_media_codecs()).await.unwrap();

        let first = worker
            .create_webrtc_transport(router.router_id, TransportDirection::Send)
            .await
            .unwrap();
        let second = worker
            .create_webrtc_transport(router.router_id, TransportDirection::Recv)
            .await;
        assert!(matches!(second, Err(EngineError::Resource(_))));

        worker
            .close_transport(router.router_id, first.transport_id)
            .await;
        assert!(worker
            .create_webrtc_transport(router.router_id, TransportDirection::Recv)
            .await
            .is_ok());

        worker.close().await;
    }

    #[tokio::test]
    async fn test_close_router_releases_everything() {
        let worker = spawn_worker(40000, 40010);
        let router = worker.create_router(&default_media_codecs()).await.unwrap();
        worker
            .create_webrtc_transport(router.router_id, TransportDirection::Send)
            .await
            .unwrap();

        worker.close_router(router.router_id).await;
        worker.close_router(router.router_id).await;

        assert_eq!(worker.stats().await.unwrap(), WorkerStats::default());
        worker.close().await;
    }

    #[tokio::test]
    async fn test_close_resolves_closed_gracefully() {
        let worker = spawn_worker(40000, 40010);
        worker.close().await;

        let exit = worker.closed().await;
        assert!(exit.graceful);

        let result = worker.create_router(&default_media_codecs()).await;
        assert_eq!(result.err(), Some(EngineError::WorkerClosed(WorkerId(0))));
    }
}

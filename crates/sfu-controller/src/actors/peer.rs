//! Per-peer state owned by a `RoomActor`.
//!
//! A [`Peer`] is mutated only by its room, through crate-private methods,
//! so every transport, producer and consumer is registered before any other
//! peer can learn its id.

use super::connection::ConnectionActorHandle;
use super::messages::{ConsumerState, PeerState, TransportState};

use common::types::{ConsumerId, PeerId, ProducerId, TransportId};
use signaling_protocol::message::{PeerInfo, ProducerInfo};
use signaling_protocol::rtp::{MediaKind, RtpParameters};
use signaling_protocol::transport::TransportDirection;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub(crate) struct Transport {
    pub direction: TransportDirection,
    pub connected: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Producer {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone)]
pub(crate) struct Consumer {
    pub producer_id: ProducerId,
    pub paused: bool,
}

/// One signaling connection inside one room.
#[derive(Debug)]
pub struct Peer {
    peer_id: PeerId,
    display_name: String,
    joined_at: Instant,
    /// Monotonic join order within the room.
    join_seq: u64,
    connection: ConnectionActorHandle,
    transports: HashMap<TransportId, Transport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
    /// Ids this peer owned and that are now closed, so repeated closes are
    /// no-ops rather than errors.
    closed_producers: HashSet<ProducerId>,
    closed_consumers: HashSet<ConsumerId>,
}

impl Peer {
    pub(crate) fn new(
        peer_id: PeerId,
        display_name: String,
        join_seq: u64,
        connection: ConnectionActorHandle,
    ) -> Self {
        Self {
            peer_id,
            display_name,
            joined_at: Instant::now(),
            join_seq,
            connection,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            closed_producers: HashSet::new(),
            closed_consumers: HashSet::new(),
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn joined_at(&self) -> Instant {
        self.joined_at
    }

    pub(crate) fn join_seq(&self) -> u64 {
        self.join_seq
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionActorHandle {
        &self.connection
    }

    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
        }
    }

    /// Whether any transport has received DTLS parameters.
    #[must_use]
    pub fn has_connected_transport(&self) -> bool {
        self.transports.values().any(|t| t.connected)
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    pub(crate) fn add_transport(&mut self, transport_id: TransportId, direction: TransportDirection) {
        self.transports.insert(
            transport_id,
            Transport {
                direction,
                connected: false,
            },
        );
    }

    pub(crate) fn transport(&self, transport_id: &TransportId) -> Option<&Transport> {
        self.transports.get(transport_id)
    }

    pub(crate) fn mark_connected(&mut self, transport_id: &TransportId) -> bool {
        match self.transports.get_mut(transport_id) {
            Some(transport) => {
                transport.connected = true;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    pub(crate) fn add_producer(&mut self, producer_id: ProducerId, producer: Producer) {
        self.producers.insert(producer_id, producer);
    }

    pub(crate) fn producer(&self, producer_id: &ProducerId) -> Option<&Producer> {
        self.producers.get(producer_id)
    }

    pub(crate) fn remove_producer(&mut self, producer_id: &ProducerId) -> Option<Producer> {
        let removed = self.producers.remove(producer_id);
        if removed.is_some() {
            self.closed_producers.insert(*producer_id);
        }
        removed
    }

    pub(crate) fn closed_producer(&self, producer_id: &ProducerId) -> bool {
        self.closed_producers.contains(producer_id)
    }

    #[must_use]
    pub fn producer_infos(&self) -> Vec<ProducerInfo> {
        self.producers
            .iter()
            .map(|(producer_id, producer)| ProducerInfo {
                peer_id: self.peer_id.clone(),
                producer_id: *producer_id,
                kind: producer.kind,
                rtp_parameters: producer.rtp_parameters.clone(),
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    pub(crate) fn add_consumer(&mut self, consumer_id: ConsumerId, consumer: Consumer) {
        self.consumers.insert(consumer_id, consumer);
    }

    pub(crate) fn consumer_mut(&mut self, consumer_id: &ConsumerId) -> Option<&mut Consumer> {
        self.consumers.get_mut(consumer_id)
    }

    pub(crate) fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> Option<Consumer> {
        let removed = self.consumers.remove(consumer_id);
        if removed.is_some() {
            self.closed_consumers.insert(*consumer_id);
        }
        removed
    }

    pub(crate) fn closed_consumer(&self, consumer_id: &ConsumerId) -> bool {
        self.closed_consumers.contains(consumer_id)
    }

    /// Remove and return every consumer created from `producer_id`.
    pub(crate) fn remove_consumers_of(&mut self, producer_id: ProducerId) -> Vec<ConsumerId> {
        let ids: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id == producer_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.remove_consumer(id);
        }
        ids
    }

    /// Empty all three mappings, returning their ids in close order.
    pub(crate) fn take_resources(
        &mut self,
    ) -> (Vec<ConsumerId>, Vec<ProducerId>, Vec<TransportId>) {
        (
            self.consumers.drain().map(|(id, _)| id).collect(),
            self.producers.drain().map(|(id, _)| id).collect(),
            self.transports.drain().map(|(id, _)| id).collect(),
        )
    }

    #[must_use]
    pub fn state(&self) -> PeerState {
        PeerState {
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            transports: self
                .transports
                .iter()
                .map(|(id, t)| TransportState {
                    transport_id: *id,
                    direction: t.direction,
                    connected: t.connected,
                })
                .collect(),
            producer_ids: self.producers.keys().copied().collect(),
            consumers: self
                .consumers
                .iter()
                .map(|(id, c)| ConsumerState {
                    consumer_id: *id,
                    producer_id: c.producer_id,
                    paused: c.paused,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActor;
    use crate::actors::metrics::ActorMetrics;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn peer() -> Peer {
        let (tx, _rx) = mpsc::channel(4);
        let peer_id = PeerId::parse("peer-a").unwrap();
        let (connection, _task) = ConnectionActor::spawn(
            peer_id.clone(),
            tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        Peer::new(peer_id, "Alice".to_string(), 0, connection)
    }

    fn producer() -> Producer {
        Producer {
            kind: MediaKind::Video,
            rtp_parameters: RtpParameters::default(),
        }
    }

    #[tokio::test]
    async fn test_connected_transport_tracking() {
        let mut peer = peer();
        let send = TransportId::new();
        peer.add_transport(send, TransportDirection::Send);
        assert!(!peer.has_connected_transport());

        assert!(peer.mark_connected(&send));
        assert!(peer.has_connected_transport());
        assert!(!peer.mark_connected(&TransportId::new()));
    }

    #[tokio::test]
    async fn test_remove_consumers_of_only_matching() {
        let mut peer = peer();
        let p1 = ProducerId::new();
        let p2 = ProducerId::new();
        for producer_id in [p1, p1, p2] {
            peer.add_consumer(
                ConsumerId::new(),
                Consumer {
                    producer_id,
                    paused: true,
                },
            );
        }

        let closed = peer.remove_consumers_of(p1);
        assert_eq!(closed.len(), 2);
        assert!(peer.remove_consumers_of(p1).is_empty());
        assert!(closed.iter().all(|id| peer.closed_consumer(id)));
        let state = peer.state();
        assert_eq!(state.consumers.len(), 1);
        assert_eq!(state.consumers.first().unwrap().producer_id, p2);
    }

    #[tokio::test]
    async fn test_take_resources_empties_peer() {
        let mut peer = peer();
        let send = TransportId::new();
        peer.add_transport(send, TransportDirection::Send);
        peer.add_producer(ProducerId::new(), producer());
        peer.add_consumer(
            ConsumerId::new(),
            Consumer {
                producer_id: ProducerId::new(),
                paused: false,
            },
        );

        let (consumers, producers, transports) = peer.take_resources();
        assert_eq!((consumers.len(), producers.len(), transports.len()), (1, 1, 1));

        let state = peer.state();
        assert!(state.transports.is_empty());
        assert!(state.producer_ids.is_empty());
        assert!(state.consumers.is_empty());
        assert_eq!(peer.info().display_name, "Alice");
    }
}

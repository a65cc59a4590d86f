#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
//! Room, peer and media resource lifecycle through the signaling session.
//!
//! Peers are driven in-process (no sockets) over mock workers; see
//! `signaling_ws_tests.rs` for the WebSocket path.

use serde_json::json;
use sfu_test_utils::{
    audio_only_capabilities, h265_parameters, opus_parameters, vp8_parameters, MockWorker,
    TestSfu,
};
use signaling_protocol::message::methods;
use signaling_protocol::rtp::MediaKind;
use signaling_protocol::transport::TransportDirection;
use signaling_protocol::{ErrorCode, Response};
use std::sync::Arc;
use std::time::Duration;

fn error_code(response: &Response) -> ErrorCode {
    assert!(!response.ok, "expected an error response, got {response:?}");
    response.error.as_ref().unwrap().code
}

#[tokio::test]
async fn test_r1_scenario() {
    let sfu = TestSfu::builder().build();
    let mut alice = sfu.peer("alice");
    let mut bob = sfu.peer("bob");

    // A joins: room created with one router.
    let joined = alice.join("R1").await;
    assert!(joined.peers.is_empty());
    assert!(joined.existing_producers.is_empty());
    assert!(!joined.router_rtp_capabilities.codecs.is_empty());
    assert_eq!(sfu.live_routers(), 1);

    // A produces video p1 on a connected send transport.
    let send = alice.connected_transport(TransportDirection::Send).await;
    let p1 = alice.produce(send, MediaKind::Video, vp8_parameters(1111)).await;

    // B joins and finds p1 in the join response only.
    let joined = bob.join("R1").await;
    assert_eq!(joined.peers.len(), 1);
    assert_eq!(joined.peers[0].peer_id.as_str(), "alice");
    assert_eq!(joined.existing_producers.len(), 1);
    assert_eq!(joined.existing_producers[0].producer_id, p1);
    assert_eq!(joined.existing_producers[0].peer_id.as_str(), "alice");
    assert_eq!(joined.existing_producers[0].kind, MediaKind::Video);
    assert!(bob.drain_notifications().is_empty());

    let peer_joined = alice.notification(methods::PEER_JOINED).await;
    assert_eq!(peer_joined.data["peerId"], json!("bob"));

    // B consumes p1; the consumer starts paused.
    let recv = bob.connected_transport(TransportDirection::Recv).await;
    let consumer = bob.consume(recv, p1).await;
    assert_eq!(consumer.producer_id, p1);
    assert_eq!(consumer.kind, MediaKind::Video);
    assert!(consumer.paused);
    assert!(bob.resume_consumer(consumer.consumer_id).await.ok);

    // A disconnects: p1 and B's consumer close, B learns about both.
    alice.session().disconnect().await;

    let closed = bob.next_notification().await;
    assert_eq!(closed.method, methods::CONSUMER_CLOSED);
    assert_eq!(closed.data["consumerId"], json!(consumer.consumer_id));
    assert_eq!(closed.data["producerId"], json!(p1));

    let left = bob.next_notification().await;
    assert_eq!(left.method, methods::PEER_LEFT);
    assert_eq!(left.data["peerId"], json!("alice"));

    let state = sfu.room_state("R1").await.expect("room should still exist");
    assert_eq!(state.peers.len(), 1);
    assert_eq!(state.consumers_of(p1), 0);
    assert!(state.peer(alice.peer_id()).is_none());

    // B leaves: room and router are gone.
    assert!(bob.leave().await.ok);
    sfu.wait_room_removed("R1").await;
    sfu.wait_live_routers(0).await;
}

#[tokio::test]
async fn test_concurrent_first_joins_allocate_one_router() {
    let worker = MockWorker::builder()
        .router_delay(Duration::from_millis(50))
        .build();
    let sfu = TestSfu::builder().with_worker(Arc::clone(&worker)).build();
    let alice = sfu.peer("alice");
    let bob = sfu.peer("bob");

    let (a, b) = tokio::join!(alice.join("R1"), bob.join("R1"));

    assert_eq!(worker.routers_created(), 1);
    assert_eq!(sfu.live_routers(), 1);
    // Exactly one of them saw the other in the room.
    assert_eq!(a.peers.len() + b.peers.len(), 1);
    assert_eq!(sfu.room_state("R1").await.unwrap().peers.len(), 2);
}

#[tokio::test]
async fn test_room_exists_iff_it_has_peers() {
    let sfu = TestSfu::builder().build();
    let alice = sfu.peer("alice");
    let bob = sfu.peer("bob");

    assert!(sfu.room_state("R1").await.is_none());

    alice.join("R1").await;
    bob.join("R1").await;
    assert_eq!(sfu.room_state("R1").await.unwrap().peers.len(), 2);

    assert!(alice.leave().await.ok);
    assert_eq!(sfu.room_state("R1").await.unwrap().peers.len(), 1);

    bob.session().disconnect().await;
    sfu.wait_room_removed("R1").await;

    // A fresh join recreates the room with a new router.
    alice.join("R1").await;
    assert_eq!(sfu.room_state("R1").await.unwrap().peers.len(), 1);
    assert_eq!(sfu.worker(0).routers_created(), 2);
}

#[tokio::test]
async fn test_close_producer_closes_every_consumer() {
    let sfu = TestSfu::builder().build();
    let alice = sfu.peer("alice");
    let mut bob = sfu.peer("bob");
    let mut carol = sfu.peer("carol");

    alice.join("R1").await;
    bob.join("R1").await;
    carol.join("R1").await;

    let send = alice.connected_transport(TransportDirection::Send).await;
    let video = alice.produce(send, MediaKind::Video, vp8_parameters(1)).await;
    let audio = alice.produce(send, MediaKind::Audio, opus_parameters(2)).await;

    let bob_recv = bob.connected_transport(TransportDirection::Recv).await;
    let carol_recv = carol.connected_transport(TransportDirection::Recv).await;
    let bob_video = bob.consume(bob_recv, video).await;
    let carol_video = carol.consume(carol_recv, video).await;
    let bob_audio = bob.consume(bob_recv, audio).await;

    bob.drain_notifications();
    carol.drain_notifications();

    assert!(alice.close_producer(video).await.ok);

    let state = sfu.room_state("R1").await.unwrap();
    assert_eq!(state.consumers_of(video), 0);
    assert_eq!(state.consumers_of(audio), 1);
    assert!(!state.peer(alice.peer_id()).unwrap().producer_ids.contains(&video));

    let closed = bob.notification(methods::CONSUMER_CLOSED).await;
    assert_eq!(closed.data["consumerId"], json!(bob_video.consumer_id));
    let closed = carol.notification(methods::CONSUMER_CLOSED).await;
    assert_eq!(closed.data["consumerId"], json!(carol_video.consumer_id));

    // The audio consumer is untouched.
    assert!(bob.resume_consumer(bob_audio.consumer_id).await.ok);
    // The closed consumer is gone for its owner.
    let response = bob.resume_consumer(bob_video.consumer_id).await;
    assert_eq!(error_code(&response), ErrorCode::NotFoundError);
}

#[tokio::test]
async fn test_ids_are_scoped_to_their_peer() {
    let sfu = TestSfu::builder().build();
    let alice = sfu.peer("alice");
    let bob = sfu.peer("bob");
    alice.join("R1").await;
    bob.join("R1").await;

    let alice_send = alice.create_transport(TransportDirection::Send).await;
    let response = bob.connect_transport(alice_send.transport_id).await;
    assert_eq!(error_code(&response), ErrorCode::NotFoundError);

    let response = bob
        .produce_request(alice_send.transport_id, MediaKind::Video, vp8_parameters(1))
        .await;
    assert_eq!(error_code(&response), ErrorCode::NotFoundError);

    // Alice can still connect her own transport.
    assert!(alice.connect_transport(alice_send.transport_id).await.ok);
    let producer = alice
        .produce(alice_send.transport_id, MediaKind::Video, vp8_parameters(1))
        .await;

    let response = bob.close_producer(producer).await;
    assert_eq!(error_code(&response), ErrorCode::NotFoundError);

    let bob_recv = bob.connected_transport(TransportDirection::Recv).await;
    let consumer = bob.consume(bob_recv, producer).await;
    let response = alice.close_consumer(consumer.consumer_id).await;
    assert_eq!(error_code(&response), ErrorCode::NotFoundError);
    let response = alice.resume_consumer(consumer.consumer_id).await;
    assert_eq!(error_code(&response), ErrorCode::NotFoundError);

    // A peer cannot consume its own producer.
    let alice_recv = alice.connected_transport(TransportDirection::Recv).await;
    let response = alice
        .consume_with(alice_recv, producer, sfu_test_utils::client_capabilities())
        .await;
    assert_eq!(error_code(&response), ErrorCode::NotFoundError);
}

#[tokio::test]
async fn test_double_close_is_a_no_op() {
    let sfu = TestSfu::builder().build();
    let alice = sfu.peer("alice");
    let bob = sfu.peer("bob");
    alice.join("R1").await;
    bob.join("R1").await;

    let send = alice.connected_transport(TransportDirection::Send).await;
    let producer = alice.produce(send, MediaKind::Audio, opus_parameters(5)).await;
    let recv = bob.connected_transport(TransportDirection::Recv).await;
    let consumer = bob.consume(recv, producer).await;

    assert!(bob.close_consumer(consumer.consumer_id).await.ok);
    assert!(bob.close_consumer(consumer.consumer_id).await.ok);

    assert!(alice.close_producer(producer).await.ok);
    assert!(alice.close_producer(producer).await.ok);

    assert!(alice.leave().await.ok);
    assert!(alice.leave().await.ok);

    let room = sfu
        .registry()
        .get_room(common::types::RoomId::parse("R1").unwrap())
        .await
        .unwrap()
        .unwrap();
    room.close_peer(
        alice.peer_id().clone(),
        sfu_controller::actors::LeaveReason::Voluntary,
    )
    .await
    .unwrap();
    assert_eq!(room.get_state().await.unwrap().peers.len(), 1);
}

#[tokio::test]
async fn test_incompatible_producer_is_not_registered() {
    let sfu = TestSfu::builder().build();
    let alice = sfu.peer("alice");
    let mut bob = sfu.peer("bob");
    alice.join("R1").await;
    bob.join("R1").await;
    bob.drain_notifications();

    let send = alice.connected_transport(TransportDirection::Send).await;
    let response = alice
        .produce_request(send, MediaKind::Video, h265_parameters(9))
        .await;
    assert_eq!(error_code(&response), ErrorCode::NegotiationError);

    // Kind and codec disagree.
    let response = alice
        .produce_request(send, MediaKind::Audio, vp8_parameters(9))
        .await;
    assert_eq!(error_code(&response), ErrorCode::NegotiationError);

    let state = sfu.room_state("R1").await.unwrap();
    assert!(state.peer(alice.peer_id()).unwrap().producer_ids.is_empty());
    assert!(bob.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_direction_and_capability_checks() {
    let sfu = TestSfu::builder().build();
    let alice = sfu.peer("alice");
    let bob = sfu.peer("bob");
    alice.join("R1").await;
    bob.join("R1").await;

    let recv = alice.connected_transport(TransportDirection::Recv).await;
    let response = alice
        .produce_request(recv, MediaKind::Video, vp8_parameters(1))
        .await;
    assert_eq!(error_code(&response), ErrorCode::NegotiationError);

    let send = alice.connected_transport(TransportDirection::Send).await;
    let producer = alice.produce(send, MediaKind::Video, vp8_parameters(1)).await;

    let bob_send = bob.connected_transport(TransportDirection::Send).await;
    let response = bob
        .consume_with(bob_send, producer, sfu_test_utils::client_capabilities())
        .await;
    assert_eq!(error_code(&response), ErrorCode::NegotiationError);

    let bob_recv = bob.connected_transport(TransportDirection::Recv).await;
    let response = bob
        .consume_with(bob_recv, producer, audio_only_capabilities())
        .await;
    assert_eq!(error_code(&response), ErrorCode::NegotiationError);

    let response = alice.connect_transport(send).await;
    assert_eq!(error_code(&response), ErrorCode::NegotiationError);
}

#[tokio::test]
async fn test_engine_resource_failure_is_local_to_the_request() {
    let worker = MockWorker::builder().build();
    let sfu = TestSfu::builder().with_worker(Arc::clone(&worker)).build();
    let alice = sfu.peer("alice");
    let mut bob = sfu.peer("bob");
    alice.join("R1").await;
    bob.join("R1").await;
    bob.drain_notifications();

    worker.set_fail_create_transport(true);
    let response = alice
        .request(signaling_protocol::Request::CreateTransport(
            signaling_protocol::message::CreateTransportRequest {
                direction: TransportDirection::Send,
            },
        ))
        .await;
    assert_eq!(error_code(&response), ErrorCode::ResourceError);

    worker.set_fail_create_transport(false);
    let send = alice.connected_transport(TransportDirection::Send).await;

    worker.set_fail_produce(true);
    let response = alice
        .produce_request(send, MediaKind::Video, vp8_parameters(1))
        .await;
    assert_eq!(error_code(&response), ErrorCode::ResourceError);

    let state = sfu.room_state("R1").await.unwrap();
    assert_eq!(state.peers.len(), 2);
    assert!(state.peer(alice.peer_id()).unwrap().producer_ids.is_empty());
    assert!(bob.drain_notifications().is_empty());
}

#[tokio::test]
async fn test_room_capacity_limits() {
    let sfu = TestSfu::builder().max_rooms(1).max_peers(1).build();
    let alice = sfu.peer("alice");
    let bob = sfu.peer("bob");

    alice.join("R1").await;

    let response = bob
        .request(signaling_protocol::Request::Join(
            signaling_protocol::message::JoinRequest {
                room_id: "R1".to_string(),
                display_name: "Bob".to_string(),
            },
        ))
        .await;
    assert_eq!(error_code(&response), ErrorCode::ResourceError);

    let response = bob
        .request(signaling_protocol::Request::Join(
            signaling_protocol::message::JoinRequest {
                room_id: "R2".to_string(),
                display_name: "Bob".to_string(),
            },
        ))
        .await;
    assert_eq!(error_code(&response), ErrorCode::ResourceError);
    assert!(!bob.session().is_joined());
}

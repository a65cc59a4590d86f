#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end signaling over a real WebSocket.

use serde_json::json;
use sfu_test_utils::{dtls_parameters, vp8_parameters, MockWorker, SignalingClient, TestSfu};
use signaling_protocol::message::{
    methods, ConnectTransportRequest, CreateTransportRequest, ProduceRequest, ProduceResponse,
};
use signaling_protocol::rtp::MediaKind;
use signaling_protocol::transport::{TransportDirection, TransportInfo};
use signaling_protocol::{ErrorCode, Request};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_join_produce_and_disconnect_over_websocket() {
    let sfu = TestSfu::builder().build();
    let server = sfu.serve().await.unwrap();

    let mut alice = SignalingClient::connect(&server.ws_url("alice")).await.unwrap();
    let joined = alice.join("R1", "  Alice ").await.unwrap();
    assert_eq!(joined.peer_id.as_str(), "alice");
    assert!(joined.peers.is_empty());

    let mut bob = SignalingClient::connect(&server.ws_url("bob")).await.unwrap();
    let joined = bob.join("R1", "Bob").await.unwrap();
    assert_eq!(joined.peers.len(), 1);
    assert_eq!(joined.peers.first().unwrap().display_name, "Alice");

    let peer_joined = alice.next_notification().await.unwrap();
    assert_eq!(peer_joined.method, methods::PEER_JOINED);
    assert_eq!(
        peer_joined.data,
        json!({"peerId": "bob", "displayName": "Bob"})
    );

    let response = alice
        .request(Request::CreateTransport(CreateTransportRequest {
            direction: TransportDirection::Send,
        }))
        .await
        .unwrap();
    let transport: TransportInfo = response.data_as().unwrap();
    assert!(!transport.ice_candidates.is_empty());

    let response = alice
        .request(Request::ConnectTransport(ConnectTransportRequest {
            transport_id: transport.transport_id,
            dtls_parameters: dtls_parameters(),
        }))
        .await
        .unwrap();
    assert_eq!(response.data, Some(json!({"ok": true})));

    let response = alice
        .request(Request::Produce(ProduceRequest {
            transport_id: transport.transport_id,
            kind: MediaKind::Video,
            rtp_parameters: vp8_parameters(4242),
        }))
        .await
        .unwrap();
    let produced: ProduceResponse = response.data_as().unwrap();

    let available = bob.next_notification().await.unwrap();
    assert_eq!(available.method, methods::NEW_PRODUCER_AVAILABLE);
    assert_eq!(available.data["peerId"], json!("alice"));
    assert_eq!(available.data["producerId"], json!(produced.producer_id));
    assert_eq!(available.data["kind"], json!("video"));

    // Dropping the socket is a leave.
    bob.close().await.unwrap();
    let left = alice.next_notification().await.unwrap();
    assert_eq!(left.method, methods::PEER_LEFT);
    assert_eq!(left.data, json!({"peerId": "bob"}));

    alice.close().await.unwrap();
    sfu.wait_room_removed("R1").await;
}

#[tokio::test]
async fn test_unknown_method_gets_exactly_one_invalid_request() {
    let sfu = TestSfu::builder().build();
    let server = sfu.serve().await.unwrap();
    let mut client = SignalingClient::connect(&server.ws_url("alice")).await.unwrap();

    client
        .send_text(r#"{"id": 42, "method": "teleport", "data": {}}"#)
        .await
        .unwrap();
    let response = client.response(42).await.unwrap();
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);

    // The next response must belong to the next request, not a duplicate.
    let response = client.request(Request::Leave).await.unwrap();
    assert!(response.ok);
}

#[tokio::test]
async fn test_malformed_frames() {
    let sfu = TestSfu::builder().build();
    let server = sfu.serve().await.unwrap();
    let mut client = SignalingClient::connect(&server.ws_url("alice")).await.unwrap();

    // Payload does not match the method.
    client
        .send_text(r#"{"id": 7, "method": "produce", "data": {"kind": "video"}}"#)
        .await
        .unwrap();
    let response = client.response(7).await.unwrap();
    assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);

    // No readable id: dropped without a response.
    client.send_text("not json at all").await.unwrap();

    // Requests before join are rejected.
    let response = client
        .request(Request::CreateTransport(CreateTransportRequest {
            direction: TransportDirection::Recv,
        }))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);

    // The connection is still usable.
    client.join("R1", "Alice").await.unwrap();
}

#[tokio::test]
async fn test_invalid_room_id() {
    let sfu = TestSfu::builder().build();
    let server = sfu.serve().await.unwrap();
    let mut client = SignalingClient::connect(&server.ws_url("alice")).await.unwrap();

    let response = client
        .request(Request::Join(signaling_protocol::message::JoinRequest {
            room_id: "no spaces allowed".to_string(),
            display_name: String::new(),
        }))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRoom);
}

#[tokio::test]
async fn test_peer_id_from_query() {
    let sfu = TestSfu::builder().build();
    let server = sfu.serve().await.unwrap();

    let rejected =
        SignalingClient::connect(&format!("ws://{}/ws?peerId=bad%20id", server.addr())).await;
    assert!(rejected.is_err());

    let mut anonymous = SignalingClient::connect(&server.anonymous_ws_url())
        .await
        .unwrap();
    let joined = anonymous.join("R1", "").await.unwrap();
    assert!(!joined.peer_id.as_str().is_empty());
}

#[tokio::test]
async fn test_connection_without_join_is_closed() {
    let sfu = TestSfu::builder()
        .join_timeout(Duration::from_millis(200))
        .build();
    let server = sfu.serve().await.unwrap();
    let mut client = SignalingClient::connect(&server.ws_url("alice")).await.unwrap();

    assert_eq!(client.closed().await.unwrap(), "join timeout");
}

#[tokio::test]
async fn test_joined_connection_survives_join_timeout() {
    let sfu = TestSfu::builder()
        .join_timeout(Duration::from_millis(200))
        .build();
    let server = sfu.serve().await.unwrap();
    let mut client = SignalingClient::connect(&server.ws_url("alice")).await.unwrap();
    client.join("R1", "Alice").await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;

    let response = client.request(Request::Leave).await.unwrap();
    assert!(response.ok);
}

#[tokio::test]
async fn test_slow_room_creation_outlasts_join_timeout() {
    let worker = MockWorker::builder()
        .router_delay(Duration::from_millis(300))
        .build();
    let sfu = TestSfu::builder()
        .with_worker(Arc::clone(&worker))
        .join_timeout(Duration::from_millis(200))
        .build();
    let server = sfu.serve().await.unwrap();
    let mut client = SignalingClient::connect(&server.ws_url("alice")).await.unwrap();

    let joined = client.join("R1", "Alice").await.unwrap();
    assert_eq!(joined.peer_id.as_str(), "alice");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let response = client.request(Request::Leave).await.unwrap();
    assert!(response.ok);
}

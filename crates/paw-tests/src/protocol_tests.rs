//! Wire-level tests: a raw socket speaking the protocol to a live node.

use crate::harness::*;
use paw_p2p::codec::{self, MSG_PEX_REQUEST, MSG_PEX_RESPONSE, MSG_PING, MSG_PONG};
use paw_p2p::handshake::{self, Handshake};
use paw_p2p::{
    discovery, DisconnectReason, Message, MessageCodec, NetworkEvent, PenaltyReason, PeerAddress, PeerId,
    HANDSHAKE_SIZE, MAX_MESSAGE_SIZE,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

async fn connect(node: &TestNode) -> TcpStream {
    TcpStream::connect(node.address.endpoint()).await.unwrap()
}

/// Handshake as `raw` and return the stream.
async fn handshaken(node: &mut TestNode, raw: &str) -> TcpStream {
    let mut stream = connect(node).await;
    let local = Handshake::new(TEST_CHAIN, raw);
    let outcome = handshake::initiate(&mut stream, &local, Some(node.id()), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(outcome.peer_id, *node.id());
    node.wait_for(|e| matches!(e, NetworkEvent::PeerConnected { .. })).await;
    stream
}

/// Read one frame from a raw stream.
async fn read_frame(stream: &mut TcpStream) -> Message {
    let mut codec = MessageCodec::new();
    let mut buf = bytes::BytesMut::new();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(msg) = codec.decode(&mut buf).unwrap() {
                return msg;
            }
            let n = stream.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed before a full frame");
        }
    })
    .await
    .expect("no frame received")
}

async fn write_message(stream: &mut TcpStream, msg_type: &str, payload: &[u8]) {
    let frame = codec::encode(msg_type, payload, MAX_MESSAGE_SIZE).unwrap();
    stream.write_all(&frame).await.unwrap();
}

#[tokio::test]
async fn test_version_mismatch_gets_no_reply() {
    let node = TestNode::spawn(test_config("node-a")).await;
    let mut stream = connect(&node).await;

    let wrong = Handshake::with_version(2, TEST_CHAIN, "raw");
    stream.write_all(&wrong.serialize()).await.unwrap();

    let mut buf = [0u8; HANDSHAKE_SIZE];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection left open");
    // Closed (or reset) without a handshake reply.
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(node.manager.stats().handshake_failures, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_times_out_handshake() {
    let node = TestNode::spawn(test_config("node-a")).await;
    let mut stream = connect(&node).await;

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("responder never gave up");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(node.manager.peer_count(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_ping_answered_not_delivered() {
    let mut node = TestNode::spawn(test_config("node-a")).await;
    let mut stream = handshaken(&mut node, "raw").await;

    write_message(&mut stream, MSG_PING, b"").await;
    write_message(&mut stream, "tx", b"payload").await;

    let reply = read_frame(&mut stream).await;
    assert_eq!(reply.msg_type, MSG_PONG);

    match node.wait_for(|e| matches!(e, NetworkEvent::MessageReceived { .. })).await {
        NetworkEvent::MessageReceived { message, .. } => {
            assert_eq!(message.msg_type, "tx");
            assert_eq!(&message.payload[..], b"payload");
        }
        other => panic!("unexpected event {:?}", other),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn test_pex_request_answered_with_pool() {
    let mut node = TestNode::spawn(test_config("node-a")).await;
    node.manager
        .add_candidate(PeerAddress::new("node-x", "10.0.0.9", 26656).unwrap());
    node.manager
        .add_candidate(PeerAddress::new("raw", "10.0.0.10", 26656).unwrap());
    let mut stream = handshaken(&mut node, "raw").await;

    write_message(&mut stream, MSG_PEX_REQUEST, &[discovery::DISCOVERY_REQUEST]).await;
    let reply = read_frame(&mut stream).await;
    assert_eq!(reply.msg_type, MSG_PEX_RESPONSE);

    let peers = discovery::decode_peer_list(&reply.payload).await.unwrap();
    let ids: Vec<&str> = peers.iter().map(|p| p.id().as_str()).collect();
    assert_eq!(ids, vec!["node-x"]);

    node.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_disconnects_with_violation() {
    let mut node = TestNode::spawn(test_config("node-a")).await;
    let mut stream = handshaken(&mut node, "raw").await;

    // Header only: the body is never sent, the length alone must be refused.
    let total = (MAX_MESSAGE_SIZE + 1) as u32;
    stream.write_all(&total.to_be_bytes()).await.unwrap();
    stream.write_all(&2u16.to_be_bytes()).await.unwrap();

    match node.wait_for(|e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await {
        NetworkEvent::PeerDisconnected { reason, .. } => {
            assert_eq!(reason.penalty(), Some(PenaltyReason::OversizedFrame));
            assert!(reason.is_protocol_violation());
        }
        other => panic!("unexpected event {:?}", other),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn test_stalled_frame_times_out() {
    let mut config = test_config("node-a");
    config.read_timeout = Duration::from_millis(200);
    let mut node = TestNode::spawn(config).await;
    let mut stream = handshaken(&mut node, "raw").await;

    // Promise a 100-byte frame and deliver only its header.
    stream.write_all(&100u32.to_be_bytes()).await.unwrap();

    match node.wait_for(|e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await {
        NetworkEvent::PeerDisconnected { reason, .. } => {
            assert_eq!(reason.penalty(), Some(PenaltyReason::StalledFrame));
        }
        other => panic!("unexpected event {:?}", other),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn test_clean_close_reported_as_remote_closed() {
    let mut node = TestNode::spawn(test_config("node-a")).await;
    let stream = handshaken(&mut node, "raw").await;
    drop(stream);

    match node.wait_for(|e| matches!(e, NetworkEvent::PeerDisconnected { .. })).await {
        NetworkEvent::PeerDisconnected { reason, .. } => assert_eq!(reason, DisconnectReason::RemoteClosed),
        other => panic!("unexpected event {:?}", other),
    }

    node.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_identity_replaces_older_link() {
    let oracle = ScriptedOracle::new();
    let mut node = TestNode::spawn_with(test_config("node-a"), oracle.clone()).await;
    let dup = PeerId::from("dup");

    let mut first = handshaken(&mut node, "dup").await;
    let mut second = handshaken(&mut node, "dup").await;

    // The node closes the older link.
    let mut buf = [0u8; 256];
    tokio::time::timeout(Duration::from_secs(2), async {
        while let Ok(n) = first.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    })
    .await
    .expect("older link left open");

    tokio::time::timeout(Duration::from_secs(2), async {
        while !oracle.disconnects().contains(&(dup.clone(), DisconnectReason::Replaced)) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("older link never reported as replaced");

    // Its teardown left the successor registered and working.
    assert_eq!(node.manager.peer_count(), 1);
    assert!(node.manager.is_connected(&dup));
    assert_eq!(node.manager.stats().disconnections, 1);

    write_message(&mut second, "tx", b"after").await;
    match node.wait_for(|e| matches!(e, NetworkEvent::MessageReceived { .. })).await {
        NetworkEvent::MessageReceived { peer_id, message } => {
            assert_eq!(peer_id, dup);
            assert_eq!(&message.payload[..], b"after");
        }
        other => panic!("unexpected event {:?}", other),
    }

    node.shutdown().await;
}

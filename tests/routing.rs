//! Integration tests for the routing engine: store-and-forward, fan-out
//! over redundant paths, hub relay with on-demand dialing, and the TTL
//! normalization rules.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use voxmesh::{KeyRing, Message, MessageCode, PeerId, RoutingEngine};

mod common;
use common::{start_hub, wait_for, TestHub, TEST_TIMEOUT};

/// Seal a small SIP response to `recipient`, signed by `sender`'s ring.
/// Delivered copies surface as datagrams at the recipient hub's local
/// signaling endpoint, which makes per-copy delivery observable.
async fn sealed_response(sender: &Arc<RoutingEngine>, recipient: PeerId, marker: &str) -> Vec<u8> {
    let keys = sender.get_entity_keys(recipient).await;
    let sip = format!("SIP/2.0 200 {marker}\r\nCall-ID: {marker}\r\nCSeq: 1 OPTIONS\r\n\r\n");
    voxmesh::seal(sender.ring(), &keys, sip.as_bytes())
}

/// Connect two hubs, wait out the entity exchange, and attach a local
/// UDP client to the receiving hub's signaling endpoint.
async fn linked_with_client(hub_a: &TestHub, hub_b: &TestHub) -> UdpSocket {
    hub_a
        .hub
        .dial(hub_b.hub.local_addr().expect("addr"))
        .await
        .expect("dial");

    let (a, b) = (hub_a.hub.engine().clone(), hub_b.hub.engine().clone());
    let (a_id, b_id) = (hub_a.hub.peer_id(), hub_b.hub.peer_id());
    wait_for("entity key exchange", || {
        let (a, b) = (a.clone(), b.clone());
        async move { a.entity_keys(&b_id).await.is_some() && b.entity_keys(&a_id).await.is_some() }
    })
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("client");
    client
        .send_to(b"poke", hub_b.hub.signaling_addr().expect("sig addr"))
        .await
        .expect("poke");
    tokio::time::sleep(Duration::from_millis(100)).await;
    client
}

#[tokio::test]
async fn unroutable_message_is_held_under_recipient_key() {
    let hub = start_hub().await;
    let stranger = KeyRing::generate().peer_id();

    let message = Message::new(stranger, 5, MessageCode::Command, b"hello".to_vec());
    hub.hub.engine().route_message(message.clone()).await;

    let held = hub
        .hub
        .engine()
        .queue()
        .dequeue_by_key(&stranger.to_hex())
        .expect("queue read")
        .expect("message must be held");
    assert_eq!(held, message, "held message must be byte-identical, TTL unspent");

    hub.hub.shutdown().await;
}

#[tokio::test]
async fn held_messages_flush_when_the_peer_connects() {
    let hub_a = start_hub().await;
    let hub_b = start_hub().await;
    let b_id = hub_b.hub.peer_id();

    // No route for B yet: the message is held.
    let message = Message::new(b_id, 5, MessageCode::Command, b"stored".to_vec());
    hub_a.hub.engine().route_message(message).await;
    assert_eq!(
        hub_a.hub.engine().queue().len(),
        1,
        "message must be waiting in the queue"
    );

    // Connecting to B triggers an immediate flush for B's key.
    hub_a
        .hub
        .dial(hub_b.hub.local_addr().expect("addr"))
        .await
        .expect("dial");

    let engine = hub_a.hub.engine().clone();
    wait_for("held message to drain after connect", || {
        let engine = engine.clone();
        let key = b_id.to_hex();
        async move {
            engine
                .queue()
                .dequeue_by_key(&key)
                .map(|found| found.is_none())
                .unwrap_or(false)
                && engine.queue().is_empty()
        }
    })
    .await;

    hub_a.hub.shutdown().await;
    hub_b.hub.shutdown().await;
}

#[tokio::test]
async fn fan_out_sends_on_every_redundant_path() {
    let hub_a = start_hub().await;
    let hub_b = start_hub().await;
    let b_id = hub_b.hub.peer_id();

    let client_b = linked_with_client(&hub_a, &hub_b).await;

    // A second, independent connection to the same peer.
    hub_a
        .hub
        .engine()
        .connect_hub(hub_b.hub.local_addr().expect("addr"))
        .await
        .expect("second dial");
    assert_eq!(
        hub_a.hub.engine().connection_count(&b_id).await,
        2,
        "both connections must be registered for the peer"
    );

    // One routed message, two redundant paths: B decrypts and delivers a
    // copy per path (at-least-once, no forwarder dedup), each having
    // spent exactly one TTL unit in transit.
    let sealed = sealed_response(hub_a.hub.engine(), b_id, "fanout").await;
    let message = Message::new(b_id, 3, MessageCode::Application, sealed);
    hub_a.hub.engine().route_message(message).await;

    let mut buf = vec![0u8; 64 * 1024];
    for copy in 1..=2 {
        let (n, _) = timeout(TEST_TIMEOUT, client_b.recv_from(&mut buf))
            .await
            .unwrap_or_else(|_| panic!("fan-out copy {copy} must arrive"))
            .expect("recv");
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(text.contains("fanout"), "unexpected delivery: {text}");
    }

    hub_a.hub.shutdown().await;
    hub_b.hub.shutdown().await;
}

#[tokio::test]
async fn dead_redundant_connection_is_pruned() {
    let hub_a = start_hub().await;
    let hub_b = start_hub().await;
    let b_id = hub_b.hub.peer_id();

    let client_b = linked_with_client(&hub_a, &hub_b).await;
    hub_a
        .hub
        .engine()
        .connect_hub(hub_b.hub.local_addr().expect("addr"))
        .await
        .expect("second dial");
    assert_eq!(hub_a.hub.engine().connection_count(&b_id).await, 2);

    // Kill one path at the transport level; the dispatcher must notice
    // and remove exactly that connection from the table.
    let paths = hub_a.hub.engine().peer_connections(&b_id).await;
    paths[0].close();

    let engine = hub_a.hub.engine().clone();
    wait_for("dead connection to be pruned", || {
        let engine = engine.clone();
        async move { engine.connection_count(&b_id).await == 1 }
    })
    .await;
    assert!(
        engine.connected_peers().await.contains(&b_id),
        "the surviving path must keep the peer registered"
    );

    // The survivor still carries traffic.
    let sealed = sealed_response(hub_a.hub.engine(), b_id, "survivor").await;
    engine
        .route_message(Message::new(b_id, 3, MessageCode::Application, sealed))
        .await;
    let mut buf = vec![0u8; 64 * 1024];
    let (n, _) = timeout(TEST_TIMEOUT, client_b.recv_from(&mut buf))
        .await
        .expect("survivor must deliver")
        .expect("recv");
    assert!(String::from_utf8_lossy(&buf[..n]).contains("survivor"));

    hub_a.hub.shutdown().await;
    hub_b.hub.shutdown().await;
}

#[tokio::test]
async fn directory_hub_entry_triggers_dial_and_relay() {
    let hub_a = start_hub().await;
    let hub_y = start_hub().await;

    // The directory knows that X is served by hub Y. A has no connection
    // to Y: routing to X must dial Y on demand and forward through it.
    let x = KeyRing::generate().peer_id();
    hub_a
        .directory
        .insert_for(x, hub_y.hub.engine().cookie().clone())
        .await;
    assert!(
        hub_a.hub.engine().connected_peers().await.is_empty(),
        "precondition: no live connections"
    );

    let message = Message::new(x, 5, MessageCode::Command, b"relay me".to_vec());
    hub_a.hub.engine().route_message(message).await;

    // Y receives the forwarded copy, has no route for X either, and holds
    // it, with the hop budget spent exactly once on the way.
    let y_engine = hub_y.hub.engine().clone();
    let key = x.to_hex();
    wait_for("relayed message to reach Y's queue", || {
        let y_engine = y_engine.clone();
        let key = key.clone();
        async move {
            y_engine
                .queue()
                .dequeue_by_key(&key)
                .map(|found| {
                    if let Some(message) = found {
                        assert_eq!(message.ttl, 4, "one hop must cost one TTL unit");
                        assert_eq!(message.payload, b"relay me");
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false)
        }
    })
    .await;

    assert!(
        hub_a
            .hub
            .engine()
            .connected_peers()
            .await
            .contains(&hub_y.hub.peer_id()),
        "the dialed hub must be registered as a connection"
    );

    hub_a.hub.shutdown().await;
    hub_y.hub.shutdown().await;
}

#[tokio::test]
async fn negative_ttl_is_rewritten_to_start_ttl() {
    let hub = start_hub().await;

    // An externally injected message arrives with ttl < 0; routing it is
    // equivalent to routing the same message with ttl = start_ttl and has
    // no other side effects. With no route it lands in the queue carrying
    // the rewritten budget, unspent.
    let stranger = KeyRing::generate().peer_id();
    let message = Message::new(stranger, -7, MessageCode::Command, b"norm".to_vec());
    hub.hub.engine().route_message(message).await;

    let held = hub
        .hub
        .engine()
        .queue()
        .dequeue_by_key(&stranger.to_hex())
        .expect("queue read")
        .expect("held message");
    assert_eq!(
        held.ttl,
        hub.hub.engine().start_ttl(),
        "ttl < 0 must be rewritten to the start TTL before any other step"
    );

    hub.hub.shutdown().await;
}

#[tokio::test]
async fn flush_retries_all_keys() {
    let hub = start_hub().await;
    let engine = hub.hub.engine().clone();

    let x = KeyRing::generate().peer_id();
    let y = KeyRing::generate().peer_id();
    engine
        .route_message(Message::new(x, 1, MessageCode::Command, b"x1".to_vec()))
        .await;
    engine
        .route_message(Message::new(y, 1, MessageCode::Command, b"y1".to_vec()))
        .await;
    assert_eq!(engine.queue().len(), 2);

    // A full flush with still no routes re-holds both; nothing is lost
    // and nothing spins.
    engine.flush_messages(None).await;
    assert_eq!(
        engine.queue().len(),
        2,
        "unroutable messages must survive a flush pass"
    );

    hub.hub.shutdown().await;
}

#[tokio::test]
async fn per_stream_sends_arrive_in_order() {
    let hub_a = start_hub().await;
    let hub_b = start_hub().await;
    let b_id = hub_b.hub.peer_id();

    let client_b = linked_with_client(&hub_a, &hub_b).await;

    // Two records down the one outbound stream must be read in send
    // order on the far side.
    let engine = hub_a.hub.engine().clone();
    let first = sealed_response(&engine, b_id, "first-record").await;
    let second = sealed_response(&engine, b_id, "second-record").await;
    engine
        .route_message(Message::new(b_id, 9, MessageCode::Application, first))
        .await;
    engine
        .route_message(Message::new(b_id, 9, MessageCode::Application, second))
        .await;

    let mut buf = vec![0u8; 64 * 1024];
    let (n, _) = timeout(TEST_TIMEOUT, client_b.recv_from(&mut buf))
        .await
        .expect("first record must arrive")
        .expect("recv");
    assert!(
        String::from_utf8_lossy(&buf[..n]).contains("first-record"),
        "FIFO order must hold per stream"
    );
    let (n, _) = timeout(TEST_TIMEOUT, client_b.recv_from(&mut buf))
        .await
        .expect("second record must arrive")
        .expect("recv");
    assert!(String::from_utf8_lossy(&buf[..n]).contains("second-record"));

    hub_a.hub.shutdown().await;
    hub_b.hub.shutdown().await;
}

#[tokio::test]
async fn delivery_never_reports_failure_to_sender() {
    // Routing API has no failure channel: routing to nowhere holds the
    // message and returns quietly.
    let hub = start_hub().await;
    let ghost = KeyRing::generate().peer_id();
    hub.hub
        .engine()
        .route_message(Message::new(ghost, 9, MessageCode::Application, vec![1]))
        .await;
    assert_eq!(hub.hub.engine().queue().len(), 1);
    hub.hub.shutdown().await;
}

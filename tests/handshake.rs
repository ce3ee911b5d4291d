//! Integration tests for the connection handshake.
//!
//! Covers the success path (two hubs authenticate each other and exchange
//! entity cookies) and the failure path (a responder that cannot echo the
//! nonce is rejected and never enters the routing table).

use std::time::Duration;

use tokio::time::sleep;

use voxmesh::{
    armor_encode, KeyRing, Message, MessageCode, PublicKeyMaterial, MESSAGE_BEGIN, MESSAGE_END,
    PUBLIC_KEY_BEGIN, PUBLIC_KEY_END,
};

mod common;
use common::{start_hub, wait_for, BlockReader};

#[tokio::test]
async fn handshake_success_exchanges_identities() {
    let hub_a = start_hub().await;
    let hub_b = start_hub().await;

    let remote = hub_a
        .hub
        .dial(hub_b.hub.local_addr().expect("addr"))
        .await
        .expect("dial must succeed");
    assert_eq!(
        remote,
        hub_b.hub.peer_id(),
        "remote connection id must equal the fingerprint of the remote key"
    );

    // Both sides register the connection under the other's fingerprint.
    let a = hub_a.hub.engine().clone();
    let b = hub_b.hub.engine().clone();
    let (a_id, b_id) = (hub_a.hub.peer_id(), hub_b.hub.peer_id());

    wait_for("connection registration on both sides", || {
        let (a, b) = (a.clone(), b.clone());
        async move {
            a.connected_peers().await.contains(&b_id) && b.connected_peers().await.contains(&a_id)
        }
    })
    .await;

    // The post-handshake entity announcements must complete the cookie
    // exchange in both directions.
    wait_for("entity key exchange", || {
        let (a, b) = (a.clone(), b.clone());
        async move { a.entity_keys(&b_id).await.is_some() && b.entity_keys(&a_id).await.is_some() }
    })
    .await;

    let material = a.entity_keys(&b_id).await.expect("checked above");
    assert_eq!(
        material.fingerprint(),
        b_id,
        "imported cookie keys must fingerprint to the announcing peer"
    );

    hub_a.hub.shutdown().await;
    hub_b.hub.shutdown().await;
}

#[tokio::test]
async fn handshake_failure_on_bad_nonce_echo() {
    // A hostile responder that completes the key exchange but echoes a
    // different nonce than the one it was challenged with.
    let responder_ring = KeyRing::generate();
    let (certs, key) = voxmesh::load_credentials(None, None).expect("credentials");
    let server_config = voxmesh::create_server_config(certs, key).expect("server config");
    let endpoint =
        quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().expect("addr")).expect("bind");
    let rogue_addr = endpoint.local_addr().expect("addr");

    let rogue = tokio::spawn(async move {
        let incoming = endpoint.accept().await.expect("one connection");
        let conn = incoming.await.expect("accept");
        let (mut send, recv) = conn.accept_bi().await.expect("stream");
        let mut reader = BlockReader::new(recv);

        // Key exchange proceeds normally.
        let ours = armor_encode(
            PUBLIC_KEY_BEGIN,
            PUBLIC_KEY_END,
            &responder_ring.public_material().encode(),
        );
        send.write_all(ours.as_bytes()).await.expect("write key");
        let their_blob = reader.read_block(PUBLIC_KEY_BEGIN, PUBLIC_KEY_END).await;
        let initiator = PublicKeyMaterial::decode(&their_blob).expect("decode peer key");

        // Open the challenge, then echo 64 bytes of something else.
        let sealed = reader.read_block(MESSAGE_BEGIN, MESSAGE_END).await;
        let _nonce = voxmesh::open(&responder_ring, &initiator, &sealed).expect("open challenge");
        let wrong = vec![0u8; 64];
        let echo = voxmesh::seal(&responder_ring, &initiator, &wrong);
        let block = armor_encode(MESSAGE_BEGIN, MESSAGE_END, &echo);
        send.write_all(block.as_bytes()).await.expect("write echo");

        // Hold the connection open so the initiator reads the bad echo.
        sleep(Duration::from_secs(2)).await;
    });

    let hub = start_hub().await;
    let result = hub.hub.dial(rogue_addr).await;
    assert!(result.is_err(), "nonce mismatch must fail the handshake");

    // The rogue peer must not appear in the routing table.
    assert!(
        hub.hub.engine().connected_peers().await.is_empty(),
        "failed handshake must not register a connection"
    );

    rogue.abort();
    hub.hub.shutdown().await;
}

#[tokio::test]
async fn keepalive_pings_flow_between_hubs() {
    let hub_a = start_hub().await;
    let hub_b = start_hub().await;

    hub_a
        .hub
        .dial(hub_b.hub.local_addr().expect("addr"))
        .await
        .expect("dial");

    // Keepalives are Commands addressed to the neighbor; they must be
    // accepted and ignored without disturbing the connection. Outlive one
    // full keepalive period and verify the link is still registered.
    sleep(voxmesh::KEEPALIVE_PERIOD + Duration::from_millis(500)).await;

    assert!(
        hub_a
            .hub
            .engine()
            .connected_peers()
            .await
            .contains(&hub_b.hub.peer_id()),
        "connection must survive keepalive traffic"
    );

    hub_a.hub.shutdown().await;
    hub_b.hub.shutdown().await;
}

#[tokio::test]
async fn unknown_commands_are_ignored() {
    let hub_a = start_hub().await;
    let hub_b = start_hub().await;

    hub_a
        .hub
        .dial(hub_b.hub.local_addr().expect("addr"))
        .await
        .expect("dial");

    // A command B has never heard of must be swallowed without effect.
    let strange = Message::new(
        hub_b.hub.peer_id(),
        5,
        MessageCode::Command,
        b"FROBNICATE".to_vec(),
    );
    hub_a.hub.engine().route_message(strange).await;
    sleep(Duration::from_millis(300)).await;

    assert!(
        hub_a
            .hub
            .engine()
            .connected_peers()
            .await
            .contains(&hub_b.hub.peer_id()),
        "unknown commands must not tear the connection down"
    );

    hub_a.hub.shutdown().await;
    hub_b.hub.shutdown().await;
}

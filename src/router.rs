//! # Routing Engine
//!
//! The routing nucleus of a hub: a [`RoutingTable`] of live connections,
//! entity-key latches, and response-routing memory, driven by a
//! [`RoutingEngine`] that classifies every inbound record as local or
//! forwarded and implements the forwarding policy: direct fan-out,
//! on-demand hub dialing, user fan-out to owned nodes, node redirection to
//! the hub that saw them last, and store-and-forward for everything else.
//!
//! ## Ownership
//!
//! Connections publish records into per-connection channels; the engine
//! runs one dispatch task per channel and one flush task per peer, the
//! latter replaced on every registration. Connections never call back
//! into the engine, which keeps the ownership graph acyclic. Cancel
//! handles live in the table beside the connections, not inside them.
//!
//! ## Forwarding Policy
//!
//! | Condition | Action |
//! |-----------|--------|
//! | `ttl < 0` | Rewrite to the configured start TTL, route once more |
//! | direct connections exist | Send `ttl - 1` on every one in parallel |
//! | directory says hub | Dial it (5 s budget), register, re-route via it |
//! | directory says user | Re-route to every owned node in parallel |
//! | directory says node seen here | Hold under the last-seen-hub key |
//! | directory says node seen elsewhere | Re-route via that hub |
//! | nothing | Hold under the recipient key |
//!
//! Delivery is at-least-once: fan-out across redundant paths may duplicate
//! downstream, and no forwarder deduplicates.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::connection::{HandshakeRole, PeerConnection};
use crate::cookie::{Cookie, CookieBody};
use crate::crypto;
use crate::directory::Directory;
use crate::identity::{KeyRing, PeerId, PublicKeyMaterial};
use crate::messages::{Message, MessageCode};
use crate::queue::MessageQueue;

/// Budget for dialing a hub on demand.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the response-routing memory.
/// SECURITY: A flood of unanswered requests must not grow the map without
/// limit; old call ids fall out first.
const CALLER_MAP_CAPACITY: usize = 4096;

/// One-shot completion latch.
///
/// Starts pending; the first `try_set` fulfills it and every waiter, past
/// and future, observes that same value. Later set attempts are no-ops.
pub struct Latch<T: Clone> {
    cell: watch::Sender<Option<T>>,
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Self {
        let (cell, _) = watch::channel(None);
        Self { cell }
    }

    /// Fulfill the latch. Returns true if this call was the first setter.
    pub fn try_set(&self, value: T) -> bool {
        self.cell.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        })
    }

    /// The fulfilled value, if any.
    pub fn get(&self) -> Option<T> {
        self.cell.borrow().clone()
    }

    /// Wait until the latch is fulfilled. No timeout is imposed here;
    /// callers bring their own.
    pub async fn wait(&self) -> T {
        let mut rx = self.cell.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            rx.changed()
                .await
                .expect("latch sender lives as long as the latch");
        }
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A decrypted Application payload handed to the signaling adapter.
#[derive(Debug)]
pub struct InboundApplication {
    pub sender: PeerId,
    pub plaintext: Vec<u8>,
}

/// The process-wide routing state.
///
/// Each map carries its own lock so handlers touch only what they need;
/// the per-peer connection set is mutated under the outer write lock.
struct RoutingTable {
    connections: RwLock<HashMap<PeerId, Vec<Arc<PeerConnection>>>>,
    entity_keys: RwLock<HashMap<PeerId, Arc<Latch<PublicKeyMaterial>>>>,
    caller_map: Mutex<LruCache<String, PeerId>>,
    /// Per-peer flush task; replaced (cancel, join, respawn) on every
    /// registration for that peer.
    flush_tasks: Mutex<HashMap<PeerId, JoinHandle<()>>>,
    /// Per-connection dispatch tasks. Each ends when its connection's
    /// transport or event channel closes, pruning the connection from the
    /// table on the way out; the list exists so shutdown can cancel
    /// stragglers.
    dispatchers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl RoutingTable {
    fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            entity_keys: RwLock::new(HashMap::new()),
            caller_map: Mutex::new(LruCache::new(
                NonZeroUsize::new(CALLER_MAP_CAPACITY).expect("capacity is non-zero"),
            )),
            flush_tasks: Mutex::new(HashMap::new()),
            dispatchers: std::sync::Mutex::new(Vec::new()),
        }
    }
}

/// The fingerprint-addressed forwarder at the heart of a hub.
pub struct RoutingEngine {
    id: PeerId,
    ring: KeyRing,
    cookie: Cookie,
    start_ttl: i32,
    forward_on_zero_ttl: bool,
    table: RoutingTable,
    queue: Arc<MessageQueue>,
    directory: Arc<dyn Directory>,
    endpoint: quinn::Endpoint,
    client_config: quinn::ClientConfig,
    app_tx: mpsc::Sender<InboundApplication>,
}

impl RoutingEngine {
    /// Build the engine. The returned receiver yields decrypted
    /// Application payloads for the signaling adapter.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ring: KeyRing,
        cookie: Cookie,
        start_ttl: i32,
        forward_on_zero_ttl: bool,
        queue: Arc<MessageQueue>,
        directory: Arc<dyn Directory>,
        endpoint: quinn::Endpoint,
        client_config: quinn::ClientConfig,
    ) -> (Arc<Self>, mpsc::Receiver<InboundApplication>) {
        let (app_tx, app_rx) = mpsc::channel(256);
        let engine = Arc::new(Self {
            id: ring.peer_id(),
            ring,
            cookie,
            start_ttl,
            forward_on_zero_ttl,
            table: RoutingTable::new(),
            queue,
            directory,
            endpoint,
            client_config,
            app_tx,
        });
        (engine, app_rx)
    }

    pub fn local_id(&self) -> PeerId {
        self.id
    }

    pub fn ring(&self) -> &KeyRing {
        &self.ring
    }

    pub fn cookie(&self) -> &Cookie {
        &self.cookie
    }

    pub fn start_ttl(&self) -> i32 {
        self.start_ttl
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Peers with at least one live direct connection.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.table.connections.read().await.keys().copied().collect()
    }

    /// Number of redundant direct connections registered for a peer.
    pub async fn connection_count(&self, peer: &PeerId) -> usize {
        self.table
            .connections
            .read()
            .await
            .get(peer)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Live connections registered for a peer.
    pub async fn peer_connections(&self, peer: &PeerId) -> Vec<Arc<PeerConnection>> {
        self.table
            .connections
            .read()
            .await
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    /// An `Entity` message carrying our signed cookie.
    pub fn entity_message(&self, recipient: PeerId) -> Message {
        let payload = self
            .cookie
            .encode()
            .expect("own cookie serialization cannot fail");
        Message::new(recipient, self.start_ttl, MessageCode::Entity, payload)
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Register an authenticated connection under `peer`.
    ///
    /// When `events` is present a dispatch task for the connection starts
    /// feeding the inbound dispatcher; when the transport or the event
    /// channel closes it removes the connection from the table via
    /// [`close_connection`](Self::close_connection). In every case the
    /// prior flush task keyed on `peer` is cancelled and joined, and a
    /// fresh one drains held messages for the peer.
    pub fn open_connection<'a>(
        self: &'a Arc<Self>,
        conn: Arc<PeerConnection>,
        events: Option<mpsc::Receiver<Message>>,
        peer: PeerId,
        bootstrap: Option<Message>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        // Boxed so the call through dispatch_inbound -> import_cookie ->
        // open_connection (re-registering a connection after its entity
        // cookie arrives) is a concrete, explicitly Send type rather than
        // a self-referential opaque one; otherwise the compiler cannot
        // resolve Send for the recursive future.
        Box::pin(async move {
            {
                let mut connections = self.table.connections.write().await;
                let set = connections.entry(peer).or_default();
                if !set.iter().any(|c| Arc::ptr_eq(c, &conn)) {
                    set.push(conn.clone());
                }
            }

            if let Some(message) = bootstrap {
                if let Err(e) = conn.send(&message).await {
                    debug!(peer = %peer, error = %e, "bootstrap send failed");
                }
            }

            if let Some(mut rx) = events {
                let engine = self.clone();
                let conn = conn.clone();
                let dispatcher = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            message = rx.recv() => match message {
                                Some(message) => engine.dispatch_inbound(&conn, message).await,
                                None => break,
                            },
                            _ = conn.closed() => {
                                debug!(peer = %peer, "transport closed");
                                break;
                            }
                        }
                    }
                    // A dead connection must leave the table so routing stops
                    // picking it and its flush task is cancelled.
                    engine.close_connection(&conn, peer).await;
                });
                self.table
                    .dispatchers
                    .lock()
                    .expect("dispatcher registry poisoned")
                    .push(dispatcher);
            }

            let prior = self.table.flush_tasks.lock().await.remove(&peer);
            if let Some(prior) = prior {
                prior.abort();
                // Cancellation of a superseded flush task is expected.
                let _ = prior.await;
            }
            let engine = self.clone();
            let flush = tokio::spawn(async move {
                engine.flush_messages(Some(peer)).await;
            });
            self.table.flush_tasks.lock().await.insert(peer, flush);
        })
    }

    /// Remove `conn` from the peer's connection set, cancelling the
    /// peer's flush task; the connection itself is disposed only once no
    /// table entry references it.
    pub async fn close_connection(&self, conn: &Arc<PeerConnection>, peer: PeerId) {
        let task = self.table.flush_tasks.lock().await.remove(&peer);
        if let Some(task) = task {
            task.abort();
            // Cancellation during teardown is the expected outcome.
            let _ = task.await;
        }

        let still_referenced = {
            let mut connections = self.table.connections.write().await;
            if let Some(set) = connections.get_mut(&peer) {
                set.retain(|c| !Arc::ptr_eq(c, conn));
                if set.is_empty() {
                    connections.remove(&peer);
                }
            }
            connections
                .values()
                .any(|set| set.iter().any(|c| Arc::ptr_eq(c, conn)))
        };

        if !still_referenced {
            conn.close();
        }
    }

    /// Dial a hub, run the handshake as initiator, register the
    /// connection, and announce ourselves with an `Entity` message.
    pub async fn connect_hub(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<PeerId> {
        use anyhow::Context;

        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), addr, "voxmesh")
            .with_context(|| format!("failed to initiate connection to {addr}"))?;
        let conn = connecting
            .await
            .with_context(|| format!("failed to establish connection to {addr}"))?;

        let (connection, events) = PeerConnection::new(conn);
        let peer = connection
            .authenticate(&self.ring, HandshakeRole::Initiator)
            .await
            .context("handshake failed")?;

        self.open_connection(connection, Some(events), peer, None).await;
        self.route_message(self.entity_message(peer)).await;
        Ok(peer)
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Classify one inbound record: ours to process, or forwarded.
    pub async fn dispatch_inbound(self: &Arc<Self>, conn: &Arc<PeerConnection>, message: Message) {
        if message.recipient == self.id {
            self.process_local(Some(conn), message).await;
        } else {
            self.route_message(message).await;
        }
    }

    async fn process_local(self: &Arc<Self>, conn: Option<&Arc<PeerConnection>>, message: Message) {
        match message.code {
            MessageCode::Entity => self.import_cookie(conn, &message.payload).await,
            MessageCode::Application => self.handle_application(&message.payload).await,
            MessageCode::Command => {
                // Ping and anything we don't know: accept and ignore.
                trace!(payload_len = message.payload.len(), "command received");
            }
        }
    }

    /// Import a peer's cookie from an `Entity` message.
    ///
    /// The first cookie for a peer fulfills its entity-key latch,
    /// registers the carrying connection under the announced fingerprint,
    /// and answers with our own cookie so the exchange completes from the
    /// remote's perspective. Every later cookie for the same peer is a
    /// no-op.
    async fn import_cookie(self: &Arc<Self>, conn: Option<&Arc<PeerConnection>>, payload: &[u8]) {
        let cookie = match Cookie::decode(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "dropping undecodable entity cookie");
                return;
            }
        };
        let material = match cookie.verify() {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %cookie.key, error = %e, "dropping cookie that failed verification");
                return;
            }
        };
        let peer = cookie.key;

        let latch = self.entity_latch(peer).await;
        if !latch.try_set(material) {
            trace!(peer = %peer, "entity keys already known");
            return;
        }
        debug!(peer = %peer, "imported entity keys");

        if let Some(conn) = conn {
            let hello = Message::new(peer, 0, MessageCode::Command, Vec::new());
            self.open_connection(conn.clone(), None, peer, Some(hello)).await;
        }

        self.route_message(self.entity_message(peer)).await;
    }

    /// Decrypt an Application payload and hand it to the signaling side.
    async fn handle_application(&self, payload: &[u8]) {
        let signer = match crypto::envelope_signer(payload) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "dropping malformed application envelope");
                return;
            }
        };
        let Some(material) = self.entity_keys(&signer).await else {
            warn!(signer = %signer, "dropping application payload from peer with unknown keys");
            return;
        };
        match crypto::open(&self.ring, &material, payload) {
            Ok(plaintext) => {
                if self
                    .app_tx
                    .send(InboundApplication {
                        sender: signer,
                        plaintext,
                    })
                    .await
                    .is_err()
                {
                    debug!("signaling adapter is gone; application payload dropped");
                }
            }
            Err(e) => {
                warn!(signer = %signer, error = %e, "dropping undecryptable application payload");
            }
        }
    }

    // ========================================================================
    // Forwarding
    // ========================================================================

    /// Route one message toward its recipient.
    pub async fn route_message(self: &Arc<Self>, message: Message) {
        self.route_via(message, None).await;
    }

    fn route_via(
        self: &Arc<Self>,
        mut message: Message,
        via: Option<PeerId>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'static>> {
        let engine = self.clone();
        Box::pin(async move {
            // Externally injected messages arrive with a negative TTL;
            // normalize exactly once and route again.
            if message.ttl < 0 {
                message.ttl = engine.start_ttl;
                return engine.route_via(message, via).await;
            }

            let target = via.unwrap_or(message.recipient);

            let direct: Vec<Arc<PeerConnection>> = {
                let connections = engine.table.connections.read().await;
                connections.get(&target).cloned().unwrap_or_default()
            };

            if !direct.is_empty() {
                if message.ttl == 0 && !engine.forward_on_zero_ttl {
                    debug!(recipient = %message.recipient, "dropping message with spent hop budget");
                    return;
                }
                let copy = message.forwarded();
                let mut sends = JoinSet::new();
                for conn in direct {
                    let outgoing = copy.clone();
                    sends.spawn(async move { conn.send(&outgoing).await });
                }
                let mut delivered = false;
                while let Some(result) = sends.join_next().await {
                    match result {
                        Ok(Ok(())) => delivered = true,
                        Ok(Err(e)) => debug!(target = %target, error = %e, "send on one path failed"),
                        Err(e) => debug!(target = %target, error = %e, "send task failed"),
                    }
                }
                if !delivered {
                    engine.hold(&target.to_string(), &message);
                }
                return;
            }

            match engine.directory.lookup(&target).await {
                Some(cookie) => match cookie.body.clone() {
                    CookieBody::Hub { .. } => {
                        engine.route_through_hub(message, &cookie).await;
                    }
                    CookieBody::User { owned_nodes } => {
                        let mut fanout = JoinSet::new();
                        for node in owned_nodes {
                            let readdressed = message.readdressed(node);
                            let node_engine = engine.clone();
                            fanout.spawn(async move {
                                node_engine.route_message(readdressed).await;
                            });
                        }
                        while fanout.join_next().await.is_some() {}
                    }
                    CookieBody::Node {
                        most_recently_seen_by,
                    } => {
                        if most_recently_seen_by == engine.id {
                            engine.hold(&most_recently_seen_by.to_string(), &message);
                        } else {
                            engine.route_via(message, Some(most_recently_seen_by)).await;
                        }
                    }
                },
                None => {
                    engine.hold(&target.to_string(), &message);
                }
            }
        })
    }

    /// Dial the hub a cookie advertises and re-route through it.
    async fn route_through_hub(self: &Arc<Self>, message: Message, cookie: &Cookie) {
        let hub = cookie.key;
        let Some(addr) = cookie.service_uri().and_then(|uri| uri.parse::<SocketAddr>().ok())
        else {
            warn!(hub = %hub, "hub cookie has no usable service endpoint");
            self.hold(&message.recipient.to_string(), &message);
            return;
        };

        match tokio::time::timeout(DIAL_TIMEOUT, self.connect_hub(addr)).await {
            Ok(Ok(peer)) => {
                self.route_via(message, Some(peer)).await;
            }
            Ok(Err(e)) => {
                debug!(hub = %hub, error = %e, "hub dial failed; holding message");
                self.hold(&message.recipient.to_string(), &message);
            }
            Err(_) => {
                debug!(hub = %hub, "hub dial timed out; holding message");
                self.hold(&message.recipient.to_string(), &message);
            }
        }
    }

    fn hold(&self, key: &str, message: &Message) {
        trace!(key = %key, "no route; holding message");
        if let Err(e) = self.queue.enqueue(key, message) {
            warn!(key = %key, error = %e, "failed to hold undeliverable message");
        }
    }

    /// Drain held messages and re-route them: one key, or all of them.
    ///
    /// The batch is snapshotted before routing so a message that is held
    /// again (still no route) waits for the next pass instead of spinning.
    pub async fn flush_messages(self: &Arc<Self>, key: Option<PeerId>) {
        let keys = match key {
            Some(peer) => vec![peer.to_string()],
            None => match self.queue.keys() {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(error = %e, "failed to list held-message keys");
                    return;
                }
            },
        };

        for key in keys {
            let mut batch = Vec::new();
            loop {
                match self.queue.dequeue_by_key(&key) {
                    Ok(Some(message)) => batch.push(message),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to drain held messages");
                        break;
                    }
                }
            }
            if !batch.is_empty() {
                debug!(key = %key, count = batch.len(), "re-routing held messages");
            }
            for message in batch {
                self.route_message(message).await;
            }
        }
    }

    // ========================================================================
    // Entity keys
    // ========================================================================

    async fn entity_latch(&self, peer: PeerId) -> Arc<Latch<PublicKeyMaterial>> {
        let mut latches = self.table.entity_keys.write().await;
        latches.entry(peer).or_default().clone()
    }

    /// The peer's key material, if already exchanged.
    pub async fn entity_keys(&self, peer: &PeerId) -> Option<PublicKeyMaterial> {
        self.table.entity_keys.read().await.get(peer).and_then(|l| l.get())
    }

    /// The peer's key material, obtained on demand.
    ///
    /// Sends our cookie toward the peer (prompting theirs in return) and
    /// waits on the entity-key latch. No timeout is imposed here; callers
    /// apply their own.
    pub async fn get_entity_keys(self: &Arc<Self>, peer: PeerId) -> PublicKeyMaterial {
        let latch = self.entity_latch(peer).await;
        if let Some(material) = latch.get() {
            return material;
        }
        self.route_message(self.entity_message(peer)).await;
        latch.wait().await
    }

    // ========================================================================
    // Response-routing memory
    // ========================================================================

    /// Remember which peer originated a call so the response finds its
    /// way back.
    pub async fn remember_caller(&self, call_id: String, peer: PeerId) {
        self.table.caller_map.lock().await.put(call_id, peer);
    }

    /// Consume the caller entry for a call id.
    pub async fn take_caller(&self, call_id: &str) -> Option<PeerId> {
        self.table.caller_map.lock().await.pop(call_id)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Cancel every flush and dispatch task, then close every connection.
    pub async fn shutdown(&self) {
        let flush_tasks: Vec<_> = {
            let mut tasks = self.table.flush_tasks.lock().await;
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in flush_tasks {
            task.abort();
            let _ = task.await;
        }

        let dispatchers: Vec<_> = self
            .table
            .dispatchers
            .lock()
            .expect("dispatcher registry poisoned")
            .drain(..)
            .collect();
        for task in dispatchers {
            task.abort();
            let _ = task.await;
        }

        let mut connections = self.table.connections.write().await;
        for (_, set) in connections.drain() {
            for conn in set {
                conn.close();
            }
        }
    }
}

//! # Peer Connections
//!
//! One [`PeerConnection`] owns one QUIC connection to one neighbor. It
//! performs the mutual-authentication handshake, exposes `send` for framed
//! records, and publishes every inbound record to an event channel the
//! routing engine subscribes to; the connection knows nothing about
//! routing, which breaks the ownership cycle between the two.
//!
//! ## Handshake
//!
//! The handshake is an explicit state machine over one bidirectional
//! stream; each transition performs one I/O operation:
//!
//! ```text
//! AwaitEstablished → ExchangeKeys → SendNonce → VerifyNonce → Authenticated
//! ```
//!
//! Both sides write their armored public key block and read the remote
//! one. The initiator then seals a 64-byte random nonce to the remote key
//! (encrypt-and-sign) as an armored message; the responder opens it,
//! re-seals it back, and the initiator requires a byte-exact echo. Any
//! mismatch is fatal and tears the connection down.
//!
//! ## Multiplexing
//!
//! A single QUIC connection may carry several `(PeerId → stream)` pairs
//! when the remote hub aggregates downstream peers: a second handshake
//! over the same connection adds another stream pair, replacing (and
//! disposing) any prior entry for that peer. All streams publish into the
//! same event channel.
//!
//! ## Keepalive
//!
//! One task per connection emits a `Command "PING"` on every registered
//! stream every five seconds. Closing the connection aborts the keepalive
//! and every receive loop before closing the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::crypto::{self, SealError};
use crate::identity::{
    armor_decode, armor_encode, IdentityError, KeyRing, PeerId, PublicKeyMaterial, MESSAGE_BEGIN,
    MESSAGE_END, PUBLIC_KEY_BEGIN, PUBLIC_KEY_END,
};
use crate::messages::{decode_message, encode_message, record_len, Message, WireError};

/// Keepalive period.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);

/// Size of the handshake challenge nonce.
const NONCE_LEN: usize = 64;

/// Maximum size of one armored handshake block.
/// SECURITY: Bounds memory consumed by an endless stream with no marker.
const MAX_ARMOR_BLOCK: usize = 64 * 1024;

/// Capacity of the inbound event channel.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Error type for the connection handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("transport error during handshake: {0}")]
    Transport(String),
    #[error("stream closed before the handshake completed")]
    StreamClosed,
    #[error("armored block exceeds {MAX_ARMOR_BLOCK} bytes")]
    OversizedBlock,
    #[error("handshake block is not valid text")]
    NotText,
    #[error("bad armor: {0}")]
    Armor(#[from] IdentityError),
    #[error("nonce challenge failed: {0}")]
    Seal(#[from] SealError),
    #[error("nonce echo did not match the challenge")]
    NonceMismatch,
}

impl From<quinn::ConnectionError> for HandshakeError {
    fn from(e: quinn::ConnectionError) -> Self {
        HandshakeError::Transport(e.to_string())
    }
}

impl From<quinn::ReadError> for HandshakeError {
    fn from(e: quinn::ReadError) -> Self {
        HandshakeError::Transport(e.to_string())
    }
}

impl From<quinn::WriteError> for HandshakeError {
    fn from(e: quinn::WriteError) -> Self {
        HandshakeError::Transport(e.to_string())
    }
}

/// Error type for sending one record.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no outbound stream for recipient")]
    NoRoute,
    #[error("failed to encode record: {0}")]
    Encode(#[from] WireError),
    #[error("transport write failed: {0}")]
    Transport(#[from] quinn::WriteError),
}

/// Which side of the handshake we are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// Handshake progress; each transition is one I/O operation.
enum HandshakeState {
    AwaitEstablished,
    ExchangeKeys,
    SendNonce,
    VerifyNonce,
    Authenticated,
}

/// Buffered reader over a QUIC receive stream that understands armor
/// markers. Bytes past the final marker are retained and handed to the
/// record receive loop, since the remote may start streaming records
/// immediately after its last handshake block.
struct ArmorStream {
    recv: quinn::RecvStream,
    buf: Vec<u8>,
}

impl ArmorStream {
    fn new(recv: quinn::RecvStream) -> Self {
        Self {
            recv,
            buf: Vec::new(),
        }
    }

    async fn read_block(
        &mut self,
        begin: &'static str,
        end: &'static str,
    ) -> Result<Vec<u8>, HandshakeError> {
        loop {
            if let Some(pos) = find_subslice(&self.buf, end.as_bytes()) {
                let mut cut = pos + end.len();
                while matches!(self.buf.get(cut), Some(b'\r') | Some(b'\n')) {
                    cut += 1;
                }
                let block: Vec<u8> = self.buf.drain(..cut).collect();
                let text = std::str::from_utf8(&block).map_err(|_| HandshakeError::NotText)?;
                return Ok(armor_decode(begin, end, text)?);
            }
            if self.buf.len() > MAX_ARMOR_BLOCK {
                return Err(HandshakeError::OversizedBlock);
            }
            let mut chunk = [0u8; 4096];
            match self.recv.read(&mut chunk).await? {
                Some(n) => self.buf.extend_from_slice(&chunk[..n]),
                None => return Err(HandshakeError::StreamClosed),
            }
        }
    }

    fn into_parts(self) -> (quinn::RecvStream, Vec<u8>) {
        (self.recv, self.buf)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Pick the outbound stream for a target: exact entry, or the sole stream
/// of a single-peer neighbor. Ambiguity (several streams, none matching)
/// yields no route.
fn select_outbound<'a, T>(streams: &'a HashMap<PeerId, T>, recipient: &PeerId) -> Option<&'a T> {
    match streams.get(recipient) {
        Some(stream) => Some(stream),
        None if streams.len() == 1 => streams.values().next(),
        None => None,
    }
}

/// One authenticated QUIC connection to a neighbor.
pub struct PeerConnection {
    conn: quinn::Connection,
    outbound: RwLock<HashMap<PeerId, Arc<Mutex<quinn::SendStream>>>>,
    receive_tasks: std::sync::Mutex<HashMap<PeerId, JoinHandle<()>>>,
    keepalive: std::sync::Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::Sender<Message>,
}

impl PeerConnection {
    /// Wrap an established QUIC connection. The returned receiver yields
    /// every record decoded from any of the connection's streams.
    pub fn new(conn: quinn::Connection) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let connection = Arc::new(Self {
            conn,
            outbound: RwLock::new(HashMap::new()),
            receive_tasks: std::sync::Mutex::new(HashMap::new()),
            keepalive: std::sync::Mutex::new(None),
            events_tx,
        });
        (connection, events_rx)
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    /// Resolves once the underlying transport is closed, whether locally
    /// or by the peer.
    pub async fn closed(&self) {
        self.conn.closed().await;
    }

    /// Peers with a registered outbound stream on this connection.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.outbound.read().await.keys().copied().collect()
    }

    /// Run the mutual-authentication handshake over a fresh stream pair
    /// and register the resulting streams under the remote fingerprint.
    ///
    /// Calling this again on the same connection adds another stream pair
    /// (hub aggregation); the previous streams and receive task for that
    /// peer are disposed.
    pub async fn authenticate(
        self: &Arc<Self>,
        ring: &KeyRing,
        role: HandshakeRole,
    ) -> Result<PeerId, HandshakeError> {
        let (send, recv) = match role {
            HandshakeRole::Initiator => self.conn.open_bi().await?,
            HandshakeRole::Responder => self.conn.accept_bi().await?,
        };

        let (remote, send, armor) = run_handshake(ring, role, send, recv).await?;
        let (recv, leftover) = armor.into_parts();

        self.register_stream(remote, send, recv, leftover).await;
        self.ensure_keepalive();
        Ok(remote)
    }

    async fn register_stream(
        self: &Arc<Self>,
        peer: PeerId,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        leftover: Vec<u8>,
    ) {
        self.outbound
            .write()
            .await
            .insert(peer, Arc::new(Mutex::new(send)));

        let events = self.events_tx.clone();
        let task = tokio::spawn(receive_loop(peer, recv, leftover, events));
        let prior = self
            .receive_tasks
            .lock()
            .expect("receive task registry poisoned")
            .insert(peer, task);
        if let Some(prior) = prior {
            prior.abort();
        }
    }

    fn ensure_keepalive(self: &Arc<Self>) {
        let mut guard = self.keepalive.lock().expect("keepalive registry poisoned");
        if guard.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                let Some(conn) = weak.upgrade() else { break };
                for peer in conn.peers().await {
                    if let Err(e) = conn.send(&Message::ping(peer)).await {
                        debug!(peer = %peer, error = %e, "keepalive send failed");
                    }
                }
            }
        }));
    }

    /// Serialize one record onto the outbound stream for its recipient.
    ///
    /// Stream selection consults the outbound map, never the inbound one
    /// that only looks symmetric: an exact match wins; with exactly one
    /// registered stream the neighbor is unambiguous and that stream is
    /// used; otherwise there is no route.
    pub async fn send(&self, message: &Message) -> Result<(), SendError> {
        let stream = {
            let streams = self.outbound.read().await;
            select_outbound(&streams, &message.recipient)
                .cloned()
                .ok_or(SendError::NoRoute)?
        };

        let bytes = encode_message(message)?;
        // Per-stream mutex keeps records whole and preserves FIFO order.
        let mut guard = stream.lock().await;
        guard.write_all(&bytes).await?;
        Ok(())
    }

    /// Whether this connection has an outbound stream for `peer`.
    pub async fn has_peer(&self, peer: &PeerId) -> bool {
        self.outbound.read().await.contains_key(peer)
    }

    /// Abort all tasks and close the underlying transport.
    ///
    /// Also runs from `Drop`, so lock poisoning is tolerated rather than
    /// escalated.
    pub fn close(&self) {
        if let Ok(mut guard) = self.keepalive.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        if let Ok(mut tasks) = self.receive_tasks.lock() {
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }
        self.conn.close(0u32.into(), b"closing");
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drive the handshake state machine to completion.
async fn run_handshake(
    ring: &KeyRing,
    role: HandshakeRole,
    mut send: quinn::SendStream,
    recv: quinn::RecvStream,
) -> Result<(PeerId, quinn::SendStream, ArmorStream), HandshakeError> {
    let mut armor = ArmorStream::new(recv);
    let mut remote: Option<PublicKeyMaterial> = None;
    let mut challenge = [0u8; NONCE_LEN];
    let mut state = HandshakeState::AwaitEstablished;

    loop {
        state = match state {
            // The quinn Connection handle only exists once the QUIC
            // handshake finished, so establishment is already signaled.
            HandshakeState::AwaitEstablished => HandshakeState::ExchangeKeys,

            HandshakeState::ExchangeKeys => {
                let our_block = armor_encode(
                    PUBLIC_KEY_BEGIN,
                    PUBLIC_KEY_END,
                    &ring.public_material().encode(),
                );
                send.write_all(our_block.as_bytes()).await?;

                let their_block = armor.read_block(PUBLIC_KEY_BEGIN, PUBLIC_KEY_END).await?;
                let material = PublicKeyMaterial::decode(&their_block)?;
                trace!(remote = %material.fingerprint(), "exchanged key blocks");
                remote = Some(material);
                HandshakeState::SendNonce
            }

            HandshakeState::SendNonce => {
                let material = remote.as_ref().expect("keys exchanged before nonce");
                match role {
                    HandshakeRole::Initiator => {
                        OsRng.fill_bytes(&mut challenge);
                        let sealed = crypto::seal(ring, material, &challenge);
                        let block = armor_encode(MESSAGE_BEGIN, MESSAGE_END, &sealed);
                        send.write_all(block.as_bytes()).await?;
                    }
                    HandshakeRole::Responder => {
                        let sealed = armor.read_block(MESSAGE_BEGIN, MESSAGE_END).await?;
                        let nonce = crypto::open(ring, material, &sealed)?;
                        let echo = crypto::seal(ring, material, &nonce);
                        let block = armor_encode(MESSAGE_BEGIN, MESSAGE_END, &echo);
                        send.write_all(block.as_bytes()).await?;
                    }
                }
                HandshakeState::VerifyNonce
            }

            HandshakeState::VerifyNonce => {
                match role {
                    HandshakeRole::Initiator => {
                        let material = remote.as_ref().expect("keys exchanged before nonce");
                        let sealed = armor.read_block(MESSAGE_BEGIN, MESSAGE_END).await?;
                        let echo = crypto::open(ring, material, &sealed)?;
                        if echo != challenge {
                            return Err(HandshakeError::NonceMismatch);
                        }
                    }
                    // The responder proved possession by decrypting; its
                    // verification of the initiator happened when the
                    // sealed nonce opened under the initiator's signature.
                    HandshakeRole::Responder => {}
                }
                HandshakeState::Authenticated
            }

            HandshakeState::Authenticated => {
                let id = remote
                    .as_ref()
                    .expect("keys exchanged before authentication")
                    .fingerprint();
                debug!(remote = %id, ?role, "handshake complete");
                return Ok((id, send, armor));
            }
        };
    }
}

/// Read BSON records off one stream and publish them to the event channel.
///
/// A malformed record is a protocol violation: the loop logs and exits,
/// dropping the stream. A closed channel means the engine went away.
async fn receive_loop(
    peer: PeerId,
    mut recv: quinn::RecvStream,
    mut buf: Vec<u8>,
    events: mpsc::Sender<Message>,
) {
    let mut chunk = [0u8; 4096];
    'outer: loop {
        // Assemble at least one complete record in buf.
        let needed = loop {
            if buf.len() >= 4 {
                let header: [u8; 4] = buf[..4].try_into().expect("checked length");
                match record_len(&header) {
                    Ok(len) => {
                        if buf.len() >= len {
                            break len;
                        }
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "protocol violation on stream");
                        break 'outer;
                    }
                }
            }
            match recv.read(&mut chunk).await {
                Ok(Some(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(None) => {
                    trace!(peer = %peer, "stream finished");
                    break 'outer;
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "stream read failed");
                    break 'outer;
                }
            }
        };

        let record: Vec<u8> = buf.drain(..needed).collect();
        match decode_message(&record) {
            Ok(message) => {
                if events.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "protocol violation: undecodable record");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyRing;

    #[test]
    fn find_subslice_positions() {
        assert_eq!(find_subslice(b"abcdef", b"cd"), Some(2));
        assert_eq!(find_subslice(b"abcdef", b"zz"), None);
        assert_eq!(find_subslice(b"abc", b"abc"), Some(0));
    }

    #[test]
    fn stream_selection_prefers_exact_match() {
        let a = KeyRing::generate().peer_id();
        let b = KeyRing::generate().peer_id();
        let mut streams = HashMap::new();
        streams.insert(a, "to-a");
        streams.insert(b, "to-b");
        assert_eq!(select_outbound(&streams, &a), Some(&"to-a"));
        assert_eq!(select_outbound(&streams, &b), Some(&"to-b"));
    }

    #[test]
    fn stream_selection_falls_back_for_single_neighbor() {
        let neighbor = KeyRing::generate().peer_id();
        let distant = KeyRing::generate().peer_id();
        let mut streams = HashMap::new();
        streams.insert(neighbor, "only");
        // A single-peer neighbor forwards anything we hand it.
        assert_eq!(select_outbound(&streams, &distant), Some(&"only"));
    }

    #[test]
    fn stream_selection_refuses_ambiguity() {
        // The lookup must consult the outbound registrations: a peer that
        // only ever appears on the inbound side has no entry here, and
        // with several candidate streams none may be guessed.
        let a = KeyRing::generate().peer_id();
        let b = KeyRing::generate().peer_id();
        let inbound_only = KeyRing::generate().peer_id();
        let mut streams = HashMap::new();
        streams.insert(a, "to-a");
        streams.insert(b, "to-b");
        assert_eq!(select_outbound(&streams, &inbound_only), None);

        let empty: HashMap<crate::identity::PeerId, &str> = HashMap::new();
        assert_eq!(select_outbound(&empty, &inbound_only), None);
    }
}

//! # Voxmesh - Peer-to-Peer Overlay Hub
//!
//! Voxmesh routes opaque, end-to-end encrypted messages between
//! authenticated peers over QUIC. Hubs form a mesh; clients attach to a
//! hub; a message addressed to a distant peer is forwarded hub-to-hub
//! until delivered, or held in a durable queue until a route appears.
//!
//! - **Identity**: peers are 20-byte fingerprints of their public key
//!   block; the armored-key handshake with a sealed nonce challenge
//!   authenticates every connection
//! - **Routing**: fingerprint-addressed forwarding with TTL hop budgets,
//!   redundant-path fan-out, on-demand hub dialing, and store-and-forward
//! - **Signaling**: a loopback SIP transport tunneled as encrypted
//!   `Application` messages between endpoints
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `hub` | High-level API combining all components |
//! | `identity` | Fingerprints, key rings, armor, on-disk key store |
//! | `crypto` | Sealed envelopes, signatures, QUIC TLS configuration |
//! | `messages` | Framed wire records and the BSON codec |
//! | `cookie` | Signed identity capsules (hub / user / node) |
//! | `connection` | Per-neighbor QUIC connection and handshake machine |
//! | `router` | Routing table, forwarding policy, entity-key latches |
//! | `queue` | Durable keyed FIFO for undeliverable messages |
//! | `directory` | External fingerprint-to-endpoint lookup seam |
//! | `signaling` | Local SIP bridge (encrypt-route / decrypt-deliver) |
//! | `config` | Hub configuration |

mod config;
mod connection;
mod cookie;
mod crypto;
mod directory;
mod hub;
mod identity;
mod messages;
mod queue;
mod router;
mod signaling;

pub use config::{HubConfig, DEFAULT_START_TTL};
pub use connection::{HandshakeError, HandshakeRole, PeerConnection, SendError, KEEPALIVE_PERIOD};
pub use cookie::{Cookie, CookieBody, CookieError};
pub use crypto::{
    create_client_config, create_server_config, load_credentials, open, seal, SealError, ALPN,
};
pub use directory::{Directory, EmptyDirectory, StaticDirectory};
pub use hub::Hub;
pub use identity::{
    armor_decode, armor_encode, fingerprint, IdentityError, KeyRing, KeyStore, PeerId,
    PublicKeyMaterial, MESSAGE_BEGIN, MESSAGE_END, PUBLIC_KEY_BEGIN, PUBLIC_KEY_END,
};
pub use messages::{Message, MessageCode, WireError, COMMAND_PING, MAX_WIRE_MESSAGE};
pub use queue::{MessageQueue, QueueError};
pub use router::{InboundApplication, Latch, RoutingEngine, DIAL_TIMEOUT};
pub use signaling::{uri_user, SignalingAdapter, SipMessage, StartLine, SENTINEL_HOST};

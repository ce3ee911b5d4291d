//! Directory trait: the external fingerprint-to-endpoint lookup.
//!
//! Hub discovery lives outside this crate (a DHT in production). The
//! router only needs one question answered: "who is responsible for this
//! fingerprint, and how do I reach them?", which the directory answers
//! with the peer's signed cookie. The trait is defined separately from any
//! implementation so the routing engine never depends on a concrete
//! discovery mechanism.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cookie::Cookie;
use crate::identity::PeerId;

/// Fingerprint-to-cookie lookup.
#[async_trait]
pub trait Directory: Send + Sync + 'static {
    /// Resolve a fingerprint to the signed cookie describing it, or `None`
    /// when the directory has never seen the peer.
    async fn lookup(&self, peer: &PeerId) -> Option<Cookie>;
}

/// In-memory directory used by tests and static bootstrap configurations.
#[derive(Default)]
pub struct StaticDirectory {
    entries: RwLock<HashMap<PeerId, Cookie>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cookie under its own key.
    pub async fn insert(&self, cookie: Cookie) {
        self.entries.write().await.insert(cookie.key, cookie);
    }

    /// Register a cookie under an arbitrary key (e.g. a node fingerprint
    /// resolving to the hub responsible for it).
    pub async fn insert_for(&self, peer: PeerId, cookie: Cookie) {
        self.entries.write().await.insert(peer, cookie);
    }

    pub async fn remove(&self, peer: &PeerId) {
        self.entries.write().await.remove(peer);
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn lookup(&self, peer: &PeerId) -> Option<Cookie> {
        self.entries.read().await.get(peer).cloned()
    }
}

/// A directory that knows nothing; every lookup misses.
///
/// The default when no directory endpoint is configured: such a hub
/// serves only directly attached peers and holds everything else.
pub struct EmptyDirectory;

#[async_trait]
impl Directory for EmptyDirectory {
    async fn lookup(&self, _peer: &PeerId) -> Option<Cookie> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::CookieBody;
    use crate::identity::KeyRing;

    #[tokio::test]
    async fn static_directory_round_trip() {
        let directory = StaticDirectory::new();
        let ring = KeyRing::generate();
        let cookie = Cookie::issue(
            &ring,
            CookieBody::Hub {
                hostname: "hub".into(),
                directory_uri: String::new(),
                service_uri: "127.0.0.1:0".into(),
                owners: vec![],
            },
        );
        directory.insert(cookie.clone()).await;

        let found = directory.lookup(&ring.peer_id()).await.expect("entry");
        assert_eq!(found.key, cookie.key);

        directory.remove(&ring.peer_id()).await;
        assert!(directory.lookup(&ring.peer_id()).await.is_none());
    }

    #[tokio::test]
    async fn empty_directory_always_misses() {
        let directory = EmptyDirectory;
        assert!(directory.lookup(&KeyRing::generate().peer_id()).await.is_none());
    }

    #[tokio::test]
    async fn node_resolves_to_responsible_hub() {
        let directory = StaticDirectory::new();
        let hub_ring = KeyRing::generate();
        let node = KeyRing::generate().peer_id();
        let hub_cookie = Cookie::issue(
            &hub_ring,
            CookieBody::Hub {
                hostname: "hub".into(),
                directory_uri: String::new(),
                service_uri: "127.0.0.1:0".into(),
                owners: vec![],
            },
        );
        directory.insert_for(node, hub_cookie).await;

        let found = directory.lookup(&node).await.expect("entry");
        assert_eq!(found.key, hub_ring.peer_id(), "node must resolve to its hub");
    }
}

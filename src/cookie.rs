//! # Signed Identity Cookies
//!
//! A cookie is the capsule a peer hands out to prove who it is: its
//! fingerprint, its public key block, and a role-specific body, all bound
//! together by a detached signature. Cookies travel as the payload of
//! `Entity` messages and are the only way key material is learned from the
//! overlay.
//!
//! ## Security Invariants
//!
//! - C1: `cookie.key == fingerprint(cookie.public_key)` for every accepted
//!   cookie
//! - C2: the signature covers the encoded body and verifies under the
//!   embedded public key block
//! - C3: a cookie whose body was altered after signing never verifies

use serde::{Deserialize, Serialize};

use crate::crypto::{self, SignatureError, COOKIE_SIGNATURE_DOMAIN};
use crate::identity::{fingerprint, KeyRing, PeerId, PublicKeyMaterial};

/// Role-specific cookie contents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CookieBody {
    /// A routing peer advertising its service endpoint.
    Hub {
        hostname: String,
        directory_uri: String,
        service_uri: String,
        owners: Vec<PeerId>,
    },
    /// A leaf account owning one or more nodes.
    User { owned_nodes: Vec<PeerId> },
    /// A leaf device recording which hub saw it last.
    Node { most_recently_seen_by: PeerId },
}

/// Reasons a cookie fails verification.
#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    #[error("cookie payload is malformed: {0}")]
    Malformed(#[from] bson::de::Error),
    #[error("cookie body failed to encode: {0}")]
    Encode(#[from] bson::ser::Error),
    #[error("cookie key does not match the fingerprint of its public key block")]
    FingerprintMismatch,
    #[error("cookie public key block is invalid")]
    BadKeyBlock,
    #[error("cookie signature rejected: {0}")]
    Signature(#[from] SignatureError),
}

/// A signed identity capsule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cookie {
    pub key: PeerId,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub body: CookieBody,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Cookie {
    /// Issue a cookie over our own key material.
    pub fn issue(ring: &KeyRing, body: CookieBody) -> Self {
        let public_key = ring.public_material().encode();
        let body_bytes = bson::to_vec(&body).expect("cookie body serialization cannot fail");
        let signature = crypto::sign_with_domain(ring, COOKIE_SIGNATURE_DOMAIN, &body_bytes);
        Self {
            key: ring.peer_id(),
            public_key,
            body,
            signature,
        }
    }

    /// Verify fingerprint binding and signature, yielding the embedded key
    /// material on success.
    pub fn verify(&self) -> Result<PublicKeyMaterial, CookieError> {
        if fingerprint(&self.public_key) != self.key {
            return Err(CookieError::FingerprintMismatch);
        }
        let material =
            PublicKeyMaterial::decode(&self.public_key).map_err(|_| CookieError::BadKeyBlock)?;
        let body_bytes = bson::to_vec(&self.body)?;
        crypto::verify_with_domain(&material, COOKIE_SIGNATURE_DOMAIN, &body_bytes, &self.signature)?;
        Ok(material)
    }

    /// Serialize for use as an `Entity` message payload.
    pub fn encode(&self) -> Result<Vec<u8>, CookieError> {
        Ok(bson::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CookieError> {
        Ok(bson::from_slice(bytes)?)
    }

    /// The hub endpoint this cookie advertises, if it is a hub cookie.
    pub fn service_uri(&self) -> Option<&str> {
        match &self.body {
            CookieBody::Hub { service_uri, .. } => Some(service_uri),
            _ => None,
        }
    }
}

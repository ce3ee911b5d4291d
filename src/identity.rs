//! # Identity and Key Material
//!
//! This module defines the core identity types used throughout Voxmesh:
//!
//! - [`PeerId`]: 20-byte fingerprint of a peer's public key block
//! - [`PublicKeyMaterial`]: a peer's signing and agreement public keys
//! - [`KeyRing`]: the local secret keys (Ed25519 signing + X25519 agreement)
//! - [`KeyStore`]: armored on-disk key files (`public.asc` / `private.asc`)
//!
//! ## Identity Model
//!
//! A peer is identified by the SHA-1 fingerprint of its serialized public
//! key block. The fingerprint is what appears on the wire: message
//! recipients, cookie keys, and queue keys are all `PeerId`s, and the
//! armored key block exchanged during the connection handshake is the only
//! way key material enters the system.
//!
//! ## Security Invariants
//!
//! - P1: `PeerId::from_hex(id.to_hex()) == id` (round-trip preservation)
//! - P2: `fingerprint(blob)` is deterministic; equal ids imply equal blobs
//! - P3: a `KeyRing`'s fingerprint matches its exported public block
//! - P4: the private key file never stores secrets in the clear

use std::fmt;
use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use x25519_dalek::StaticSecret;

/// Length of a peer fingerprint in bytes.
pub const PEER_ID_LEN: usize = 20;

/// Magic prefix of a serialized public key block.
///
/// The blob layout is fixed: magic (4) || signing key (32) || agreement
/// key (32). Fingerprints are computed over exactly these bytes.
const KEY_BLOCK_MAGIC: &[u8; 4] = b"VMK1";

/// Total length of a serialized public key block.
const KEY_BLOCK_LEN: usize = 4 + 32 + 32;

/// Domain separation prefix for the passphrase-derived key-file key.
const KEYFILE_KDF_DOMAIN: &[u8] = b"voxmesh-keyfile-v1:";

/// Armor markers for the two block kinds carried on the handshake stream.
pub const PUBLIC_KEY_BEGIN: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";
pub const PUBLIC_KEY_END: &str = "-----END PGP PUBLIC KEY BLOCK-----";
pub const MESSAGE_BEGIN: &str = "-----BEGIN PGP MESSAGE-----";
pub const MESSAGE_END: &str = "-----END PGP MESSAGE-----";

/// Error type for identity, armor, and key-store operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid fingerprint: expected 40 hex characters")]
    InvalidFingerprint,
    #[error("malformed public key block")]
    MalformedKeyBlock,
    #[error("armor block is missing its {0} marker")]
    MissingMarker(&'static str),
    #[error("armor body is not valid base64")]
    BadArmorBody,
    #[error("key file is corrupt")]
    CorruptKeyFile,
    #[error("wrong passphrase or damaged private key file")]
    BadPassphrase,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 20-byte fingerprint identifying a peer.
///
/// Derived as the SHA-1 digest of the peer's serialized public key block.
/// The string form is lowercase hex, which is also how the id crosses the
/// wire inside BSON records.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidFingerprint)?;
        if bytes.len() != PEER_ID_LEN {
            return Err(IdentityError::InvalidFingerprint);
        }
        let mut arr = [0u8; PEER_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// PeerIds cross the wire as lowercase hex strings so that BSON records stay
// self-describing regardless of how the decoder handles binary subtypes.
impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        PeerId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A peer's public keys: Ed25519 for signatures, X25519 for key agreement.
///
/// This is what an armored `PGP PUBLIC KEY BLOCK` on the handshake stream
/// decodes to, and what an entity-key latch fulfills with.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKeyMaterial {
    sign: [u8; 32],
    agree: [u8; 32],
}

impl PublicKeyMaterial {
    pub fn new(sign: [u8; 32], agree: [u8; 32]) -> Self {
        Self { sign, agree }
    }

    /// Serialize to the canonical key block bytes that fingerprints cover.
    pub fn encode(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(KEY_BLOCK_LEN);
        blob.extend_from_slice(KEY_BLOCK_MAGIC);
        blob.extend_from_slice(&self.sign);
        blob.extend_from_slice(&self.agree);
        blob
    }

    pub fn decode(blob: &[u8]) -> Result<Self, IdentityError> {
        if blob.len() != KEY_BLOCK_LEN || &blob[..4] != KEY_BLOCK_MAGIC {
            return Err(IdentityError::MalformedKeyBlock);
        }
        let mut sign = [0u8; 32];
        let mut agree = [0u8; 32];
        sign.copy_from_slice(&blob[4..36]);
        agree.copy_from_slice(&blob[36..68]);
        // Reject blobs whose signing half is not a valid Ed25519 point; an
        // unverifiable key cannot authenticate anything.
        VerifyingKey::from_bytes(&sign).map_err(|_| IdentityError::MalformedKeyBlock)?;
        Ok(Self { sign, agree })
    }

    /// The 20-byte SHA-1 fingerprint of the encoded block.
    pub fn fingerprint(&self) -> PeerId {
        fingerprint(&self.encode())
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        VerifyingKey::from_bytes(&self.sign).map_err(|_| IdentityError::MalformedKeyBlock)
    }

    pub fn agreement_key(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.agree)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = self.verifying_key() else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
    }
}

impl fmt::Debug for PublicKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKeyMaterial")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Compute the SHA-1 fingerprint of a serialized public key block.
pub fn fingerprint(key_block: &[u8]) -> PeerId {
    let digest = Sha1::new().chain_update(key_block).finalize();
    let mut id = [0u8; PEER_ID_LEN];
    id.copy_from_slice(&digest);
    PeerId(id)
}

/// The local secret key material: one signing key, one agreement key.
#[derive(Clone)]
pub struct KeyRing {
    signing: SigningKey,
    agree: StaticSecret,
}

impl KeyRing {
    /// Generate a fresh key ring from OS randomness.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            agree: StaticSecret::random_from_rng(OsRng),
        }
    }

    fn from_secret_bytes(sign: [u8; 32], agree: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&sign),
            agree: StaticSecret::from(agree),
        }
    }

    /// The public half of this ring, as exchanged during the handshake.
    pub fn public_material(&self) -> PublicKeyMaterial {
        PublicKeyMaterial {
            sign: self.signing.verifying_key().to_bytes(),
            agree: x25519_dalek::PublicKey::from(&self.agree).to_bytes(),
        }
    }

    /// Our own fingerprint.
    pub fn peer_id(&self) -> PeerId {
        self.public_material().fingerprint()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub(crate) fn agreement_secret(&self) -> &StaticSecret {
        &self.agree
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ASCII Armor
// ============================================================================

/// Wrap raw bytes in armor markers with a base64 body.
pub fn armor_encode(begin: &str, end: &str, bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    let body = BASE64.encode(bytes);
    let mut out = String::with_capacity(begin.len() + end.len() + body.len() + body.len() / 64 + 8);
    out.push_str(begin);
    out.push_str("\n\n");
    for chunk in body.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 output is ascii"));
        out.push('\n');
    }
    out.push_str(end);
    out.push('\n');
    out
}

/// Extract and decode the base64 body between the given armor markers.
pub fn armor_decode(
    begin: &'static str,
    end: &'static str,
    text: &str,
) -> Result<Vec<u8>, IdentityError> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    let start = text.find(begin).ok_or(IdentityError::MissingMarker(begin))? + begin.len();
    let stop = text[start..]
        .find(end)
        .ok_or(IdentityError::MissingMarker(end))?
        + start;
    let body: String = text[start..stop].chars().filter(|c| !c.is_whitespace()).collect();
    BASE64.decode(body).map_err(|_| IdentityError::BadArmorBody)
}

// ============================================================================
// On-Disk Key Store
// ============================================================================

/// Armored key files under a directory: `public.asc` and `private.asc`.
///
/// The private file's armor body is the two 32-byte secrets sealed with
/// ChaCha20-Poly1305 under a passphrase-derived key; a random salt and
/// nonce are stored in front of the ciphertext.
pub struct KeyStore;

const PUBLIC_FILE: &str = "public.asc";
const PRIVATE_FILE: &str = "private.asc";

impl KeyStore {
    /// Load the key ring from `dir`, or generate and persist a new one if
    /// the files are not present.
    pub fn load_or_generate(dir: &Path, passphrase: &str) -> Result<KeyRing, IdentityError> {
        if dir.join(PRIVATE_FILE).exists() {
            Self::load(dir, passphrase)
        } else {
            let ring = KeyRing::generate();
            Self::save(dir, passphrase, &ring)?;
            Ok(ring)
        }
    }

    pub fn save(dir: &Path, passphrase: &str, ring: &KeyRing) -> Result<(), IdentityError> {
        std::fs::create_dir_all(dir)?;

        let public = armor_encode(
            PUBLIC_KEY_BEGIN,
            PUBLIC_KEY_END,
            &ring.public_material().encode(),
        );
        std::fs::write(dir.join(PUBLIC_FILE), public)?;

        let mut salt = [0u8; 16];
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let mut secrets = Vec::with_capacity(64);
        secrets.extend_from_slice(&ring.signing.to_bytes());
        secrets.extend_from_slice(&ring.agree.to_bytes());

        let key = keyfile_key(passphrase, &salt);
        let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
        let sealed = cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), secrets.as_slice())
            .map_err(|_| IdentityError::CorruptKeyFile)?;

        let mut blob = Vec::with_capacity(16 + 12 + sealed.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        std::fs::write(
            dir.join(PRIVATE_FILE),
            armor_encode(MESSAGE_BEGIN, MESSAGE_END, &blob),
        )?;
        Ok(())
    }

    pub fn load(dir: &Path, passphrase: &str) -> Result<KeyRing, IdentityError> {
        let text = std::fs::read_to_string(dir.join(PRIVATE_FILE))?;
        let blob = armor_decode(MESSAGE_BEGIN, MESSAGE_END, &text)?;
        if blob.len() < 16 + 12 {
            return Err(IdentityError::CorruptKeyFile);
        }
        let (salt, rest) = blob.split_at(16);
        let (nonce, sealed) = rest.split_at(12);

        let key = keyfile_key(passphrase, salt);
        let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
        let secrets = cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), sealed)
            .map_err(|_| IdentityError::BadPassphrase)?;
        if secrets.len() != 64 {
            return Err(IdentityError::CorruptKeyFile);
        }
        let mut sign = [0u8; 32];
        let mut agree = [0u8; 32];
        sign.copy_from_slice(&secrets[..32]);
        agree.copy_from_slice(&secrets[32..]);
        Ok(KeyRing::from_secret_bytes(sign, agree))
    }
}

/// Derive the key-file sealing key from a passphrase and salt.
fn keyfile_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let digest = Sha256::new()
        .chain_update(KEYFILE_KDF_DOMAIN)
        .chain_update(passphrase.as_bytes())
        .chain_update(salt)
        .finalize();
    digest.into()
}

//! # Cryptographic Infrastructure
//!
//! This module provides cryptographic primitives for Voxmesh:
//!
//! - **Sealed envelopes**: encrypt-and-sign / decrypt-and-verify for the
//!   handshake nonce challenge and Application payloads
//! - **Signatures**: domain-separated Ed25519 signing and verification
//! - **TLS**: QUIC server/client configuration for the overlay transport
//!
//! ## Sealed Envelope Construction
//!
//! `seal` performs the classic hybrid scheme: an ephemeral X25519 key
//! agreement with the recipient's agreement key yields a ChaCha20-Poly1305
//! session key (domain-separated SHA-256 over the shared secret and both
//! public keys), and the sender signs the plaintext with Ed25519. `open`
//! reverses both layers and refuses envelopes whose signature does not
//! verify under the claimed sender.
//!
//! ## Transport Authentication
//!
//! TLS here only protects the transport. Peer authentication happens above
//! it, in the armored-key handshake with its nonce challenge, so the client
//! verifier intentionally accepts any server certificate (the `dangerous()`
//! API is used for exactly that) and the server requests no client
//! certificates. ALPN pins the overlay protocol version.

use std::sync::Arc;

use anyhow::{Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::EphemeralSecret;

use crate::identity::{KeyRing, PeerId, PublicKeyMaterial};

/// ALPN protocol identifier (8 ASCII bytes). All overlay connections use
/// this to prevent accidental cross-protocol connections.
pub const ALPN: &[u8] = b"voxmesh2";

/// Domain separation prefix for sealed-envelope session keys.
const SEAL_KEY_DOMAIN: &[u8] = b"voxmesh-seal-v1:";

/// Domain separation prefix for cookie signatures.
pub const COOKIE_SIGNATURE_DOMAIN: &[u8] = b"voxmesh-cookie-v1:";

/// Maximum accepted envelope size. Envelopes carry SIP messages and
/// handshake nonces, both small; anything larger is hostile.
const MAX_ENVELOPE_SIZE: u64 = 64 * 1024;

/// Error type for sealing and opening envelopes.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("envelope is malformed")]
    Malformed,
    #[error("decryption failed")]
    Decrypt,
    #[error("signature verification failed")]
    BadSignature,
    #[error("envelope signer {signer} does not match expected sender {expected}")]
    WrongSigner { signer: PeerId, expected: PeerId },
}

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// An encrypted-and-signed payload.
///
/// The signature covers the plaintext, so it can only be checked after a
/// successful decrypt; tampering with the ciphertext fails at the AEAD
/// layer first.
#[derive(Serialize, Deserialize)]
struct SealedEnvelope {
    ephemeral: [u8; 32],
    nonce: [u8; 12],
    signer: PeerId,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
}

fn envelope_options() -> impl bincode::Options {
    use bincode::Options;
    bincode::DefaultOptions::new()
        .with_limit(MAX_ENVELOPE_SIZE)
        .with_fixint_encoding()
}

/// Derive the AEAD session key for one envelope.
fn session_key(shared: &[u8], ephemeral: &[u8; 32], recipient_agree: &[u8; 32]) -> [u8; 32] {
    let digest = Sha256::new()
        .chain_update(SEAL_KEY_DOMAIN)
        .chain_update(shared)
        .chain_update(ephemeral)
        .chain_update(recipient_agree)
        .finalize();
    digest.into()
}

/// Encrypt `plaintext` to `recipient` and sign it with our key ring.
pub fn seal(ring: &KeyRing, recipient: &PublicKeyMaterial, plaintext: &[u8]) -> Vec<u8> {
    use bincode::Options;

    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral = x25519_dalek::PublicKey::from(&ephemeral_secret).to_bytes();
    let recipient_key = recipient.agreement_key();
    let shared = ephemeral_secret.diffie_hellman(&recipient_key);

    let key = session_key(shared.as_bytes(), &ephemeral, &recipient_key.to_bytes());
    let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
        .expect("chacha20poly1305 encryption is infallible for in-memory buffers");

    let envelope = SealedEnvelope {
        ephemeral,
        nonce,
        signer: ring.peer_id(),
        ciphertext,
        signature: ring.sign(plaintext).to_bytes().to_vec(),
    };
    envelope_options()
        .serialize(&envelope)
        .expect("envelope serialization cannot fail")
}

/// Decrypt an envelope with our key ring and verify the sender's signature.
///
/// `sender` must be the key material of the peer the envelope claims to be
/// from; a mismatched or failing signature is rejected.
pub fn open(ring: &KeyRing, sender: &PublicKeyMaterial, bytes: &[u8]) -> Result<Vec<u8>, SealError> {
    use bincode::Options;

    let envelope: SealedEnvelope = envelope_options()
        .deserialize(bytes)
        .map_err(|_| SealError::Malformed)?;

    let expected = sender.fingerprint();
    if envelope.signer != expected {
        return Err(SealError::WrongSigner {
            signer: envelope.signer,
            expected,
        });
    }

    let ephemeral_key = x25519_dalek::PublicKey::from(envelope.ephemeral);
    let shared = ring.agreement_secret().diffie_hellman(&ephemeral_key);
    let our_agree = x25519_dalek::PublicKey::from(ring.agreement_secret()).to_bytes();

    let key = session_key(shared.as_bytes(), &envelope.ephemeral, &our_agree);
    let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
    let plaintext = cipher
        .decrypt(
            chacha20poly1305::Nonce::from_slice(&envelope.nonce),
            envelope.ciphertext.as_slice(),
        )
        .map_err(|_| SealError::Decrypt)?;

    if !sender.verify(&plaintext, &envelope.signature) {
        return Err(SealError::BadSignature);
    }
    Ok(plaintext)
}

/// Peek at the signer fingerprint of an envelope without opening it.
///
/// Used by the routing engine to look up the sender's key material before
/// the full decrypt-and-verify.
pub fn envelope_signer(bytes: &[u8]) -> Result<PeerId, SealError> {
    use bincode::Options;
    let envelope: SealedEnvelope = envelope_options()
        .deserialize(bytes)
        .map_err(|_| SealError::Malformed)?;
    Ok(envelope.signer)
}

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with a domain prefix, preventing cross-protocol replay.
pub fn sign_with_domain(ring: &KeyRing, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    ring.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a domain-separated signature under the given key material.
pub fn verify_with_domain(
    material: &PublicKeyMaterial,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    if material.verify(&prefixed, signature) {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}

// ============================================================================
// QUIC TLS Configuration
// ============================================================================

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Load PEM credentials from disk, or mint a self-signed certificate when
/// no paths are configured.
pub fn load_credentials(
    cert_chain_path: Option<&std::path::Path>,
    private_key_path: Option<&std::path::Path>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    match (cert_chain_path, private_key_path) {
        (Some(chain), Some(key)) => {
            let chain_pem = std::fs::read(chain)
                .with_context(|| format!("failed to read cert chain {}", chain.display()))?;
            let certs = rustls_pemfile::certs(&mut chain_pem.as_slice())
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to parse certificate chain")?;
            if certs.is_empty() {
                anyhow::bail!("certificate chain {} contains no certificates", chain.display());
            }
            let key_pem = std::fs::read(key)
                .with_context(|| format!("failed to read private key {}", key.display()))?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .context("failed to parse private key")?
                .context("no private key found in key file")?;
            Ok((certs, key))
        }
        _ => {
            let key_pair = rcgen::KeyPair::generate().context("failed to generate TLS key pair")?;
            let params = rcgen::CertificateParams::new(vec!["voxmesh".to_string()])
                .context("failed to create certificate params")?;
            let cert = params
                .self_signed(&key_pair)
                .context("failed to self-sign transport certificate")?;
            let key = PrivateKeyDer::try_from(key_pair.serialize_der())
                .map_err(|e| anyhow::anyhow!("failed to encode key: {e}"))?;
            Ok((vec![CertificateDer::from(cert.der().to_vec())], key))
        }
    }
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let transport_config = Arc::get_mut(&mut server_config.transport)
        .expect("transport config should be exclusively owned immediately after creation");
    transport_config.max_idle_timeout(Some(
        std::time::Duration::from_secs(60)
            .try_into()
            .expect("60 seconds is a valid VarInt duration"),
    ));
    transport_config.max_concurrent_bidi_streams(64u32.into());

    Ok(server_config)
}

pub fn create_client_config() -> Result<quinn::ClientConfig> {
    let client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(OverlayAuthVerifier))
        .with_no_client_auth();

    let mut client_crypto_with_alpn = client_crypto;
    client_crypto_with_alpn.alpn_protocols = vec![ALPN.to_vec()];

    let client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto_with_alpn)
            .context("failed to create QUIC client config")?,
    ));

    Ok(client_config)
}

/// Server-certificate verifier that accepts any certificate.
///
/// Peer authentication does not live in TLS: the armored-key handshake with
/// its nonce challenge authenticates the remote peer after the connection
/// is established, and a forged transport certificate cannot pass it.
#[derive(Debug)]
struct OverlayAuthVerifier;

impl rustls::client::danger::ServerCertVerifier for OverlayAuthVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }
}

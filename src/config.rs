//! Hub configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Default initial hop budget.
pub const DEFAULT_START_TTL: i32 = 99;

/// Everything a hub needs to come up.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Identity string advertised in our hub cookie.
    pub hostname: String,
    /// UDP address the QUIC endpoint binds to.
    pub bind: SocketAddr,
    /// TTL applied to synthetic messages and to `ttl < 0` normalization.
    pub start_ttl: i32,
    /// Whether a message whose hop budget is already spent (`ttl == 0`)
    /// is still forwarded one more hop. The original behavior is to
    /// forward; turning this off drops such messages at the sender.
    pub forward_on_zero_ttl: bool,
    /// PEM certificate chain for the QUIC server. When unset, a
    /// self-signed transport certificate is generated at startup.
    pub ssl_cert_chain_path: Option<PathBuf>,
    /// PEM private key matching the certificate chain.
    pub ssl_private_key_path: Option<PathBuf>,
    /// External directory/DHT bootstrap address, advertised in our cookie.
    pub directory_endpoint: Option<String>,
    /// Directory holding `public.asc` / `private.asc`.
    pub key_dir: PathBuf,
    /// Passphrase sealing the private key file.
    pub key_passphrase: String,
    /// Directory backing the store-and-forward queue.
    pub queue_dir: PathBuf,
    /// Local UDP address the SIP signaling adapter listens on.
    pub signaling_bind: SocketAddr,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hostname: "voxmesh".to_string(),
            bind: "0.0.0.0:0".parse().expect("static address"),
            start_ttl: DEFAULT_START_TTL,
            forward_on_zero_ttl: true,
            ssl_cert_chain_path: None,
            ssl_private_key_path: None,
            directory_endpoint: None,
            key_dir: PathBuf::from("keys"),
            key_passphrase: String::new(),
            queue_dir: PathBuf::from("queue"),
            signaling_bind: "127.0.0.1:5060".parse().expect("static address"),
        }
    }
}

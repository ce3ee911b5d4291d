//! # High-Level Hub API
//!
//! A [`Hub`] assembles the pieces into a running overlay participant: key
//! material from the key store, the QUIC endpoint, the routing engine, the
//! store-and-forward queue, and the SIP signaling adapter.
//!
//! ```ignore
//! let directory = Arc::new(StaticDirectory::new());
//! let hub = Hub::start(HubConfig::default(), directory).await?;
//! hub.dial("203.0.113.9:4450".parse()?).await?;
//! ```
//!
//! The hub owns the accept loop (every inbound connection is handshaked
//! and handed to the engine), a minute-granularity flush task that retries
//! held messages, and the signaling adapter's two loops. `shutdown` stops
//! all of them, unwinds every connection, and waits for the endpoint to
//! drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::connection::{HandshakeRole, PeerConnection};
use crate::cookie::{Cookie, CookieBody};
use crate::crypto;
use crate::directory::Directory;
use crate::identity::{KeyStore, PeerId};
use crate::queue::MessageQueue;
use crate::router::{RoutingEngine, DIAL_TIMEOUT};
use crate::signaling::SignalingAdapter;

/// Period of the held-message retry pass.
const FLUSH_PERIOD: Duration = Duration::from_secs(60);

/// A running overlay hub.
pub struct Hub {
    engine: Arc<RoutingEngine>,
    endpoint: quinn::Endpoint,
    adapter: Arc<SignalingAdapter>,
    listener: JoinHandle<()>,
    flusher: JoinHandle<()>,
    signaling_tasks: (JoinHandle<()>, JoinHandle<()>),
}

impl Hub {
    /// Bring up a hub: load keys, bind the endpoint, start the accept
    /// loop, the flush scheduler, and the signaling adapter.
    pub async fn start(config: HubConfig, directory: Arc<dyn Directory>) -> Result<Self> {
        let ring = KeyStore::load_or_generate(&config.key_dir, &config.key_passphrase)
            .context("failed to load key material")?;

        let (certs, key) = crypto::load_credentials(
            config.ssl_cert_chain_path.as_deref(),
            config.ssl_private_key_path.as_deref(),
        )?;
        let server_config = crypto::create_server_config(certs, key)?;
        let client_config = crypto::create_client_config()?;

        let endpoint = quinn::Endpoint::server(server_config, config.bind)
            .context("failed to bind QUIC endpoint")?;
        let local_addr = endpoint.local_addr()?;

        let cookie = Cookie::issue(
            &ring,
            CookieBody::Hub {
                hostname: config.hostname.clone(),
                directory_uri: config.directory_endpoint.clone().unwrap_or_default(),
                service_uri: local_addr.to_string(),
                owners: Vec::new(),
            },
        );

        let queue = Arc::new(
            MessageQueue::open(&config.queue_dir).context("failed to open message queue")?,
        );

        let (engine, app_rx) = RoutingEngine::new(
            ring,
            cookie,
            config.start_ttl,
            config.forward_on_zero_ttl,
            queue,
            directory,
            endpoint.clone(),
            client_config,
        );

        let adapter = SignalingAdapter::bind(config.signaling_bind, engine.clone())
            .await
            .context("failed to bind signaling transport")?;
        let signaling_tasks = adapter.spawn(app_rx);

        let listener = {
            let endpoint = endpoint.clone();
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(incoming) = endpoint.accept().await {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept_connection(engine, incoming).await {
                            debug!(error = %e, "inbound connection failed");
                        }
                    });
                }
            })
        };

        let flusher = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(FLUSH_PERIOD);
                ticker.tick().await; // skip the immediate tick
                loop {
                    ticker.tick().await;
                    engine.flush_messages(None).await;
                }
            })
        };

        info!("Hub {}/{}", local_addr, engine.local_id());

        Ok(Self {
            engine,
            endpoint,
            adapter,
            listener,
            flusher,
            signaling_tasks,
        })
    }

    /// Our fingerprint.
    pub fn peer_id(&self) -> PeerId {
        self.engine.local_id()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("failed to get local address")
    }

    /// The address the local SIP endpoint should talk to.
    pub fn signaling_addr(&self) -> Result<SocketAddr> {
        self.adapter
            .local_addr()
            .context("failed to get signaling address")
    }

    /// The routing engine, for direct routing and queue inspection.
    pub fn engine(&self) -> &Arc<RoutingEngine> {
        &self.engine
    }

    /// Dial another hub and complete the mutual-authentication handshake.
    pub async fn dial(&self, addr: SocketAddr) -> Result<PeerId> {
        tokio::time::timeout(DIAL_TIMEOUT, self.engine.connect_hub(addr))
            .await
            .context("hub dial timed out")?
    }

    /// Stop accepting, unwind every connection, and drain the endpoint.
    pub async fn shutdown(&self) {
        self.listener.abort();
        self.flusher.abort();
        self.signaling_tasks.0.abort();
        self.signaling_tasks.1.abort();

        // One last delivery attempt over the still-open connections.
        self.engine.flush_messages(None).await;

        self.engine.shutdown().await;
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
    }
}

/// Accept one inbound connection: handshake as responder, register with
/// the engine, then keep answering further handshakes on the same
/// connection; a remote hub aggregating downstream peers opens one new
/// stream pair per peer it fronts.
async fn accept_connection(engine: Arc<RoutingEngine>, incoming: quinn::Incoming) -> Result<()> {
    let conn = incoming.await.context("failed to accept connection")?;
    let remote = conn.remote_address();

    let (connection, events) = PeerConnection::new(conn);
    let peer = match connection
        .authenticate(engine.ring(), HandshakeRole::Responder)
        .await
    {
        Ok(peer) => peer,
        Err(e) => {
            warn!(remote = %remote, error = %e, "handshake failed; dropping connection");
            connection.close();
            return Ok(());
        }
    };

    info!("Peer {}/{}", remote, peer);
    engine
        .open_connection(connection.clone(), Some(events), peer, None)
        .await;

    loop {
        match connection
            .authenticate(engine.ring(), HandshakeRole::Responder)
            .await
        {
            Ok(extra) => {
                debug!(remote = %remote, peer = %extra, "additional stream pair registered");
                engine
                    .open_connection(connection.clone(), None, extra, None)
                    .await;
            }
            Err(_) => break,
        }
    }

    Ok(())
}

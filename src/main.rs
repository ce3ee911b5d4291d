use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use voxmesh::{Directory, EmptyDirectory, Hub, HubConfig, StaticDirectory, DEFAULT_START_TTL};

#[derive(Clone, Debug)]
struct BootstrapHub {
    addr: SocketAddr,
    fingerprint: String,
}

impl FromStr for BootstrapHub {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap hub must include a fingerprint (format: IP:PORT/FINGERPRINT)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;

        voxmesh::PeerId::from_hex(id_part).context("invalid hex fingerprint")?;

        Ok(BootstrapHub {
            addr,
            fingerprint: id_part.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "voxmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Identity string advertised in our hub cookie.
    #[arg(long, default_value = "voxmesh")]
    hostname: String,

    #[arg(short = 'B', long = "bootstrap", value_name = "HUB")]
    bootstrap: Vec<BootstrapHub>,

    /// Directory holding public.asc / private.asc.
    #[arg(long, default_value = "keys")]
    key_dir: PathBuf,

    /// Passphrase sealing the private key file.
    #[arg(long, env = "VOXMESH_PASSPHRASE", default_value = "")]
    passphrase: String,

    /// Directory backing the store-and-forward queue.
    #[arg(long, default_value = "queue")]
    queue_dir: PathBuf,

    /// Local UDP address for the SIP signaling bridge.
    #[arg(long, default_value = "127.0.0.1:5060")]
    signaling: SocketAddr,

    /// PEM certificate chain for the QUIC server.
    #[arg(long)]
    ssl_cert_chain: Option<PathBuf>,

    /// PEM private key matching the certificate chain.
    #[arg(long)]
    ssl_private_key: Option<PathBuf>,

    /// External directory/DHT bootstrap address.
    #[arg(long)]
    directory_endpoint: Option<String>,

    /// Initial hop budget for synthetic messages.
    #[arg(long, default_value_t = DEFAULT_START_TTL)]
    start_ttl: i32,

    /// Drop messages whose hop budget is already spent instead of
    /// forwarding them one more hop.
    #[arg(long)]
    drop_on_zero_ttl: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = HubConfig {
        hostname: args.hostname,
        bind: args.bind,
        start_ttl: args.start_ttl,
        forward_on_zero_ttl: !args.drop_on_zero_ttl,
        ssl_cert_chain_path: args.ssl_cert_chain,
        ssl_private_key_path: args.ssl_private_key,
        directory_endpoint: args.directory_endpoint,
        key_dir: args.key_dir,
        key_passphrase: args.passphrase,
        queue_dir: args.queue_dir,
        signaling_bind: args.signaling,
    };

    // The static directory stands in for the external DHT when a
    // directory endpoint is configured; without one the hub serves only
    // directly attached peers and every lookup misses.
    let directory: Arc<dyn Directory> = if config.directory_endpoint.is_some() {
        Arc::new(StaticDirectory::new())
    } else {
        Arc::new(EmptyDirectory)
    };
    let hub = Hub::start(config, directory).await?;
    info!("Hub fingerprint: {}", hub.peer_id());
    info!("Signaling at {}", hub.signaling_addr()?);

    for peer in &args.bootstrap {
        info!("Dialing {}/{}", peer.addr, &peer.fingerprint[..16]);
        match hub.dial(peer.addr).await {
            Ok(remote) => {
                if remote.to_hex() != peer.fingerprint {
                    warn!(
                        expected = %peer.fingerprint,
                        actual = %remote,
                        "bootstrap hub presented a different fingerprint"
                    );
                } else {
                    info!("Connected to {}", remote);
                }
            }
            Err(e) => {
                warn!(error = %e, "bootstrap dial failed");
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, exiting gracefully");
    hub.shutdown().await;

    Ok(())
}

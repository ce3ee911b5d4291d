//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{sleep, timeout};

use voxmesh::{armor_decode, Hub, HubConfig, StaticDirectory};

/// Budget for any single asynchronous expectation.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A hub on loopback with throwaway key and queue directories.
pub struct TestHub {
    pub hub: Hub,
    pub directory: Arc<StaticDirectory>,
    _key_dir: TempDir,
    _queue_dir: TempDir,
}

pub async fn start_hub() -> TestHub {
    let key_dir = tempfile::tempdir().expect("key tempdir");
    let queue_dir = tempfile::tempdir().expect("queue tempdir");
    let directory = Arc::new(StaticDirectory::new());

    let config = HubConfig {
        bind: "127.0.0.1:0".parse().expect("addr"),
        signaling_bind: "127.0.0.1:0".parse().expect("addr"),
        key_dir: key_dir.path().to_path_buf(),
        key_passphrase: "test".to_string(),
        queue_dir: queue_dir.path().join("held"),
        ..HubConfig::default()
    };

    let hub = Hub::start(config, directory.clone())
        .await
        .expect("hub must start");
    TestHub {
        hub,
        directory,
        _key_dir: key_dir,
        _queue_dir: queue_dir,
    }
}

/// Poll until `check` passes or the test budget runs out.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(TEST_TIMEOUT, async {
        loop {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Reads armored blocks off a raw QUIC stream, for tests that play the
/// remote side of the handshake by hand.
pub struct BlockReader {
    recv: quinn::RecvStream,
    buf: Vec<u8>,
}

impl BlockReader {
    pub fn new(recv: quinn::RecvStream) -> Self {
        Self {
            recv,
            buf: Vec::new(),
        }
    }

    pub async fn read_block(&mut self, begin: &'static str, end: &'static str) -> Vec<u8> {
        loop {
            if let Some(pos) = self
                .buf
                .windows(end.len())
                .position(|w| w == end.as_bytes())
            {
                let mut cut = pos + end.len();
                while matches!(self.buf.get(cut), Some(b'\r') | Some(b'\n')) {
                    cut += 1;
                }
                let block: Vec<u8> = self.buf.drain(..cut).collect();
                let text = std::str::from_utf8(&block).expect("armor is ascii");
                return armor_decode(begin, end, text).expect("armor decodes");
            }
            let mut chunk = [0u8; 4096];
            match self.recv.read(&mut chunk).await.expect("stream read") {
                Some(n) => self.buf.extend_from_slice(&chunk[..n]),
                None => panic!("stream closed mid-block"),
            }
        }
    }
}

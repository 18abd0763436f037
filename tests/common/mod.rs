// Shared fixtures: an in-memory swarm engine and a relay wired around it.
#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;

use ma_relay_engine::config::RelayConfig;
use ma_relay_engine::engine::store::{SessionStore, StoreConfig};
use ma_relay_engine::server::auth::{AllowAll, Authorizer};
use ma_relay_engine::server::{RelayServer, RelayState};
use ma_relay_engine::torrent::{
    ByteStream, InfoHash, MagnetLink, SwarmEngine, SwarmError, SwarmFactory, TorrentFile,
    TorrentMetadata,
};

pub const FILE_LEN: usize = 1000;
pub const HASH_A: &str = "0123456789abcdef0123456789abcdef01234567";
pub const HASH_B: &str = "89abcdef0123456789abcdef0123456789abcdef";

pub fn magnet(hash: &str) -> String {
    format!("magnet:?xt=urn:btih:{hash}&dn=fixture")
}

/// Deterministic file body: byte `i` is `i % 251`.
pub fn file_bytes() -> Vec<u8> {
    (0..FILE_LEN).map(|i| (i % 251) as u8).collect()
}

#[derive(Debug, Clone, Copy)]
pub enum ReadyMode {
    Immediate,
    After(Duration),
    Never,
    Fail,
}

pub struct FakeEngine {
    info_hash: InfoHash,
    mode: ReadyMode,
    data: Arc<Vec<u8>>,
    fail_after_chunks: Option<usize>,
    pub destroyed: AtomicBool,
    pub selected: AtomicBool,
    pub reads: AtomicUsize,
}

impl FakeEngine {
    fn metadata_for(&self) -> TorrentMetadata {
        TorrentMetadata {
            info_hash: self.info_hash.to_hex(),
            name: "fixture".to_string(),
            total_length: self.data.len() as u64,
            files: vec![
                TorrentFile {
                    index: 0,
                    name: "movie.mp4".to_string(),
                    path: "fixture/movie.mp4".to_string(),
                    length: self.data.len() as u64,
                },
                TorrentFile {
                    index: 1,
                    name: "empty.txt".to_string(),
                    path: "fixture/empty.txt".to_string(),
                    length: 0,
                },
            ],
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SwarmEngine for FakeEngine {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    async fn ready(&self) -> Result<(), SwarmError> {
        match self.mode {
            ReadyMode::Immediate => Ok(()),
            ReadyMode::After(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            ReadyMode::Never => futures::future::pending().await,
            ReadyMode::Fail => Err(SwarmError::Metadata("no peers".into())),
        }
    }

    fn metadata(&self) -> Option<TorrentMetadata> {
        Some(self.metadata_for())
    }

    fn select_all(&self) {
        self.selected.store(true, Ordering::SeqCst);
    }

    fn open_read(&self, file_index: usize, start: u64, end: u64) -> Result<ByteStream, SwarmError> {
        if file_index != 0 {
            return Err(SwarmError::NoSuchFile(file_index));
        }
        if end < start || end as usize >= self.data.len() {
            return Err(SwarmError::OutOfRange { start, end });
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let slice = Bytes::copy_from_slice(&self.data[start as usize..=end as usize]);
        let mut chunks: Vec<io::Result<Bytes>> = (0..slice.len())
            .step_by(64)
            .map(|i| Ok(slice.slice(i..(i + 64).min(slice.len()))))
            .collect();
        if let Some(n) = self.fail_after_chunks {
            chunks.truncate(n);
            chunks.push(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "piece 0 not available",
            )));
        }
        Ok(futures::stream::iter(chunks).boxed())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Hands out `FakeEngine`s and remembers every one it built.
pub struct FakeFactory {
    mode: ReadyMode,
    fail_after_chunks: Option<usize>,
    pub spawned: AtomicUsize,
    pub engines: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeFactory {
    pub fn new(mode: ReadyMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            fail_after_chunks: None,
            spawned: AtomicUsize::new(0),
            engines: Mutex::new(Vec::new()),
        })
    }

    /// Engines whose reads yield `chunks` chunks of 64 bytes, then an error.
    pub fn failing_reads(chunks: usize) -> Arc<Self> {
        Arc::new(Self {
            mode: ReadyMode::Immediate,
            fail_after_chunks: Some(chunks),
            spawned: AtomicUsize::new(0),
            engines: Mutex::new(Vec::new()),
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn engine(&self, i: usize) -> Arc<FakeEngine> {
        Arc::clone(&self.engines.lock()[i])
    }
}

impl SwarmFactory for FakeFactory {
    fn spawn(&self, magnet: &MagnetLink) -> Result<Arc<dyn SwarmEngine>, SwarmError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let engine = Arc::new(FakeEngine {
            info_hash: magnet.info_hash,
            mode: self.mode,
            data: Arc::new(file_bytes()),
            fail_after_chunks: self.fail_after_chunks,
            destroyed: AtomicBool::new(false),
            selected: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        });
        self.engines.lock().push(Arc::clone(&engine));
        Ok(engine)
    }
}

pub fn test_config() -> RelayConfig {
    RelayConfig {
        max_sessions: 8,
        upstream_timeout_secs: 2,
        torrent_ready_timeout_secs: 1,
        dht_enabled: false,
        ..RelayConfig::default()
    }
}

pub fn relay_state(
    config: &RelayConfig,
    factory: Arc<FakeFactory>,
    auth: Arc<dyn Authorizer>,
) -> RelayState {
    let store = SessionStore::new(StoreConfig::from(config));
    RelayState::new(config, store, factory, auth).unwrap()
}

/// Relay bound to an ephemeral port, open to every caller.
pub async fn start_relay(factory: Arc<FakeFactory>) -> (RelayServer, RelayState) {
    let config = test_config();
    let state = relay_state(&config, factory, Arc::new(AllowAll));
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = RelayServer::start(addr, state.clone()).await.unwrap();
    (server, state)
}

/// Serve `app` on an ephemeral port and return its base URL.
pub async fn spawn_upstream(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://127.0.0.1:{port}")
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use ma_relay_engine::config::RelayConfig;
use ma_relay_engine::engine::store::{SessionStore, StoreConfig};
use ma_relay_engine::logging::init_tracing;
use ma_relay_engine::server::{auth, RelayServer, RelayState};
use ma_relay_engine::torrent::PeerSwarmFactory;

/// Grace period for in-flight responses once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Session relay for torrent, HLS and direct media sources.
#[derive(Parser, Debug)]
#[command(name = "ma-relay", version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "MA_RELAY_BIND", default_value = "127.0.0.1:8090")]
    bind: SocketAddr,

    /// JSON file with a `RelayConfig`; flags below override it.
    #[arg(long, env = "MA_RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "MA_RELAY_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    #[arg(long, env = "MA_RELAY_SESSION_TTL_SECS")]
    session_ttl_secs: Option<u64>,

    #[arg(long, env = "MA_RELAY_SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: Option<u64>,

    #[arg(long, env = "MA_RELAY_UPSTREAM_TIMEOUT_SECS")]
    upstream_timeout_secs: Option<u64>,

    #[arg(long, env = "MA_RELAY_TORRENT_READY_TIMEOUT_SECS")]
    torrent_ready_timeout_secs: Option<u64>,

    #[arg(long, env = "MA_RELAY_MAX_PEER_CONNECTIONS")]
    max_peer_connections: Option<usize>,

    #[arg(long, env = "MA_RELAY_PIECE_WAIT_TIMEOUT_SECS")]
    piece_wait_timeout_secs: Option<u64>,

    #[arg(long, env = "MA_RELAY_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    #[arg(long, env = "MA_RELAY_MAX_TORRENT_BYTES")]
    max_torrent_bytes: Option<u64>,

    /// Disable mainline DHT peer discovery.
    #[arg(long, env = "MA_RELAY_NO_DHT")]
    no_dht: bool,

    /// Shared secret for protected routes.
    #[arg(long, env = "MA_RELAY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

impl Cli {
    fn into_config(self) -> Result<RelayConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => RelayConfig::default(),
        };

        if let Some(v) = self.max_sessions {
            cfg.max_sessions = v;
        }
        if let Some(v) = self.session_ttl_secs {
            cfg.session_ttl_secs = v;
        }
        if let Some(v) = self.sweep_interval_secs {
            cfg.sweep_interval_secs = v;
        }
        if let Some(v) = self.upstream_timeout_secs {
            cfg.upstream_timeout_secs = v;
        }
        if let Some(v) = self.torrent_ready_timeout_secs {
            cfg.torrent_ready_timeout_secs = v;
        }
        if let Some(v) = self.max_peer_connections {
            cfg.max_peer_connections = v;
        }
        if let Some(v) = self.piece_wait_timeout_secs {
            cfg.piece_wait_timeout_secs = v;
        }
        if let Some(v) = self.download_dir {
            cfg.download_dir = v;
        }
        if let Some(v) = self.max_torrent_bytes {
            cfg.max_torrent_bytes = v;
        }
        if self.no_dht {
            cfg.dht_enabled = false;
        }
        if self.api_key.is_some() {
            cfg.api_key = self.api_key;
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let bind = cli.bind;
    let config = cli.into_config()?;

    std::fs::create_dir_all(&config.download_dir).with_context(|| {
        format!(
            "failed to create download dir {}",
            config.download_dir.display()
        )
    })?;

    let store = SessionStore::new(StoreConfig::from(&config));
    let factory = Arc::new(PeerSwarmFactory::new(&config));
    let authorizer = auth::from_api_key(config.api_key.as_deref());
    if config.api_key.is_none() {
        warn!("no api key configured, protected routes are open");
    }
    let state = RelayState::new(&config, Arc::clone(&store), factory, authorizer)?;

    let server = RelayServer::start(bind, state).await?;
    info!(
        "ma-relay ready on {} (max_sessions={}, dht={})",
        server.local_addr(),
        config.max_sessions,
        config.dht_enabled
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    if tokio::time::timeout(SHUTDOWN_GRACE, server.shutdown())
        .await
        .is_err()
    {
        warn!(
            "in-flight requests still open after {}s, dropping them",
            SHUTDOWN_GRACE.as_secs()
        );
    }
    store.shutdown();
    info!("ma-relay stopped");
    Ok(())
}

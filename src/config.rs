use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Largest manifest body the HLS adapter will buffer for rewriting (8 MB).
pub const MAX_MANIFEST_BYTES: usize = 8 * 1024 * 1024;

/// Upper bound on a single chunk yielded by a torrent file read (256 KB).
pub const MAX_READ_CHUNK_BYTES: u64 = 256 * 1024;

/// Number of pieces ahead of a reader's cursor that get download priority.
pub const READ_AHEAD_PIECES: usize = 8;

/// Block size requested from peers (16 KB, the de-facto wire maximum).
pub const PIECE_BLOCK_BYTES: u32 = 16 * 1024;

/// Outstanding block requests per peer connection.
pub const PEER_PIPELINE_DEPTH: usize = 16;

/// Deadline for establishing a TCP connection and BitTorrent handshake with a peer.
pub const PEER_CONNECT_TIMEOUT_SECS: u64 = 8;

/// A peer that stays silent this long is dropped.
pub const PEER_IDLE_TIMEOUT_SECS: u64 = 90;

/// Bad pieces tolerated from a single peer before disconnecting it.
pub const PEER_MAX_HASH_FAILURES: u32 = 3;

/// Deadline for a single tracker announce.
pub const TRACKER_TIMEOUT_SECS: u64 = 10;

/// Re-announce interval used when a tracker does not supply one.
pub const TRACKER_DEFAULT_INTERVAL_SECS: u64 = 300;

/// Interval between DHT peer lookups for a swarm.
pub const DHT_LOOKUP_INTERVAL_SECS: u64 = 300;

/// Port advertised to trackers. The engine is leech-only and never listens.
pub const ADVERTISED_PEER_PORT: u16 = 6881;

/// Top-level configuration for the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum number of concurrently registered sessions.
    pub max_sessions: usize,
    /// Idle time after which a session is swept.
    pub session_ttl_secs: u64,
    /// How often the store sweeps for idle sessions.
    pub sweep_interval_secs: u64,
    /// Deadline for upstream HTTP responses (manifest, segment, direct).
    pub upstream_timeout_secs: u64,
    /// Deadline for a torrent engine to resolve its metadata.
    pub torrent_ready_timeout_secs: u64,
    /// Peer connections per torrent engine.
    pub max_peer_connections: usize,
    /// How long a torrent read waits for a missing piece before failing.
    pub piece_wait_timeout_secs: u64,
    /// Directory holding partially downloaded torrent data.
    pub download_dir: PathBuf,
    /// Largest torrent (aggregate bytes) an engine will allocate on disk.
    pub max_torrent_bytes: u64,
    /// Whether swarms query the mainline DHT for peers.
    pub dht_enabled: bool,
    /// Shared secret required on protected routes. `None` disables the check.
    pub api_key: Option<String>,
}

impl RelayConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn torrent_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.torrent_ready_timeout_secs)
    }

    pub fn piece_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.piece_wait_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_sessions: 50,
            session_ttl_secs: 30 * 60,
            sweep_interval_secs: 60,
            upstream_timeout_secs: 15,
            torrent_ready_timeout_secs: 30,
            max_peer_connections: 40,
            piece_wait_timeout_secs: 120,
            download_dir: std::env::temp_dir().join("ma-relay"),
            max_torrent_bytes: 64 * 1024 * 1024 * 1024, // 64 GB
            dht_enabled: true,
            api_key: None,
        }
    }
}

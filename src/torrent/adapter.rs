// Torrent sessions: magnet resolution with per-hash coalescing, and ranged file streaming.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::{SwarmEngine, SwarmFactory};
use super::layout::TorrentMetadata;
use super::magnet::MagnetLink;
use crate::detect::mime::content_type_for;
use crate::engine::session::{Session, SessionKind, SessionLease};
use crate::engine::stats::RelayStats;
use crate::engine::store::SessionStore;
use crate::engine::transfer::TransferStream;
use crate::error::{RelayError, RelayResult};
use crate::range::{resolve_range, ByteRange};

pub fn file_path(session_id: &str, file_index: usize) -> String {
    format!("/api/torrent/{session_id}/files/{file_index}")
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentCreated {
    pub session_id: String,
    pub cached: bool,
    pub metadata: TorrentMetadata,
}

impl TorrentCreated {
    fn from_lease(lease: &SessionLease, cached: bool) -> Option<Self> {
        let handle = lease.torrent_handle()?;
        Some(Self {
            session_id: lease.id().to_string(),
            cached,
            metadata: handle.metadata.clone(),
        })
    }
}

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Holds a per-info-hash gate and drops the map entry when nobody else uses it.
struct GateEntry<'a> {
    gates: &'a Mutex<HashMap<String, Gate>>,
    key: String,
    gate: Gate,
}

impl Drop for GateEntry<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&self.gate) <= 2 {
            gates.remove(&self.key);
        }
    }
}

/// Destroys an engine that never made it into a session, including when
/// the creating request is cancelled mid-wait.
struct EngineGuard {
    engine: Arc<dyn SwarmEngine>,
    armed: bool,
}

impl EngineGuard {
    fn new(engine: Arc<dyn SwarmEngine>) -> Self {
        Self {
            engine,
            armed: true,
        }
    }

    fn disarm(mut self) -> Arc<dyn SwarmEngine> {
        self.armed = false;
        Arc::clone(&self.engine)
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if self.armed {
            debug!("destroying unregistered engine {}", self.engine.info_hash());
            self.engine.destroy();
        }
    }
}

pub struct TorrentAdapter {
    store: Arc<SessionStore>,
    factory: Arc<dyn SwarmFactory>,
    stats: Arc<RelayStats>,
    ready_timeout: Duration,
    gates: Mutex<HashMap<String, Gate>>,
}

impl TorrentAdapter {
    pub fn new(
        store: Arc<SessionStore>,
        factory: Arc<dyn SwarmFactory>,
        stats: Arc<RelayStats>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            store,
            factory,
            stats,
            ready_timeout,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, key: &str) -> Option<TorrentCreated> {
        let lease = self.store.find_by_dedupe_key(key)?;
        TorrentCreated::from_lease(&lease, true)
    }

    fn gate(&self, key: &str) -> GateEntry<'_> {
        let gate = Arc::clone(self.gates.lock().entry(key.to_string()).or_default());
        GateEntry {
            gates: &self.gates,
            key: key.to_string(),
            gate,
        }
    }

    /// Resolve a magnet into a torrent session, reusing a live one for the same info hash.
    pub async fn create(&self, magnet: &str) -> RelayResult<TorrentCreated> {
        let link = MagnetLink::parse(magnet)?;
        let key = link.info_hash.to_hex();

        if let Some(existing) = self.cached(&key) {
            debug!("torrent {} already has session {}", key, existing.session_id);
            return Ok(existing);
        }

        let entry = self.gate(&key);
        let _held = entry.gate.lock().await;

        // Whoever held the gate before us may have registered it.
        if let Some(existing) = self.cached(&key) {
            return Ok(existing);
        }
        self.resolve(&link).await
    }

    async fn resolve(&self, link: &MagnetLink) -> RelayResult<TorrentCreated> {
        let key = link.info_hash.to_hex();
        let engine = self
            .factory
            .spawn(link)
            .map_err(|e| RelayError::upstream(format!("failed to start swarm for {key}: {e}")))?;
        let guard = EngineGuard::new(Arc::clone(&engine));

        match tokio::time::timeout(self.ready_timeout, engine.ready()).await {
            Err(_) => {
                warn!(
                    "torrent {} not ready within {:?}, destroying engine",
                    key, self.ready_timeout
                );
                return Err(RelayError::UpstreamTimeout(format!(
                    "torrent {key} metadata not resolved within {}s",
                    self.ready_timeout.as_secs()
                )));
            }
            Ok(Err(e)) => {
                warn!("torrent {} failed to resolve: {}", key, e);
                return Err(RelayError::upstream(format!("torrent {key}: {e}")));
            }
            Ok(Ok(())) => {}
        }

        engine.select_all();
        let metadata = engine
            .metadata()
            .ok_or_else(|| RelayError::upstream(format!("torrent {key} ready without metadata")))?;

        let session = Session::torrent(guard.disarm(), metadata.clone());
        let session_id = session.id().to_string();
        // A rejected session is dropped here, which destroys its engine.
        self.store.add(session)?;
        info!(
            "created torrent session {} for {} ({} files, {} bytes)",
            session_id,
            key,
            metadata.files.len(),
            metadata.total_length
        );

        Ok(TorrentCreated {
            session_id,
            cached: false,
            metadata,
        })
    }

    /// Serve one file of a torrent session, honoring a single byte range.
    pub fn stream(
        &self,
        session_id: &str,
        file_index: usize,
        range_header: Option<&str>,
        head_only: bool,
    ) -> RelayResult<Response<Body>> {
        let lease = self.store.get_kind(session_id, SessionKind::Torrent)?;
        let handle = lease
            .torrent_handle()
            .ok_or_else(|| RelayError::Internal("torrent session without engine".into()))?;
        let file = handle.metadata.files.get(file_index).ok_or_else(|| {
            RelayError::not_found(format!(
                "session {session_id} has no file at index {file_index}"
            ))
        })?;
        let length = file.length;
        let content_type = content_type_for(&file.name);

        let builder = Response::builder()
            .header(header::CONTENT_TYPE, content_type)
            .header(header::ACCEPT_RANGES, "bytes");

        if length == 0 {
            return builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, 0)
                .body(Body::empty())
                .map_err(|e| RelayError::Internal(format!("failed to build response: {e}")));
        }

        let ranged = resolve_range(range_header, length)?;
        let span = ranged.unwrap_or_else(|| ByteRange::full(length));
        let mut builder = builder.header(header::CONTENT_LENGTH, span.len());
        builder = match ranged {
            Some(range) => builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_RANGE, range.content_range(length)),
            None => builder.status(StatusCode::OK),
        };

        debug!(
            "torrent session {} file {} bytes {}-{}/{} head={}",
            session_id, file_index, span.start, span.end, length, head_only
        );

        let body = if head_only {
            Body::empty()
        } else {
            let reader = handle
                .engine
                .open_read(file_index, span.start, span.end)
                .map_err(|e| RelayError::upstream(format!("torrent read failed: {e}")))?;
            TransferStream::new(reader, lease.clone(), Arc::clone(&self.stats)).into_body()
        };

        builder
            .body(body)
            .map_err(|e| RelayError::Internal(format!("failed to build response: {e}")))
    }
}

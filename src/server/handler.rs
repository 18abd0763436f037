// Axum request handlers - map relay routes onto store and adapter operations.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::auth::Authorizer;
use crate::config::RelayConfig;
use crate::direct::{DirectAdapter, DirectCreated};
use crate::engine::session::{SessionKind, SessionSnapshot};
use crate::engine::stats::{RelayStats, StatsSnapshot};
use crate::engine::store::{SessionStore, StoreStats};
use crate::error::{RelayError, RelayResult};
use crate::hls::adapter::{HlsAdapter, HlsCreated};
use crate::source::upstream::{Forwarded, UpstreamClient};
use crate::torrent::{SwarmFactory, TorrentAdapter, TorrentCreated};

/// Everything a request handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct RelayState {
    pub store: Arc<SessionStore>,
    pub torrent: Arc<TorrentAdapter>,
    pub hls: Arc<HlsAdapter>,
    pub direct: Arc<DirectAdapter>,
    pub stats: Arc<RelayStats>,
    pub auth: Arc<dyn Authorizer>,
    pub started: Instant,
}

impl RelayState {
    /// Wire the adapters around a shared store.
    pub fn new(
        config: &RelayConfig,
        store: Arc<SessionStore>,
        factory: Arc<dyn SwarmFactory>,
        auth: Arc<dyn Authorizer>,
    ) -> RelayResult<Self> {
        let stats = Arc::new(RelayStats::new());
        let upstream = Arc::new(UpstreamClient::new(config.upstream_timeout())?);
        let hls_upstream = Arc::new(UpstreamClient::same_origin(config.upstream_timeout())?);
        let torrent = Arc::new(TorrentAdapter::new(
            Arc::clone(&store),
            factory,
            Arc::clone(&stats),
            config.torrent_ready_timeout(),
        ));
        let hls = Arc::new(HlsAdapter::new(
            Arc::clone(&store),
            hls_upstream,
            Arc::clone(&stats),
        ));
        let direct = Arc::new(DirectAdapter::new(
            Arc::clone(&store),
            upstream,
            Arc::clone(&stats),
        ));

        Ok(Self {
            store,
            torrent,
            hls,
            direct,
            stats,
            auth,
            started: Instant::now(),
        })
    }

    /// 404 unless `id` names a live session of `kind`.
    fn ensure_kind(&self, id: &str, kind: SessionKind) -> RelayResult<()> {
        match self.store.kind_of(id) {
            Some(actual) if actual == kind => Ok(()),
            Some(actual) => Err(RelayError::TypeMismatch {
                id: id.to_string(),
                expected: kind,
                actual,
            }),
            None => Err(RelayError::not_found(format!("session {id}"))),
        }
    }
}

fn forwarded(headers: &HeaderMap) -> Forwarded {
    let text = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    Forwarded {
        range: text(header::RANGE),
        user_agent: text(header::USER_AGENT),
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> RelayResult<T> {
    body.map(|Json(v)| v)
        .map_err(|e| RelayError::validation(e.body_text()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub sessions: StoreStats,
    pub transfers: StatsSnapshot,
}

/// GET /health
pub async fn health(State(state): State<RelayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started.elapsed().as_secs(),
        sessions: state.store.stats(),
        transfers: state.stats.snapshot(),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateTorrentRequest {
    pub magnet: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateUrlRequest {
    pub url: String,
}

/// POST /api/torrent
pub async fn create_torrent(
    State(state): State<RelayState>,
    body: Result<Json<CreateTorrentRequest>, JsonRejection>,
) -> RelayResult<Json<TorrentCreated>> {
    let req = json_body(body)?;
    state.torrent.create(&req.magnet).await.map(Json)
}

fn file_index(raw: &str) -> RelayResult<usize> {
    raw.parse()
        .map_err(|_| RelayError::validation(format!("invalid file index {raw:?}")))
}

/// GET /api/torrent/{id}/files/{index}
pub async fn stream_torrent_file(
    State(state): State<RelayState>,
    Path((id, index)): Path<(String, String)>,
    headers: HeaderMap,
) -> RelayResult<Response> {
    serve_torrent_file(&state, &id, &index, &headers, false)
}

/// HEAD /api/torrent/{id}/files/{index} - headers only, no swarm read.
pub async fn head_torrent_file(
    State(state): State<RelayState>,
    Path((id, index)): Path<(String, String)>,
    headers: HeaderMap,
) -> RelayResult<Response> {
    serve_torrent_file(&state, &id, &index, &headers, true)
}

fn serve_torrent_file(
    state: &RelayState,
    id: &str,
    index: &str,
    headers: &HeaderMap,
    head_only: bool,
) -> RelayResult<Response> {
    state.ensure_kind(id, SessionKind::Torrent)?;
    let index = file_index(index)?;
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    state.torrent.stream(id, index, range, head_only)
}

/// POST /api/hls
pub async fn create_hls(
    State(state): State<RelayState>,
    body: Result<Json<CreateUrlRequest>, JsonRejection>,
) -> RelayResult<Json<HlsCreated>> {
    let req = json_body(body)?;
    state.hls.create(&req.url).map(Json)
}

/// GET /api/hls/{id}/manifest.m3u8
pub async fn hls_manifest(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> RelayResult<Response> {
    state.ensure_kind(&id, SessionKind::Hls)?;
    let fwd = forwarded(&headers);
    state.hls.get_manifest(&id, fwd.user_agent.as_deref()).await
}

/// GET /api/hls/{id}/segment/{*path}
pub async fn hls_segment(
    State(state): State<RelayState>,
    Path((id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> RelayResult<Response> {
    state.ensure_kind(&id, SessionKind::Hls)?;
    debug!("hls segment request session={} path={}", id, path);
    state.hls.get_segment(&id, &path, forwarded(&headers)).await
}

/// POST /api/direct
pub async fn create_direct(
    State(state): State<RelayState>,
    body: Result<Json<CreateUrlRequest>, JsonRejection>,
) -> RelayResult<Json<DirectCreated>> {
    let req = json_body(body)?;
    state.direct.create(&req.url).map(Json)
}

/// GET /api/direct/{id}/stream
pub async fn direct_stream(
    State(state): State<RelayState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> RelayResult<Response> {
    state.ensure_kind(&id, SessionKind::Direct)?;
    state.direct.stream(&id, forwarded(&headers)).await
}

/// GET /api/sessions
pub async fn list_sessions(State(state): State<RelayState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.store.list())
}

/// DELETE /api/sessions/{id} - 204 whether or not the session existed.
pub async fn delete_session(
    State(state): State<RelayState>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.store.remove(&id) {
        debug!("session {} removed on request", id);
    }
    StatusCode::NO_CONTENT
}

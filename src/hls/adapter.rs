use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Response, StatusCode},
};
use serde::Serialize;
use tracing::{debug, info};

use super::manifest::{rewrite_manifest, rewrite_nested_playlist};
use super::scope::resolve_within;
use crate::detect::mime::{is_playlist_content_type, MPEGURL};
use crate::engine::session::{Session, SessionKind};
use crate::engine::stats::RelayStats;
use crate::engine::store::SessionStore;
use crate::error::{RelayError, RelayResult};
use crate::source::upstream::{read_text_limited, validate_http_url, Forwarded, UpstreamClient};

pub fn manifest_path(session_id: &str) -> String {
    format!("/api/hls/{session_id}/manifest.m3u8")
}

pub fn segment_prefix(session_id: &str) -> String {
    format!("/api/hls/{session_id}/segment/")
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HlsCreated {
    pub session_id: String,
    pub manifest_path: String,
    pub segment_prefix: String,
}

pub struct HlsAdapter {
    store: Arc<SessionStore>,
    upstream: Arc<UpstreamClient>,
    stats: Arc<RelayStats>,
}

impl HlsAdapter {
    pub fn new(
        store: Arc<SessionStore>,
        upstream: Arc<UpstreamClient>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            store,
            upstream,
            stats,
        }
    }

    pub fn create(&self, url: &str) -> RelayResult<HlsCreated> {
        let base_url = validate_http_url(url)?;
        let session = Session::hls(base_url.clone());
        let session_id = session.id().to_string();
        self.store.add(session)?;
        info!("created hls session {} for {}", session_id, base_url);

        Ok(HlsCreated {
            manifest_path: manifest_path(&session_id),
            segment_prefix: segment_prefix(&session_id),
            session_id,
        })
    }

    /// Fetch the session's manifest and rewrite its relative references.
    pub async fn get_manifest(
        &self,
        session_id: &str,
        user_agent: Option<&str>,
    ) -> RelayResult<Response<Body>> {
        let lease = self.store.get_kind(session_id, SessionKind::Hls)?;
        let base_url = lease
            .upstream_url()
            .cloned()
            .ok_or_else(|| RelayError::Internal("hls session without base url".into()))?;

        let text = self.upstream.fetch_text(&base_url, user_agent).await?;
        let rewritten = rewrite_manifest(&text, &segment_prefix(session_id));
        debug!(
            "hls session {} manifest rewritten ({} -> {} bytes)",
            session_id,
            text.len(),
            rewritten.len()
        );
        playlist_response(rewritten)
    }

    /// Proxy a segment or variant playlist addressed relative to the base URL.
    pub async fn get_segment(
        &self,
        session_id: &str,
        relative_path: &str,
        fwd: Forwarded,
    ) -> RelayResult<Response<Body>> {
        let lease = self.store.get_kind(session_id, SessionKind::Hls)?;
        let base_url = lease
            .upstream_url()
            .cloned()
            .ok_or_else(|| RelayError::Internal("hls session without base url".into()))?;

        // Scope is enforced before anything goes over the network.
        let target = resolve_within(&base_url, relative_path)?;
        let resp = self.upstream.send(&target, &fwd).await?;
        // Redirects surface here only when they left the playlist's origin.
        if resp.status().is_redirection() && resp.headers().contains_key(header::LOCATION) {
            return Err(RelayError::upstream(format!(
                "{target} redirected off the playlist origin"
            )));
        }

        let looks_like_playlist = target.path().to_ascii_lowercase().ends_with(".m3u8")
            || resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(is_playlist_content_type);

        if looks_like_playlist && resp.status().is_success() {
            let text = read_text_limited(resp, self.upstream.timeout()).await?;
            let rewritten =
                rewrite_nested_playlist(&text, &target, &base_url, &segment_prefix(session_id));
            return playlist_response(rewritten);
        }

        debug!(
            "hls session {} relaying {} status={}",
            session_id,
            target,
            resp.status().as_u16()
        );
        self.upstream.mirror(resp, lease, Arc::clone(&self.stats))
    }
}

fn playlist_response(body: String) -> RelayResult<Response<Body>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MPEGURL)
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .body(Body::from(body))
        .map_err(|e| RelayError::Internal(format!("failed to build playlist response: {e}")))
}

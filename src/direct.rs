// Direct progressive-download relay for a single upstream URL.

use std::sync::Arc;

use axum::{body::Body, http::Response};
use serde::Serialize;
use tracing::{debug, info};

use crate::engine::session::{Session, SessionKind};
use crate::engine::stats::RelayStats;
use crate::engine::store::SessionStore;
use crate::error::{RelayError, RelayResult};
use crate::source::upstream::{validate_http_url, Forwarded, UpstreamClient};

pub fn stream_path(session_id: &str) -> String {
    format!("/api/direct/{session_id}/stream")
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectCreated {
    pub session_id: String,
    pub stream_path: String,
}

pub struct DirectAdapter {
    store: Arc<SessionStore>,
    upstream: Arc<UpstreamClient>,
    stats: Arc<RelayStats>,
}

impl DirectAdapter {
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

    pub fn create(&self, url: &str) -> RelayResult<DirectCreated> {
        let target_url = validate_http_url(url)?;
        let session = Session::direct(target_url.clone());
        let session_id = session.id().to_string();
        self.store.add(session)?;
        info!("created direct session {} for {}", session_id, target_url);

        Ok(DirectCreated {
            stream_path: stream_path(&session_id),
            session_id,
        })
    }

    /// Relay the session's target, forwarding Range and user-agent.
    pub async fn stream(&self, session_id: &str, fwd: Forwarded) -> RelayResult<Response<Body>> {
        let lease = self.store.get_kind(session_id, SessionKind::Direct)?;
        let target = lease
            .upstream_url()
            .cloned()
            .ok_or_else(|| RelayError::Internal("direct session without target url".into()))?;

        let resp = self.upstream.send(&target, &fwd).await?;
        debug!(
            "direct session {} upstream status={} range={:?}",
            session_id,
            resp.status().as_u16(),
            fwd.range
        );
        self.upstream.mirror(resp, lease, Arc::clone(&self.stats))
    }
}

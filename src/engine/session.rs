// Relay session - one registered backend resource plus its access bookkeeping.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::torrent::backend::SwarmEngine;
use crate::torrent::layout::TorrentMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Torrent,
    Hls,
    Direct,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Torrent => "torrent",
            Self::Hls => "hls",
            Self::Direct => "direct",
        };
        f.write_str(name)
    }
}

/// A resolved swarm engine together with the metadata computed when it became ready.
pub struct TorrentHandle {
    pub engine: Arc<dyn SwarmEngine>,
    pub metadata: TorrentMetadata,
}

pub enum SessionResource {
    Torrent(TorrentHandle),
    Hls { base_url: Url },
    Direct { target_url: Url },
}

impl SessionResource {
    pub fn kind(&self) -> SessionKind {
        match self {
            Self::Torrent(_) => SessionKind::Torrent,
            Self::Hls { .. } => SessionKind::Hls,
            Self::Direct { .. } => SessionKind::Direct,
        }
    }
}

pub struct Session {
    id: String,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    last_accessed: Mutex<Instant>,
    resource: SessionResource,
    /// Outstanding `SessionLease`s.
    leases: AtomicUsize,
    /// Set once the session has been deregistered from its store.
    retired: AtomicBool,
    /// Set once the backend resource has been released.
    released: AtomicBool,
}

impl Session {
    pub fn new(resource: SessionResource) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            created_wall: Utc::now(),
            last_accessed: Mutex::new(now),
            resource,
            leases: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn torrent(engine: Arc<dyn SwarmEngine>, metadata: TorrentMetadata) -> Self {
        Self::new(SessionResource::Torrent(TorrentHandle { engine, metadata }))
    }

    pub fn hls(base_url: Url) -> Self {
        Self::new(SessionResource::Hls { base_url })
    }

    pub fn direct(target_url: Url) -> Self {
        Self::new(SessionResource::Direct { target_url })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.resource.kind()
    }

    pub fn resource(&self) -> &SessionResource {
        &self.resource
    }

    pub fn torrent_handle(&self) -> Option<&TorrentHandle> {
        match &self.resource {
            SessionResource::Torrent(handle) => Some(handle),
            _ => None,
        }
    }

    /// Base manifest URL for HLS sessions, target URL for direct sessions.
    pub fn upstream_url(&self) -> Option<&Url> {
        match &self.resource {
            SessionResource::Hls { base_url } => Some(base_url),
            SessionResource::Direct { target_url } => Some(target_url),
            SessionResource::Torrent(_) => None,
        }
    }

    /// Info hash used to coalesce duplicate torrent sessions.
    pub fn dedupe_key(&self) -> Option<&str> {
        self.torrent_handle().map(|h| h.metadata.info_hash.as_str())
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    /// Refresh the last-access timestamp. Never moves it backwards.
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last = self.last_accessed.lock();
        if now > *last {
            *last = now;
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_accessed())
    }

    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Mark the session deregistered. The resource is released now if no lease
    /// is outstanding, otherwise when the last lease drops.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        if self.leases.load(Ordering::SeqCst) == 0 {
            self.release();
        }
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.resource {
            SessionResource::Torrent(handle) => {
                info!(
                    "releasing torrent session {} info_hash={}",
                    self.id, handle.metadata.info_hash
                );
                handle.engine.destroy();
            }
            SessionResource::Hls { .. } | SessionResource::Direct { .. } => {
                debug!("releasing {} session {}", self.kind(), self.id);
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let last = self.last_accessed();
        let since_created = last.saturating_duration_since(self.created_at);
        let last_wall = self.created_wall
            + chrono::Duration::from_std(since_created).unwrap_or_else(|_| chrono::Duration::zero());
        SessionSnapshot {
            id: self.id.clone(),
            kind: self.kind(),
            created_at: self.created_wall,
            last_accessed_at: last_wall,
            idle_secs: self.idle_for(Instant::now()).as_secs(),
            active_leases: self.active_leases(),
            dedupe_key: self.dedupe_key().map(str::to_string),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Covers stores dropped without an explicit shutdown.
        self.release();
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub active_leases: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
}

/// Liveness token handed out by the store on lookup.
///
/// While any lease on a session is alive its backend resource stays intact,
/// even if the session is evicted or swept in the meantime; release is
/// deferred to the drop of the last lease.
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    pub(crate) fn acquire(session: &Arc<Session>) -> Self {
        session.leases.fetch_add(1, Ordering::SeqCst);
        Self {
            session: Arc::clone(session),
        }
    }
}

impl Clone for SessionLease {
    fn clone(&self) -> Self {
        Self::acquire(&self.session)
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let remaining = self.session.leases.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.session.is_retired() {
            self.session.release();
        }
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("id", &self.session.id)
            .field("kind", &self.session.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hls_session() -> Arc<Session> {
        Arc::new(Session::hls(
            Url::parse("https://cdn.example.com/live/index.m3u8").unwrap(),
        ))
    }

    #[test]
    fn test_ids_are_unique() {
        let a = hls_session();
        let b = hls_session();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.kind(), SessionKind::Hls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_is_monotonic() {
        let session = hls_session();
        let before = session.last_accessed();
        tokio::time::advance(Duration::from_secs(5)).await;
        session.touch();
        let after = session.last_accessed();
        assert!(after >= before);
        assert_eq!(after - before, Duration::from_secs(5));
    }

    #[test]
    fn test_retire_without_leases_releases_immediately() {
        let session = hls_session();
        session.retire();
        assert!(session.is_released());
    }

    #[test]
    fn test_retire_with_lease_defers_release() {
        let session = hls_session();
        let lease = SessionLease::acquire(&session);
        let second = lease.clone();
        assert_eq!(session.active_leases(), 2);

        session.retire();
        assert!(!session.is_released());

        drop(lease);
        assert!(!session.is_released());
        drop(second);
        assert!(session.is_released());
        assert_eq!(session.active_leases(), 0);
    }

    #[test]
    fn test_snapshot_fields() {
        let session = hls_session();
        let snap = session.snapshot();
        assert_eq!(snap.id, session.id());
        assert_eq!(snap.kind, SessionKind::Hls);
        assert!(snap.dedupe_key.is_none());
        assert!(snap.last_accessed_at >= snap.created_at);
    }
}

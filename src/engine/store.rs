// In-memory session registry with LRU capacity eviction and idle-TTL sweeping.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::session::{Session, SessionKind, SessionLease, SessionSnapshot};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_sessions: usize,
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl From<&RelayConfig> for StoreConfig {
    fn from(cfg: &RelayConfig) -> Self {
        Self {
            max_sessions: cfg.max_sessions,
            ttl: cfg.session_ttl(),
            sweep_interval: cfg.sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total: usize,
    pub torrent: usize,
    pub hls: usize,
    pub direct: usize,
    pub max_sessions: usize,
}

struct Entry {
    session: Arc<Session>,
    /// Insertion order; breaks `last_accessed` ties during eviction.
    seq: u64,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, Entry>,
    by_dedupe_key: HashMap<String, String>,
    next_seq: u64,
}

impl StoreInner {
    fn take(&mut self, id: &str) -> Option<Arc<Session>> {
        let entry = self.entries.remove(id)?;
        if let Some(key) = entry.session.dedupe_key() {
            if self.by_dedupe_key.get(key).map(String::as_str) == Some(id) {
                self.by_dedupe_key.remove(key);
            }
        }
        Some(entry.session)
    }

    /// Id of the least-recently-accessed entry, oldest insertion first on ties.
    fn lru_candidate(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.session.last_accessed(), e.seq))
            .map(|(id, _)| id.clone())
    }
}

/// Registry of live sessions.
///
/// Every mutation (capacity check + evict + insert, lookup + touch + lease,
/// removal) happens inside a single critical section. Resources of removed
/// sessions are released outside the lock, and only once no lease is held.
pub struct SessionStore {
    inner: Mutex<StoreInner>,
    config: StoreConfig,
    shutdown_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    /// Create a store and start its background sweep task. Must be called
    /// from within a Tokio runtime.
    pub fn new(config: StoreConfig) -> Arc<Self> {
        let store = Arc::new(Self {
            inner: Mutex::new(StoreInner::default()),
            config,
            shutdown_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::sweep_loop(
            Arc::downgrade(&store),
            store.config.sweep_interval,
            store.shutdown_token.clone(),
        ));
        *store.sweeper.lock() = Some(handle);

        info!(
            "session store started max_sessions={} ttl={}s sweep_interval={}s",
            store.config.max_sessions,
            store.config.ttl.as_secs(),
            store.config.sweep_interval.as_secs()
        );
        store
    }

    async fn sweep_loop(store: Weak<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(store) = store.upgrade() else {
                break;
            };
            store.sweep();
        }
        debug!("session sweep task stopped");
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Register a session, evicting least-recently-accessed sessions first if
    /// the store is at capacity.
    pub fn add(&self, session: Session) -> RelayResult<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(RelayError::Internal("session store is shut down".into()));
        }
        if self.config.max_sessions == 0 {
            return Err(RelayError::Internal(
                "session store has no capacity".into(),
            ));
        }

        let session = Arc::new(session);
        let id = session.id().to_string();
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.entries.contains_key(&id) {
                return Err(RelayError::Internal(format!("duplicate session id {id}")));
            }
            while inner.entries.len() >= self.config.max_sessions {
                let Some(victim) = inner.lru_candidate() else {
                    break;
                };
                if let Some(s) = inner.take(&victim) {
                    evicted.push(s);
                }
            }
            if let Some(key) = session.dedupe_key() {
                inner.by_dedupe_key.insert(key.to_string(), id.clone());
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.insert(id.clone(), Entry { session: Arc::clone(&session), seq });
        }

        for victim in evicted {
            info!(
                "evicted {} session {} (capacity {})",
                victim.kind(),
                victim.id(),
                self.config.max_sessions
            );
            victim.retire();
        }
        debug!("registered {} session {}", session.kind(), id);
        Ok(())
    }

    /// Look up a session, refreshing its last-access time and leasing it.
    pub fn get(&self, id: &str) -> Option<SessionLease> {
        let inner = self.inner.lock();
        let entry = inner.entries.get(id)?;
        entry.session.touch();
        Some(SessionLease::acquire(&entry.session))
    }

    /// `get` restricted to sessions of one kind.
    pub fn get_kind(&self, id: &str, kind: SessionKind) -> RelayResult<SessionLease> {
        let lease = self
            .get(id)
            .ok_or_else(|| RelayError::not_found(format!("session {id}")))?;
        if lease.kind() != kind {
            return Err(RelayError::TypeMismatch {
                id: id.to_string(),
                expected: kind,
                actual: lease.kind(),
            });
        }
        Ok(lease)
    }

    /// Kind of a registered session, without refreshing it.
    pub fn kind_of(&self, id: &str) -> Option<SessionKind> {
        self.inner.lock().entries.get(id).map(|e| e.session.kind())
    }

    pub fn find_by_dedupe_key(&self, key: &str) -> Option<SessionLease> {
        let inner = self.inner.lock();
        let id = inner.by_dedupe_key.get(key)?;
        let entry = inner.entries.get(id)?;
        entry.session.touch();
        Some(SessionLease::acquire(&entry.session))
    }

    /// Deregister a session. Returns `false` if it was not registered.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.inner.lock().take(id);
        match removed {
            Some(session) => {
                info!("removed {} session {}", session.kind(), id);
                session.retire();
                true
            }
            None => false,
        }
    }

    /// Remove every session idle for longer than the TTL. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.session.idle_for(now) > self.config.ttl)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| inner.take(id)).collect()
        };

        for session in &expired {
            info!(
                "expired idle {} session {} after {}s",
                session.kind(),
                session.id(),
                session.idle_for(now).as_secs()
            );
            session.retire();
        }
        expired.len()
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<(u64, SessionSnapshot)> = {
            let inner = self.inner.lock();
            inner
                .entries
                .values()
                .map(|e| (e.seq, e.session.snapshot()))
                .collect()
        };
        sessions.sort_by_key(|(seq, _)| *seq);
        sessions.into_iter().map(|(_, s)| s).collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        let mut stats = StoreStats {
            total: inner.entries.len(),
            max_sessions: self.config.max_sessions,
            ..StoreStats::default()
        };
        for entry in inner.entries.values() {
            match entry.session.kind() {
                SessionKind::Torrent => stats.torrent += 1,
                SessionKind::Hls => stats.hls += 1,
                SessionKind::Direct => stats.direct += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Stop the sweep task and retire every remaining session.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        let drained: Vec<Arc<Session>> = {
            let mut inner = self.inner.lock();
            inner.by_dedupe_key.clear();
            inner.entries.drain().map(|(_, e)| e.session).collect()
        };
        if !drained.is_empty() {
            info!("session store shutting down, releasing {} sessions", drained.len());
        }
        for session in drained {
            session.retire();
        }
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

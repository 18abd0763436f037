// Production swarm engine: peer discovery, bounded peer connections, piece reads.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backend::{ByteStream, SwarmEngine, SwarmError, SwarmFactory};
use super::dht::DhtDiscovery;
use super::exchange::{MetadataAssembler, MAX_METADATA_BYTES};
use super::layout::{InfoDict, LayoutError, TorrentLayout, TorrentMetadata};
use super::magnet::{InfoHash, MagnetLink};
use super::peer;
use super::picker::PiecePicker;
use super::storage::PieceStorage;
use super::tracker::{AnnounceRequest, TrackerClient};
use crate::config::{RelayConfig, DHT_LOOKUP_INTERVAL_SECS, MAX_READ_CHUNK_BYTES, READ_AHEAD_PIECES};

#[derive(Debug, Clone)]
pub struct SwarmConfig {
    pub download_dir: PathBuf,
    pub max_peer_connections: usize,
    pub piece_wait_timeout: Duration,
    pub max_torrent_bytes: u64,
}

impl From<&RelayConfig> for SwarmConfig {
    fn from(cfg: &RelayConfig) -> Self {
        Self {
            download_dir: cfg.download_dir.clone(),
            max_peer_connections: cfg.max_peer_connections.max(1),
            piece_wait_timeout: cfg.piece_wait_timeout(),
            max_torrent_bytes: cfg.max_torrent_bytes,
        }
    }
}

#[derive(Debug, Clone)]
enum SwarmStatus {
    Resolving,
    Ready,
    Failed(SwarmError),
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PieceOutcome {
    Stored,
    Duplicate,
    Corrupt,
    Failed,
}

/// Everything that exists once the info dictionary is known.
pub(crate) struct TorrentData {
    pub layout: TorrentLayout,
    pub storage: PieceStorage,
    pub picker: Mutex<PiecePicker>,
}

impl TorrentData {
    /// Verify a downloaded piece against its hash and store it.
    pub fn record_piece(&self, index: usize, data: &[u8]) -> PieceOutcome {
        let Some(expected) = self.layout.piece_hash(index) else {
            return PieceOutcome::Failed;
        };
        let digest: [u8; 20] = Sha1::digest(data).into();
        if &digest != expected {
            return PieceOutcome::Corrupt;
        }
        if let Err(e) = self.storage.put_piece(index, data) {
            error!("failed to store piece {}: {}", index, e);
            return PieceOutcome::Failed;
        }
        if self.picker.lock().complete(index) {
            PieceOutcome::Stored
        } else {
            PieceOutcome::Duplicate
        }
    }

    pub fn is_complete(&self) -> bool {
        self.storage.is_complete()
    }
}

#[derive(Default)]
struct PeerBook {
    /// Queued or connected.
    known: HashSet<SocketAddr>,
    queue: VecDeque<SocketAddr>,
}

/// State shared by the engine handle, its background tasks and its readers.
pub(crate) struct SwarmShared {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub config: SwarmConfig,
    pub cancel: CancellationToken,
    status: watch::Sender<SwarmStatus>,
    torrent: OnceLock<Arc<TorrentData>>,
    metadata: Mutex<Option<MetadataAssembler>>,
    /// Bumped on metadata, selection, window and piece changes.
    progress: watch::Sender<u64>,
    peers: Mutex<PeerBook>,
    peer_added: Notify,
}

impl SwarmShared {
    fn new(info_hash: InfoHash, config: SwarmConfig) -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-MR0100-");
        for (slot, byte) in peer_id[8..]
            .iter_mut()
            .zip(rand::thread_rng().sample_iter(&Alphanumeric))
        {
            *slot = byte;
        }
        Self {
            info_hash,
            peer_id,
            config,
            cancel: CancellationToken::new(),
            status: watch::channel(SwarmStatus::Resolving).0,
            torrent: OnceLock::new(),
            metadata: Mutex::new(None),
            progress: watch::channel(0).0,
            peers: Mutex::new(PeerBook::default()),
            peer_added: Notify::new(),
        }
    }

    pub fn torrent(&self) -> Option<&Arc<TorrentData>> {
        self.torrent.get()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<u64> {
        self.progress.subscribe()
    }

    pub fn bump(&self) {
        self.progress.send_modify(|g| *g = g.wrapping_add(1));
    }

    fn fail(&self, err: SwarmError) {
        warn!("swarm {} failed: {}", self.info_hash, err);
        self.status.send_if_modified(|status| {
            if matches!(status, SwarmStatus::Resolving) {
                *status = SwarmStatus::Failed(err);
                true
            } else {
                false
            }
        });
    }

    pub fn add_peers<I>(&self, addrs: I) -> usize
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        let added = {
            let mut book = self.peers.lock();
            let mut added = 0;
            for addr in addrs {
                if addr.port() != 0 && book.known.insert(addr) {
                    book.queue.push_back(addr);
                    added += 1;
                }
            }
            added
        };
        if added > 0 {
            self.peer_added.notify_one();
        }
        added
    }

    fn next_peer(&self) -> Option<SocketAddr> {
        self.peers.lock().queue.pop_front()
    }

    /// Allow a disconnected peer to be queued again when rediscovered.
    fn forget_peer(&self, addr: SocketAddr) {
        self.peers.lock().known.remove(&addr);
    }

    /// Metadata pieces still needed, after registering `size` if it is the first one seen.
    pub fn metadata_wanted(&self, size: Option<usize>) -> Vec<u32> {
        if self.torrent().is_some() {
            return Vec::new();
        }
        let size = size.filter(|&n| n > 0 && n <= MAX_METADATA_BYTES);
        let mut slot = self.metadata.lock();
        if let Some(size) = size {
            // An untouched assembler sized by a different peer is replaced.
            let replace = slot
                .as_ref()
                .map_or(true, |asm| asm.total_size() != size && asm.is_untouched());
            if replace {
                debug!("swarm {} metadata is {} bytes", self.info_hash, size);
                *slot = Some(MetadataAssembler::new(size));
            }
        }
        match slot.as_ref() {
            Some(asm) if size.map_or(true, |s| s == asm.total_size()) => asm.missing(),
            _ => Vec::new(),
        }
    }

    /// Store a metadata piece. Pieces only land in an assembler opened from a
    /// handshake-advertised size; unsolicited sizes are ignored.
    pub fn accept_metadata_piece(&self, piece: u32, total_size: usize, data: Bytes) {
        if self.torrent().is_some() || total_size == 0 || total_size > MAX_METADATA_BYTES {
            return;
        }
        let assembled = {
            let mut slot = self.metadata.lock();
            let Some(asm) = slot.as_mut() else {
                return;
            };
            if !asm.insert(piece, total_size, data) {
                return;
            }
            match asm.assemble() {
                Some(bytes) => {
                    *slot = None;
                    bytes
                }
                None => return,
            }
        };
        self.install_metadata(&assembled);
    }

    fn install_metadata(&self, raw: &[u8]) {
        let info = match InfoDict::from_verified_bytes(raw, &self.info_hash) {
            Ok(info) => info,
            Err(LayoutError::HashMismatch { actual, .. }) => {
                // Another peer may still deliver the right bytes.
                warn!(
                    "swarm {} discarded metadata hashing to {}",
                    self.info_hash, actual
                );
                return;
            }
            Err(e) => return self.fail(SwarmError::Metadata(e.to_string())),
        };
        let layout = match TorrentLayout::new(self.info_hash, &info) {
            Ok(layout) => layout,
            Err(e) => return self.fail(SwarmError::Metadata(e.to_string())),
        };
        if layout.total_length() > self.config.max_torrent_bytes {
            return self.fail(SwarmError::TooLarge {
                length: layout.total_length(),
                limit: self.config.max_torrent_bytes,
            });
        }
        let storage = match PieceStorage::new(
            &self.config.download_dir,
            &format!("{}-{}", self.info_hash.to_hex(), Uuid::new_v4().simple()),
            layout.total_length(),
            layout.piece_length(),
        ) {
            Ok(storage) => storage,
            Err(e) => return self.fail(SwarmError::Storage(e.to_string())),
        };

        info!(
            "swarm {} resolved {:?}: {} files, {} bytes, {} pieces",
            self.info_hash,
            info.name,
            layout.files().len(),
            layout.total_length(),
            layout.piece_count()
        );
        let data = TorrentData {
            picker: Mutex::new(PiecePicker::new(layout.piece_count())),
            layout,
            storage,
        };
        if self.torrent.set(Arc::new(data)).is_ok() {
            self.status.send_if_modified(|status| {
                if matches!(status, SwarmStatus::Resolving) {
                    *status = SwarmStatus::Ready;
                    true
                } else {
                    false
                }
            });
            self.bump();
        }
    }

    fn announce_request(&self) -> AnnounceRequest {
        let (downloaded, left) = match self.torrent() {
            Some(t) => {
                let left = t.picker.lock().remaining_bytes(|i| t.layout.piece_len(i));
                (t.storage.verified_bytes(), left)
            }
            None => (0, 1),
        };
        AnnounceRequest {
            info_hash: *self.info_hash.as_bytes(),
            peer_id: self.peer_id,
            downloaded,
            left,
        }
    }

    fn is_complete(&self) -> bool {
        self.torrent().is_some_and(|t| t.is_complete())
    }
}

pub struct PeerSwarm {
    shared: Arc<SwarmShared>,
}

impl PeerSwarm {
    /// Start discovery and the connection manager for `magnet`.
    pub fn spawn(
        magnet: &MagnetLink,
        config: SwarmConfig,
        trackers: Arc<TrackerClient>,
        dht: Option<DhtDiscovery>,
    ) -> Arc<Self> {
        let shared = Arc::new(SwarmShared::new(magnet.info_hash, config));
        info!(
            "starting swarm {} ({} trackers, {} explicit peers, dht={})",
            magnet.info_hash,
            magnet.trackers.len(),
            magnet.peers.len(),
            dht.is_some()
        );

        if magnet.trackers.is_empty() && magnet.peers.is_empty() && dht.is_none() {
            shared.fail(SwarmError::Metadata("no peer sources available".into()));
        }

        if !magnet.peers.is_empty() {
            tokio::spawn(resolve_explicit_peers(
                Arc::clone(&shared),
                magnet.peers.clone(),
            ));
        }
        for tracker in &magnet.trackers {
            tokio::spawn(tracker_loop(
                Arc::clone(&shared),
                tracker.clone(),
                Arc::clone(&trackers),
            ));
        }
        if let Some(dht) = dht {
            tokio::spawn(dht_loop(Arc::clone(&shared), dht));
        }
        tokio::spawn(connect_loop(Arc::clone(&shared)));

        Arc::new(Self { shared })
    }
}

impl Drop for PeerSwarm {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[async_trait]
impl SwarmEngine for PeerSwarm {
    fn info_hash(&self) -> InfoHash {
        self.shared.info_hash
    }

    async fn ready(&self) -> Result<(), SwarmError> {
        let mut rx = self.shared.status.subscribe();
        loop {
            let status = rx.borrow_and_update().clone();
            match status {
                SwarmStatus::Ready => return Ok(()),
                SwarmStatus::Failed(e) => return Err(e),
                SwarmStatus::Destroyed => return Err(SwarmError::Destroyed),
                SwarmStatus::Resolving => {}
            }
            if rx.changed().await.is_err() {
                return Err(SwarmError::Destroyed);
            }
        }
    }

    fn metadata(&self) -> Option<TorrentMetadata> {
        self.shared.torrent().map(|t| t.layout.metadata())
    }

    fn select_all(&self) {
        if let Some(t) = self.shared.torrent() {
            t.picker.lock().want_all();
            self.shared.bump();
        }
    }

    fn open_read(&self, file_index: usize, start: u64, end: u64) -> Result<ByteStream, SwarmError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SwarmError::Destroyed);
        }
        let torrent = Arc::clone(self.shared.torrent().ok_or(SwarmError::NotReady)?);
        let file = torrent
            .layout
            .file(file_index)
            .ok_or(SwarmError::NoSuchFile(file_index))?;
        if start > end || end >= file.length {
            return Err(SwarmError::OutOfRange { start, end });
        }

        let reader = torrent.picker.lock().register_reader();
        let cursor = ReadCursor {
            pos: file.offset + start,
            end: file.offset + end,
            window_start: None,
            progress: self.shared.subscribe_progress(),
            shared: Arc::clone(&self.shared),
            guard: ReaderGuard {
                torrent: Arc::clone(&torrent),
                reader,
            },
            torrent,
            done: false,
        };

        let stream = futures::stream::unfold(cursor, |mut cursor| async move {
            match cursor.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), cursor)),
                Ok(None) => None,
                Err(e) => {
                    cursor.done = true;
                    Some((Err(e.into()), cursor))
                }
            }
        });
        Ok(stream.boxed())
    }

    fn destroy(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        info!("destroying swarm {}", self.shared.info_hash);
        self.shared.cancel.cancel();
        self.shared.status.send_replace(SwarmStatus::Destroyed);
        self.shared.bump();
    }
}

/// Removes a reader's priority window when its stream is dropped.
struct ReaderGuard {
    torrent: Arc<TorrentData>,
    reader: u64,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.torrent.picker.lock().remove_reader(self.reader);
    }
}

struct ReadCursor {
    shared: Arc<SwarmShared>,
    torrent: Arc<TorrentData>,
    guard: ReaderGuard,
    progress: watch::Receiver<u64>,
    /// Absolute offsets, `end` inclusive.
    pos: u64,
    end: u64,
    window_start: Option<usize>,
    done: bool,
}

impl ReadCursor {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SwarmError> {
        if self.done || self.pos > self.end {
            return Ok(None);
        }

        let layout = &self.torrent.layout;
        let piece = layout.piece_of(self.pos);
        if self.window_start != Some(piece) {
            self.window_start = Some(piece);
            self.torrent
                .picker
                .lock()
                .set_window(self.guard.reader, piece, READ_AHEAD_PIECES);
            self.shared.bump();
        }

        self.wait_for_piece(piece).await?;

        let layout = &self.torrent.layout;
        let piece_last = (piece as u64 * layout.piece_length() + layout.piece_len(piece)) - 1;
        let last = self
            .end
            .min(piece_last)
            .min(self.pos + MAX_READ_CHUNK_BYTES - 1);
        let len = (last - self.pos + 1) as usize;
        let chunk = self
            .torrent
            .storage
            .read_at(self.pos, len)
            .ok_or_else(|| SwarmError::Storage(format!("piece {piece} vanished from storage")))?;
        self.pos = last + 1;
        Ok(Some(chunk))
    }

    async fn wait_for_piece(&mut self, piece: usize) -> Result<(), SwarmError> {
        let deadline = Instant::now() + self.shared.config.piece_wait_timeout;
        loop {
            if self.torrent.storage.has_piece(piece) {
                return Ok(());
            }
            if self.shared.cancel.is_cancelled() {
                return Err(SwarmError::Destroyed);
            }
            tokio::select! {
                changed = self.progress.changed() => {
                    if changed.is_err() {
                        return Err(SwarmError::Destroyed);
                    }
                }
                _ = self.shared.cancel.cancelled() => return Err(SwarmError::Destroyed),
                _ = tokio::time::sleep_until(deadline) => return Err(SwarmError::PieceTimeout(piece)),
            }
        }
    }
}

async fn resolve_explicit_peers(shared: Arc<SwarmShared>, peers: Vec<String>) {
    for peer in peers {
        match tokio::net::lookup_host(peer.as_str()).await {
            Ok(addrs) => {
                shared.add_peers(addrs);
            }
            Err(e) => debug!("swarm {} cannot resolve peer {}: {}", shared.info_hash, peer, e),
        }
    }
}

async fn tracker_loop(shared: Arc<SwarmShared>, tracker: String, client: Arc<TrackerClient>) {
    let mut failures = 0u32;
    loop {
        let req = shared.announce_request();
        let result = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            result = client.announce(&tracker, &req) => result,
        };
        let wait = match result {
            Ok(resp) => {
                failures = 0;
                let added = shared.add_peers(resp.peers.iter().copied());
                debug!(
                    "swarm {} tracker {} returned {} peers ({} new)",
                    shared.info_hash,
                    tracker,
                    resp.peers.len(),
                    added
                );
                resp.interval
            }
            Err(e) => {
                failures += 1;
                debug!(
                    "swarm {} tracker {} failed ({}): {}",
                    shared.info_hash, tracker, failures, e
                );
                Duration::from_secs(15u64 << failures.min(5))
            }
        };
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

async fn dht_loop(shared: Arc<SwarmShared>, dht: DhtDiscovery) {
    loop {
        let lookup = dht.lookup(&shared.info_hash, |batch| {
            shared.add_peers(batch);
        });
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            found = lookup => debug!("swarm {} dht round found {} peers", shared.info_hash, found),
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(DHT_LOOKUP_INTERVAL_SECS)) => {}
        }
    }
}

/// Keeps up to `max_peer_connections` peer tasks running from the discovery queue.
async fn connect_loop(shared: Arc<SwarmShared>) {
    let permits = Arc::new(Semaphore::new(shared.config.max_peer_connections));
    loop {
        let permit = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let addr = loop {
            if shared.is_complete() {
                debug!("swarm {} complete, no new connections", shared.info_hash);
                return;
            }
            if let Some(addr) = shared.next_peer() {
                break addr;
            }
            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                _ = shared.peer_added.notified() => {}
            }
        };

        let task_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            match peer::run(Arc::clone(&task_shared), addr).await {
                Ok(()) => debug!("peer {} closed", addr),
                Err(e) => debug!("peer {} dropped: {}", addr, e),
            }
            task_shared.forget_peer(addr);
            drop(permit);
        });
    }
}

/// Builds `PeerSwarm`s sharing one tracker client and, when enabled, one DHT node.
pub struct PeerSwarmFactory {
    config: SwarmConfig,
    trackers: Arc<TrackerClient>,
    dht: Option<DhtDiscovery>,
}

impl PeerSwarmFactory {
    pub fn new(cfg: &RelayConfig) -> Self {
        let dht = if cfg.dht_enabled {
            match DhtDiscovery::start() {
                Ok(dht) => Some(dht),
                Err(e) => {
                    warn!("dht unavailable, continuing without it: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            config: SwarmConfig::from(cfg),
            trackers: Arc::new(TrackerClient::new()),
            dht,
        }
    }
}

impl SwarmFactory for PeerSwarmFactory {
    fn spawn(&self, magnet: &MagnetLink) -> Result<Arc<dyn SwarmEngine>, SwarmError> {
        let swarm = PeerSwarm::spawn(
            magnet,
            self.config.clone(),
            Arc::clone(&self.trackers),
            self.dht.clone(),
        );
        Ok(swarm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_bytes::ByteBuf;

    #[derive(Serialize)]
    struct RawInfo {
        length: u64,
        name: String,
        #[serde(rename = "piece length")]
        piece_length: u64,
        pieces: ByteBuf,
    }

    /// Single-file info dictionary over `data`, plus its info hash.
    fn info_for(data: &[u8], piece_length: u64) -> (Vec<u8>, InfoHash) {
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_length as usize) {
            pieces.extend_from_slice(&Sha1::digest(chunk));
        }
        let raw = serde_bencode::to_bytes(&RawInfo {
            length: data.len() as u64,
            name: "clip.mp4".into(),
            piece_length,
            pieces: ByteBuf::from(pieces),
        })
        .unwrap();
        let hash: [u8; 20] = Sha1::digest(&raw).into();
        (raw, InfoHash::from_bytes(hash))
    }

    fn config(dir: &std::path::Path) -> SwarmConfig {
        SwarmConfig {
            download_dir: dir.to_path_buf(),
            max_peer_connections: 4,
            piece_wait_timeout: Duration::from_secs(5),
            max_torrent_bytes: 1 << 20,
        }
    }

    fn swarm(hash: InfoHash, dir: &std::path::Path) -> PeerSwarm {
        PeerSwarm {
            shared: Arc::new(SwarmShared::new(hash, config(dir))),
        }
    }

    /// Deliver a single-piece info dictionary the way a peer would.
    fn feed_metadata(swarm: &PeerSwarm, raw: Vec<u8>) {
        assert_eq!(swarm.shared.metadata_wanted(Some(raw.len())), vec![0]);
        swarm
            .shared
            .accept_metadata_piece(0, raw.len(), Bytes::from(raw));
    }

    #[tokio::test]
    async fn test_metadata_install_makes_swarm_ready() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let (raw, hash) = info_for(&data, 32);
        let swarm = swarm(hash, dir.path());

        assert_eq!(swarm.shared.metadata_wanted(Some(raw.len())), vec![0]);
        swarm
            .shared
            .accept_metadata_piece(0, raw.len(), Bytes::from(raw.clone()));
        swarm.ready().await.unwrap();

        let meta = swarm.metadata().unwrap();
        assert_eq!(meta.info_hash, hash.to_hex());
        assert_eq!(meta.total_length, 100);
        assert_eq!(meta.files[0].name, "clip.mp4");
        assert!(swarm.shared.metadata_wanted(None).is_empty());
    }

    #[tokio::test]
    async fn test_oversized_torrent_fails_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![0u8; 64];
        let (raw, hash) = info_for(&data, 32);
        let mut cfg = config(dir.path());
        cfg.max_torrent_bytes = 10;
        let swarm = PeerSwarm {
            shared: Arc::new(SwarmShared::new(hash, cfg)),
        };
        feed_metadata(&swarm, raw);
        let err = swarm.ready().await.unwrap_err();
        assert!(matches!(err, SwarmError::TooLarge { length: 64, limit: 10 }));
    }

    #[tokio::test]
    async fn test_mismatched_metadata_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (raw, _) = info_for(&[1u8; 40], 32);
        let swarm = swarm(InfoHash::from_bytes([9; 20]), dir.path());
        feed_metadata(&swarm, raw);
        assert!(swarm.metadata().is_none());
        assert!(matches!(
            *swarm.shared.status.borrow(),
            SwarmStatus::Resolving
        ));
    }

    #[tokio::test]
    async fn test_read_waits_for_pieces_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let (raw, hash) = info_for(&data, 32);
        let swarm = swarm(hash, dir.path());
        feed_metadata(&swarm, raw);
        swarm.ready().await.unwrap();
        swarm.select_all();

        let mut stream = swarm.open_read(0, 30, 70).unwrap();
        let torrent = Arc::clone(swarm.shared.torrent().unwrap());
        let feeder = {
            let shared = Arc::clone(&swarm.shared);
            let data = data.clone();
            tokio::spawn(async move {
                for index in [2usize, 1, 0] {
                    tokio::task::yield_now().await;
                    let start = index * 32;
                    let end = (start + 32).min(data.len());
                    assert_eq!(
                        torrent.record_piece(index, &data[start..end]),
                        PieceOutcome::Stored
                    );
                    shared.bump();
                }
            })
        };

        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        feeder.await.unwrap();
        assert_eq!(collected, data[30..=70].to_vec());
    }

    #[tokio::test]
    async fn test_corrupt_piece_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![5u8; 64];
        let (raw, hash) = info_for(&data, 32);
        let swarm = swarm(hash, dir.path());
        feed_metadata(&swarm, raw);
        let torrent = Arc::clone(swarm.shared.torrent().unwrap());
        assert_eq!(torrent.record_piece(0, &[6u8; 32]), PieceOutcome::Corrupt);
        assert_eq!(torrent.record_piece(0, &data[..32]), PieceOutcome::Stored);
        assert_eq!(torrent.record_piece(0, &data[..32]), PieceOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_open_read_validates_and_destroy_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![1u8; 64];
        let (raw, hash) = info_for(&data, 32);
        let swarm = swarm(hash, dir.path());
        assert!(matches!(swarm.open_read(0, 0, 1), Err(SwarmError::NotReady)));

        feed_metadata(&swarm, raw);
        assert!(matches!(
            swarm.open_read(1, 0, 1),
            Err(SwarmError::NoSuchFile(1))
        ));
        assert!(matches!(
            swarm.open_read(0, 10, 64),
            Err(SwarmError::OutOfRange { .. })
        ));

        let mut stream = swarm.open_read(0, 0, 63).unwrap();
        let part_file = swarm.shared.torrent().unwrap().storage.path().to_path_buf();
        assert!(part_file.exists());
        swarm.destroy();
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
        assert!(stream.next().await.is_none());
        assert!(matches!(
            swarm.ready().await,
            Err(SwarmError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_metadata_sizes_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let (raw, hash) = info_for(&data, 32);
        let swarm = swarm(hash, dir.path());

        // No handshake has advertised a size yet.
        swarm
            .shared
            .accept_metadata_piece(0, 1usize << 40, Bytes::from_static(b"x"));
        swarm
            .shared
            .accept_metadata_piece(0, raw.len(), Bytes::from(raw.clone()));
        assert!(swarm.shared.metadata.lock().is_none());
        assert!(swarm.metadata().is_none());

        // Out-of-bounds advertised sizes never open an assembler.
        assert!(swarm.shared.metadata_wanted(Some(0)).is_empty());
        assert!(swarm
            .shared
            .metadata_wanted(Some(MAX_METADATA_BYTES + 1))
            .is_empty());
        assert!(swarm.shared.metadata.lock().is_none());

        // An honest peer still resolves the torrent.
        feed_metadata(&swarm, raw);
        swarm.ready().await.unwrap();
        assert_eq!(swarm.metadata().unwrap().total_length, 100);
    }

    #[tokio::test]
    async fn test_untouched_assembler_follows_newer_advertised_size() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let (raw, hash) = info_for(&data, 32);
        let swarm = swarm(hash, dir.path());

        // A lying peer advertises a bigger dictionary first.
        assert_eq!(swarm.shared.metadata_wanted(Some(40_000)), vec![0, 1, 2]);
        feed_metadata(&swarm, raw);
        swarm.ready().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_hash_engines_keep_separate_storage() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (1..=64u8).collect();
        let (raw, hash) = info_for(&data, 32);

        let first = swarm(hash, dir.path());
        feed_metadata(&first, raw.clone());
        let torrent = Arc::clone(first.shared.torrent().unwrap());
        assert_eq!(torrent.record_piece(0, &data[..32]), PieceOutcome::Stored);
        assert_eq!(torrent.record_piece(1, &data[32..]), PieceOutcome::Stored);

        let second = swarm(hash, dir.path());
        feed_metadata(&second, raw);
        let second_file = second.shared.torrent().unwrap().storage.path().to_path_buf();
        assert_ne!(torrent.storage.path(), second_file.as_path());

        let mut stream = first.open_read(0, 0, 63).unwrap();
        let mut got = Vec::new();
        while let Some(chunk) = stream.next().await {
            got.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(got, data);

        drop(stream);
        drop(torrent);
        first.destroy();
        drop(first);
        assert!(second_file.exists());
    }
}

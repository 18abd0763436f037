// One outbound peer connection: handshake, metadata exchange, piece download.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::*;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use super::exchange::{ExtHandshake, MetadataMessage, UT_METADATA_ID};
use super::swarm::{PieceOutcome, SwarmShared, TorrentData};
use super::wire::{exchange_handshake, Handshake, Message, MessageCodec, WireError};
use crate::config::{
    PEER_CONNECT_TIMEOUT_SECS, PEER_IDLE_TIMEOUT_SECS, PEER_MAX_HASH_FAILURES,
    PEER_PIPELINE_DEPTH, PIECE_BLOCK_BYTES,
};

const KEEPALIVE_SECS: u64 = 60;
const METADATA_RETRY_SECS: u64 = 10;
/// Bound on `have` indices accepted before the piece count is known.
const MAX_UNSIZED_HAVE: usize = 1 << 22;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("peer went silent")]
    Idle,

    #[error("peer sent {0} corrupt pieces")]
    Corrupt(u32),
}

impl From<std::io::Error> for PeerError {
    fn from(e: std::io::Error) -> Self {
        Self::Wire(WireError::Io(e))
    }
}

type PeerFramed = Framed<TcpStream, MessageCodec>;

/// Releases a piece claim unless the piece was stored.
struct Claim {
    torrent: Arc<TorrentData>,
    index: usize,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.torrent.picker.lock().release(self.index);
    }
}

struct PieceDownload {
    claim: Claim,
    length: u32,
    buf: Vec<u8>,
    blocks: BitVec,
    received: u32,
    next_offset: u32,
    outstanding: usize,
}

impl PieceDownload {
    fn new(torrent: Arc<TorrentData>, index: usize) -> Self {
        let length = torrent.layout.piece_len(index) as u32;
        let block_count = length.div_ceil(PIECE_BLOCK_BYTES) as usize;
        Self {
            claim: Claim { torrent, index },
            length,
            buf: vec![0; length as usize],
            blocks: bitvec![0; block_count],
            received: 0,
            next_offset: 0,
            outstanding: 0,
        }
    }

    fn index(&self) -> usize {
        self.claim.index
    }

    /// Copy a block in; returns `true` once the piece is complete.
    fn accept(&mut self, begin: u32, block: &[u8]) -> bool {
        let slot = (begin / PIECE_BLOCK_BYTES) as usize;
        let expected = PIECE_BLOCK_BYTES.min(self.length.saturating_sub(begin)) as usize;
        if begin % PIECE_BLOCK_BYTES != 0
            || slot >= self.blocks.len()
            || block.len() != expected
            || self.blocks[slot]
        {
            return false;
        }
        let start = begin as usize;
        self.buf[start..start + block.len()].copy_from_slice(block);
        self.blocks.set(slot, true);
        self.received += block.len() as u32;
        self.outstanding = self.outstanding.saturating_sub(1);
        self.received == self.length
    }
}

struct PeerConn {
    addr: SocketAddr,
    shared: Arc<SwarmShared>,
    choked: bool,
    has: BitVec<u8, Msb0>,
    sized: bool,
    ut_metadata: Option<u8>,
    metadata_size: Option<usize>,
    metadata_requested_at: Option<Instant>,
    download: Option<PieceDownload>,
    corrupt: u32,
}

/// Drive a connection to `addr` until the swarm is cancelled or the peer is lost.
pub(crate) async fn run(shared: Arc<SwarmShared>, addr: SocketAddr) -> Result<(), PeerError> {
    let connect_timeout = Duration::from_secs(PEER_CONNECT_TIMEOUT_SECS);
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::ConnectTimeout)??;
    let ours = Handshake::new(*shared.info_hash.as_bytes(), shared.peer_id);
    let theirs = timeout(connect_timeout, exchange_handshake(&mut stream, &ours))
        .await
        .map_err(|_| PeerError::ConnectTimeout)??;
    debug!(
        "peer {} connected to swarm {} (extensions={})",
        addr,
        shared.info_hash,
        theirs.supports_extensions()
    );

    let mut framed = Framed::new(stream, MessageCodec);
    if theirs.supports_extensions() {
        framed
            .feed(Message::Extended {
                id: 0,
                payload: ExtHandshake::ours().encode(),
            })
            .await?;
    }
    framed.send(Message::Interested).await?;

    let mut conn = PeerConn {
        addr,
        shared: Arc::clone(&shared),
        choked: true,
        has: BitVec::new(),
        sized: false,
        ut_metadata: None,
        metadata_size: None,
        metadata_requested_at: None,
        download: None,
        corrupt: 0,
    };
    let mut progress = shared.subscribe_progress();
    let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = Duration::from_secs(PEER_IDLE_TIMEOUT_SECS);
    let mut last_heard = Instant::now();

    loop {
        if shared.torrent().is_some_and(|t| t.is_complete()) {
            return Ok(());
        }
        conn.request_more(&mut framed).await?;

        tokio::select! {
            _ = shared.cancel.cancelled() => return Ok(()),
            frame = framed.next() => {
                let msg = match frame {
                    Some(msg) => msg?,
                    None => return Ok(()),
                };
                last_heard = Instant::now();
                conn.handle(msg, &mut framed).await?;
            }
            changed = progress.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = keepalive.tick() => {
                framed.send(Message::KeepAlive).await?;
            }
            _ = tokio::time::sleep_until(last_heard + idle) => return Err(PeerError::Idle),
        }
    }
}

impl PeerConn {
    async fn handle(&mut self, msg: Message, framed: &mut PeerFramed) -> Result<(), PeerError> {
        match msg {
            Message::Choke => {
                self.choked = true;
                // Outstanding requests are void; the claim goes back to the picker.
                self.download = None;
            }
            Message::Unchoke => self.choked = false,
            Message::Have(index) => {
                let index = index as usize;
                if (self.sized && index >= self.has.len()) || index > MAX_UNSIZED_HAVE {
                    return Ok(());
                }
                if index >= self.has.len() {
                    self.has.resize(index + 1, false);
                }
                self.has.set(index, true);
            }
            Message::Bitfield(bits) => {
                self.has = BitVec::from_vec(bits.to_vec());
                self.sized = false;
            }
            Message::Piece {
                index,
                begin,
                block,
            } => self.on_block(index as usize, begin, &block)?,
            Message::Extended { id: 0, payload } => {
                if let Some(hs) = ExtHandshake::decode(&payload) {
                    self.ut_metadata = hs.ut_metadata();
                    self.metadata_size = hs.metadata_size();
                    trace!(
                        "peer {} ut_metadata={:?} metadata_size={:?}",
                        self.addr,
                        self.ut_metadata,
                        self.metadata_size
                    );
                }
            }
            Message::Extended {
                id: UT_METADATA_ID,
                payload,
            } => self.on_metadata(payload, framed).await?,
            // Leech-only: requests from the peer are never served.
            _ => {}
        }
        Ok(())
    }

    async fn on_metadata(
        &mut self,
        payload: Bytes,
        framed: &mut PeerFramed,
    ) -> Result<(), PeerError> {
        match MetadataMessage::decode(&payload) {
            Some(MetadataMessage::Data {
                piece,
                total_size,
                data,
            }) => {
                self.shared.accept_metadata_piece(piece, total_size, data);
            }
            Some(MetadataMessage::Reject { piece }) => {
                debug!("peer {} rejected metadata piece {}", self.addr, piece);
                self.ut_metadata = None;
            }
            Some(MetadataMessage::Request { piece }) => {
                if let Some(id) = self.ut_metadata {
                    framed
                        .send(Message::Extended {
                            id,
                            payload: MetadataMessage::Reject { piece }.encode(),
                        })
                        .await?;
                }
            }
            None => {}
        }
        Ok(())
    }

    fn on_block(&mut self, index: usize, begin: u32, block: &[u8]) -> Result<(), PeerError> {
        let Some(download) = self.download.as_mut().filter(|d| d.index() == index) else {
            return Ok(());
        };
        if !download.accept(begin, block) {
            return Ok(());
        }

        let Some(download) = self.download.take() else {
            return Ok(());
        };
        let torrent = Arc::clone(&download.claim.torrent);
        match torrent.record_piece(index, &download.buf) {
            PieceOutcome::Stored => {
                trace!("peer {} delivered piece {}", self.addr, index);
                self.shared.bump();
            }
            PieceOutcome::Duplicate | PieceOutcome::Failed => {}
            PieceOutcome::Corrupt => {
                self.corrupt += 1;
                debug!(
                    "peer {} sent corrupt piece {} ({} so far)",
                    self.addr, index, self.corrupt
                );
                if self.corrupt >= PEER_MAX_HASH_FAILURES {
                    return Err(PeerError::Corrupt(self.corrupt));
                }
            }
        }
        Ok(())
    }

    /// Ask for metadata while unresolved, then keep the block pipeline full.
    async fn request_more(&mut self, framed: &mut PeerFramed) -> Result<(), PeerError> {
        let Some(torrent) = self.shared.torrent().cloned() else {
            return self.request_metadata(framed).await;
        };

        if !self.sized {
            self.has.resize(torrent.layout.piece_count(), false);
            self.sized = true;
        }
        if self.choked {
            return Ok(());
        }
        if self.download.is_none() {
            let picked = torrent.picker.lock().pick(&self.has);
            match picked {
                Some(index) => self.download = Some(PieceDownload::new(torrent, index)),
                None => return Ok(()),
            }
        }

        let Some(download) = self.download.as_mut() else {
            return Ok(());
        };
        let mut sent = false;
        while download.outstanding < PEER_PIPELINE_DEPTH && download.next_offset < download.length
        {
            let length = PIECE_BLOCK_BYTES.min(download.length - download.next_offset);
            framed
                .feed(Message::Request {
                    index: download.index() as u32,
                    begin: download.next_offset,
                    length,
                })
                .await?;
            download.next_offset += length;
            download.outstanding += 1;
            sent = true;
        }
        if sent {
            framed.flush().await?;
        }
        Ok(())
    }

    async fn request_metadata(&mut self, framed: &mut PeerFramed) -> Result<(), PeerError> {
        let Some(id) = self.ut_metadata else {
            return Ok(());
        };
        let retry = Duration::from_secs(METADATA_RETRY_SECS);
        if self
            .metadata_requested_at
            .is_some_and(|at| at.elapsed() < retry)
        {
            return Ok(());
        }
        let pieces = self.shared.metadata_wanted(self.metadata_size);
        if pieces.is_empty() {
            return Ok(());
        }
        for piece in pieces {
            framed
                .feed(Message::Extended {
                    id,
                    payload: MetadataMessage::Request { piece }.encode(),
                })
                .await?;
        }
        framed.flush().await?;
        self.metadata_requested_at = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::layout::{InfoDict, TorrentLayout};
    use crate::torrent::magnet::InfoHash;
    use crate::torrent::picker::PiecePicker;
    use crate::torrent::storage::PieceStorage;
    use parking_lot::Mutex;
    use serde_bytes::ByteBuf;

    fn torrent(dir: &std::path::Path, length: u64) -> Arc<TorrentData> {
        let info = InfoDict {
            name: "f".into(),
            piece_length: 40_000,
            pieces: ByteBuf::from(vec![0u8; 20 * length.div_ceil(40_000) as usize]),
            length: Some(length),
            files: None,
        };
        let layout = TorrentLayout::new(InfoHash::from_bytes([3; 20]), &info).unwrap();
        Arc::new(TorrentData {
            storage: PieceStorage::new(dir, "t", length, 40_000).unwrap(),
            picker: Mutex::new(PiecePicker::new(layout.piece_count())),
            layout,
        })
    }

    #[test]
    fn test_piece_download_assembles_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent(dir.path(), 40_000);
        let mut dl = PieceDownload::new(torrent, 0);
        assert_eq!(dl.blocks.len(), 3);
        dl.outstanding = 3;

        assert!(!dl.accept(16_384, &vec![2u8; 16_384]));
        // Duplicate, misaligned and wrongly sized blocks are ignored.
        assert!(!dl.accept(16_384, &vec![2u8; 16_384]));
        assert!(!dl.accept(100, &vec![2u8; 16_384]));
        assert!(!dl.accept(32_768, &vec![3u8; 16_384]));
        assert!(!dl.accept(0, &vec![1u8; 16_384]));
        assert!(dl.accept(32_768, &vec![3u8; 40_000 - 32_768]));
        assert_eq!(dl.outstanding, 0);
        assert_eq!(dl.buf[0], 1);
        assert_eq!(dl.buf[16_384], 2);
        assert_eq!(dl.buf[39_999], 3);
    }

    #[test]
    fn test_dropped_download_releases_claim() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent(dir.path(), 80_000);
        torrent.picker.lock().want_all();
        let has = bitvec![u8, Msb0; 1; 2];
        let first = torrent.picker.lock().pick(&has).unwrap();
        let dl = PieceDownload::new(Arc::clone(&torrent), first);
        assert_eq!(torrent.picker.lock().pick(&has), Some(1));
        drop(dl);
        assert_eq!(torrent.picker.lock().pick(&has), Some(0));
    }
}

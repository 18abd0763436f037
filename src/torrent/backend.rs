// Seam between the torrent adapter and whatever drives the peer swarm.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use super::layout::TorrentMetadata;
use super::magnet::{InfoHash, MagnetLink};

/// Bytes of one file region, yielded piece by piece as they become available.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Clone, Error)]
pub enum SwarmError {
    #[error("swarm metadata could not be resolved: {0}")]
    Metadata(String),

    #[error("torrent is {length} bytes, larger than the {limit} byte limit")]
    TooLarge { length: u64, limit: u64 },

    #[error("swarm metadata is not resolved yet")]
    NotReady,

    #[error("torrent has no file at index {0}")]
    NoSuchFile(usize),

    #[error("byte range {start}-{end} is outside the file")]
    OutOfRange { start: u64, end: u64 },

    #[error("timed out waiting for piece {0}")]
    PieceTimeout(usize),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("swarm engine destroyed")]
    Destroyed,
}

impl From<SwarmError> for io::Error {
    fn from(err: SwarmError) -> Self {
        let kind = match err {
            SwarmError::PieceTimeout(_) => io::ErrorKind::TimedOut,
            SwarmError::Destroyed => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// A live swarm for a single info hash.
///
/// `ready` resolves once the torrent metadata is known. Reads are served
/// from verified pieces only; a read for a missing piece waits for it.
#[async_trait]
pub trait SwarmEngine: Send + Sync {
    fn info_hash(&self) -> InfoHash;

    async fn ready(&self) -> Result<(), SwarmError>;

    /// `None` until `ready` has succeeded.
    fn metadata(&self) -> Option<TorrentMetadata>;

    /// Mark every file wanted so the swarm downloads the whole torrent.
    fn select_all(&self);

    /// Open an inclusive byte range `start..=end` of one file.
    fn open_read(&self, file_index: usize, start: u64, end: u64)
        -> Result<ByteStream, SwarmError>;

    /// Stop all swarm activity and release storage. Idempotent.
    fn destroy(&self);
}

pub trait SwarmFactory: Send + Sync {
    fn spawn(&self, magnet: &MagnetLink) -> Result<Arc<dyn SwarmEngine>, SwarmError>;
}

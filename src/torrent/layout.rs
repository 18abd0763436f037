// Info dictionary decoding and the piece/file geometry derived from it.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use thiserror::Error;

use super::magnet::InfoHash;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("malformed info dictionary: {0}")]
    Decode(String),

    #[error("info dictionary hashes to {actual}, expected {expected}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid torrent geometry: {0}")]
    Geometry(String),
}

/// The `info` dictionary of a v1 torrent (BEP 3).
#[derive(Debug, Deserialize)]
pub struct InfoDict {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub pieces: ByteBuf,
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub files: Option<Vec<InfoFile>>,
}

#[derive(Debug, Deserialize)]
pub struct InfoFile {
    pub length: u64,
    pub path: Vec<String>,
}

impl InfoDict {
    /// Decode raw info-dictionary bytes after checking they hash to `expected`.
    pub fn from_verified_bytes(bytes: &[u8], expected: &InfoHash) -> Result<Self, LayoutError> {
        let digest: [u8; 20] = Sha1::digest(bytes).into();
        if &digest != expected.as_bytes() {
            return Err(LayoutError::HashMismatch {
                expected: expected.to_hex(),
                actual: hex::encode(digest),
            });
        }
        serde_bencode::from_bytes(bytes).map_err(|e| LayoutError::Decode(e.to_string()))
    }
}

/// One file of a torrent, positioned in the torrent's contiguous byte space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub index: usize,
    pub name: String,
    pub path: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentFile {
    pub index: usize,
    pub name: String,
    pub path: String,
    pub length: u64,
}

/// Torrent description handed to clients once a swarm is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentMetadata {
    /// Lowercase hex.
    pub info_hash: String,
    pub name: String,
    pub total_length: u64,
    pub files: Vec<TorrentFile>,
}

#[derive(Debug, Clone)]
pub struct TorrentLayout {
    info_hash: InfoHash,
    name: String,
    piece_length: u64,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    files: Vec<FileSpan>,
}

impl TorrentLayout {
    pub fn new(info_hash: InfoHash, info: &InfoDict) -> Result<Self, LayoutError> {
        if info.piece_length == 0 {
            return Err(LayoutError::Geometry("piece length is zero".into()));
        }
        if info.pieces.len() % 20 != 0 {
            return Err(LayoutError::Geometry(format!(
                "pieces field is {} bytes, not a multiple of 20",
                info.pieces.len()
            )));
        }

        let mut files = Vec::new();
        let mut offset = 0u64;
        match (&info.files, info.length) {
            (Some(list), _) if !list.is_empty() => {
                for (index, file) in list.iter().enumerate() {
                    if file.path.is_empty()
                        || file.path.iter().any(|c| c.is_empty() || c == "..")
                    {
                        return Err(LayoutError::Geometry(format!(
                            "file {index} has an invalid path"
                        )));
                    }
                    let path = std::iter::once(info.name.as_str())
                        .chain(file.path.iter().map(String::as_str))
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push(FileSpan {
                        index,
                        name: file.path.last().cloned().unwrap_or_default(),
                        path,
                        offset,
                        length: file.length,
                    });
                    offset = offset.checked_add(file.length).ok_or_else(|| {
                        LayoutError::Geometry("total length overflows".into())
                    })?;
                }
            }
            (_, Some(length)) => {
                files.push(FileSpan {
                    index: 0,
                    name: info.name.clone(),
                    path: info.name.clone(),
                    offset: 0,
                    length,
                });
                offset = length;
            }
            _ => return Err(LayoutError::Geometry("no length and no files".into())),
        }

        let total_length = offset;
        if total_length == 0 {
            return Err(LayoutError::Geometry("torrent is empty".into()));
        }

        let piece_hashes: Vec<[u8; 20]> = info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();
        let expected_pieces = total_length.div_ceil(info.piece_length);
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(LayoutError::Geometry(format!(
                "{} piece hashes for {} pieces",
                piece_hashes.len(),
                expected_pieces
            )));
        }

        Ok(Self {
            info_hash,
            name: info.name.clone(),
            piece_length: info.piece_length,
            total_length,
            piece_hashes,
            files,
        })
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte length of a piece. The last piece may be shorter.
    pub fn piece_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        self.piece_length.min(self.total_length.saturating_sub(start))
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index)
    }

    pub fn files(&self) -> &[FileSpan] {
        &self.files
    }

    pub fn file(&self, index: usize) -> Option<&FileSpan> {
        self.files.get(index)
    }

    pub fn piece_of(&self, offset: u64) -> usize {
        (offset / self.piece_length) as usize
    }

    /// Pieces covering the absolute inclusive byte range `start..=end`.
    pub fn pieces_for(&self, start: u64, end: u64) -> RangeInclusive<usize> {
        self.piece_of(start)..=self.piece_of(end)
    }

    pub fn metadata(&self) -> TorrentMetadata {
        TorrentMetadata {
            info_hash: self.info_hash.to_hex(),
            name: self.name.clone(),
            total_length: self.total_length,
            files: self
                .files
                .iter()
                .map(|f| TorrentFile {
                    index: f.index,
                    name: f.name.clone(),
                    path: f.path.clone(),
                    length: f.length,
                })
                .collect(),
        }
    }
}

// On-disk piece store backed by a memory-mapped file and a bitvec completion map.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use bitvec::prelude::*;
use bytes::Bytes;
use memmap2::MmapMut;
use parking_lot::RwLock;
use tracing::debug;

pub struct PieceStorage {
    mmap: RwLock<MmapMut>,
    bitmap: RwLock<BitVec>,
    piece_length: u64,
    total_length: u64,
    total_pieces: usize,
    path: PathBuf,
    verified_bytes: AtomicU64,
}

impl PieceStorage {
    /// Create the backing file `{dir}/{name}.part`, sized to `total_length` and mapped.
    ///
    /// Fails if the file already exists. Only verified pieces are ever written;
    /// the bitmap records which.
    pub fn new(dir: &Path, name: &str, total_length: u64, piece_length: u64) -> Result<Self> {
        if total_length == 0 {
            return Err(anyhow!("total_length must be > 0"));
        }
        if piece_length == 0 {
            return Err(anyhow!("piece_length must be > 0"));
        }

        fs::create_dir_all(dir)?;

        let path = dir.join(format!("{}.part", name));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        file.set_len(total_length)?;

        // SAFETY: `create_new` made this file for us alone; no other mapping exists.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let total_pieces = total_length.div_ceil(piece_length) as usize;
        debug!(
            "allocated {} ({} bytes, {} pieces)",
            path.display(),
            total_length,
            total_pieces
        );

        Ok(Self {
            mmap: RwLock::new(mmap),
            bitmap: RwLock::new(bitvec![0; total_pieces]),
            piece_length,
            total_length,
            total_pieces,
            path,
            verified_bytes: AtomicU64::new(0),
        })
    }

    /// Write a verified piece.
    pub fn put_piece(&self, index: usize, data: &[u8]) -> Result<()> {
        if index >= self.total_pieces {
            return Err(anyhow!(
                "piece {} out of range (total {})",
                index,
                self.total_pieces
            ));
        }

        let expected_len = self.piece_len(index);
        if data.len() != expected_len {
            return Err(anyhow!(
                "piece {} is {} bytes, expected {}",
                index,
                data.len(),
                expected_len
            ));
        }

        let offset = (index as u64 * self.piece_length) as usize;
        {
            let mut mmap = self.mmap.write();
            mmap[offset..offset + data.len()].copy_from_slice(data);
        }

        let mut bitmap = self.bitmap.write();
        if !bitmap[index] {
            bitmap.set(index, true);
            self.verified_bytes
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn has_piece(&self, index: usize) -> bool {
        index < self.total_pieces && self.bitmap.read()[index]
    }

    /// Copy `len` bytes at absolute `offset`, or `None` if any covering piece is missing.
    pub fn read_at(&self, offset: u64, len: usize) -> Option<Bytes> {
        let end = offset.checked_add(len as u64)?;
        if len == 0 || end > self.total_length {
            return None;
        }

        let first = (offset / self.piece_length) as usize;
        let last = ((end - 1) / self.piece_length) as usize;
        {
            let bitmap = self.bitmap.read();
            if !bitmap[first..=last].all() {
                return None;
            }
        }

        let mmap = self.mmap.read();
        Some(Bytes::copy_from_slice(
            &mmap[offset as usize..end as usize],
        ))
    }

    /// Contiguous verified bytes from `offset` onward.
    pub fn verified_bytes_ahead(&self, offset: u64) -> u64 {
        if offset >= self.total_length {
            return 0;
        }

        let first = (offset / self.piece_length) as usize;
        let bitmap = self.bitmap.read();
        let run = bitmap[first..].leading_ones();
        if run == 0 {
            return 0;
        }
        let run_end = ((first + run) as u64 * self.piece_length).min(self.total_length);
        run_end - offset
    }

    pub fn piece_len(&self, index: usize) -> usize {
        let start = index as u64 * self.piece_length;
        self.piece_length
            .min(self.total_length.saturating_sub(start)) as usize
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.read().all()
    }

    pub fn completed_pieces(&self) -> usize {
        self.bitmap.read().count_ones()
    }

    pub fn total_pieces(&self) -> usize {
        self.total_pieces
    }

    pub fn verified_bytes(&self) -> u64 {
        self.verified_bytes.load(Ordering::Relaxed)
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PieceStorage {
    fn drop(&mut self) {
        // Best-effort deletion of the backing file.
        let _ = fs::remove_file(&self.path);
    }
}

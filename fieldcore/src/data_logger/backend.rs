//! Block storage backends consumed by the TDF data logger.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::errno;

/// Block type tag for TDF blocks.
pub const BLOCK_TYPE_TDF: u8 = 0x03;

/// Geometry reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    /// Bytes per block, `0` while the backend is disconnected.
    pub block_size: usize,
    /// Leading bytes of each block reserved for the backend.
    pub block_overhead: usize,
    /// Backend can only write complete blocks.
    pub full_block_write: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend not connected")]
    NotConnected,

    #[error("backend I/O error: {0}")]
    Io(String),

    #[error("backend does not support reads")]
    ReadUnsupported,

    #[error("block {0} not stored")]
    NoBlock(u32),
}

impl BackendError {
    pub fn errno(&self) -> i32 {
        match self {
            BackendError::NotConnected => -errno::ENOTCONN,
            BackendError::Io(_) => -errno::EIO,
            BackendError::ReadUnsupported => -errno::ENOTSUP,
            BackendError::NoBlock(_) => -errno::EINVAL,
        }
    }
}

/// A destination for completed TDF blocks (flash, serial, UDP, ...).
#[async_trait]
pub trait BlockBackend: Send + Sync {
    fn name(&self) -> &str;

    fn info(&self) -> BackendInfo;

    /// Write one block. May block until the backend accepts the data.
    async fn write_block(&self, block_type: u8, block: &[u8]) -> Result<(), BackendError>;

    /// Block numbers that can currently be read back, `earliest..current`.
    ///
    /// Write-only backends (serial, UDP, ...) keep the empty default.
    fn stored_blocks(&self) -> Range<u32> {
        0..0
    }

    /// Read back one stored block, `block_size` bytes long.
    async fn read_block(&self, _block: u32) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::ReadUnsupported)
    }
}

// ── MemoryBackend ─────────────────────────────────────────────────────────────

/// Backend that keeps written blocks in memory.
///
/// Writes can be made to fail with [`set_failing`](Self::set_failing) to
/// exercise flush error paths. With a retention limit the oldest blocks are
/// dropped like a circular flash partition wrapping.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    info: BackendInfo,
    store: Mutex<BlockStore>,
    retention: usize,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

#[derive(Debug, Default)]
struct BlockStore {
    /// Block number of `blocks[0]`.
    earliest: u32,
    blocks: VecDeque<(u8, Vec<u8>)>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>, info: BackendInfo) -> Self {
        Self {
            name: name.into(),
            info,
            store: Mutex::new(BlockStore::default()),
            retention: usize::MAX,
            failing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Backend with `block_size` byte blocks and no overhead.
    pub fn with_block_size(name: impl Into<String>, block_size: usize) -> Self {
        Self::new(
            name,
            BackendInfo {
                block_size,
                block_overhead: 0,
                full_block_write: false,
            },
        )
    }

    /// Keep only the newest `blocks` blocks.
    pub fn with_retention(mut self, blocks: usize) -> Self {
        self.retention = blocks.max(1);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn store(&self) -> MutexGuard<'_, BlockStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks still stored, oldest first.
    pub fn blocks(&self) -> Vec<Vec<u8>> {
        self.store().blocks.iter().map(|(_, b)| b.clone()).collect()
    }

    pub fn block_count(&self) -> usize {
        self.store().blocks.len()
    }

    /// Write attempts including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> BackendInfo {
        self.info
    }

    async fn write_block(&self, block_type: u8, block: &[u8]) -> Result<(), BackendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Io(format!("{}: injected failure", self.name)));
        }
        let mut store = self.store();
        store.blocks.push_back((block_type, block.to_vec()));
        if store.blocks.len() > self.retention {
            store.blocks.pop_front();
            store.earliest += 1;
        }
        Ok(())
    }

    fn stored_blocks(&self) -> Range<u32> {
        let store = self.store();
        store.earliest..store.earliest + store.blocks.len() as u32
    }

    /// Bytes past the written length read back as erased flash (`0xFF`).
    async fn read_block(&self, block: u32) -> Result<Vec<u8>, BackendError> {
        let store = self.store();
        let (_, written) = block
            .checked_sub(store.earliest)
            .and_then(|idx| store.blocks.get(idx as usize))
            .ok_or(BackendError::NoBlock(block))?;
        let mut out = written.clone();
        if out.len() < self.info.block_size {
            out.resize(self.info.block_size, 0xFF);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retention_drops_oldest_blocks() {
        let backend = MemoryBackend::with_block_size("flash", 4).with_retention(2);
        assert_eq!(backend.stored_blocks(), 0..0);
        for i in 0..5u8 {
            backend.write_block(BLOCK_TYPE_TDF, &[i; 4]).await.unwrap();
        }
        assert_eq!(backend.stored_blocks(), 3..5);
        assert_eq!(backend.blocks(), vec![vec![3; 4], vec![4; 4]]);

        assert_eq!(backend.read_block(4).await.unwrap(), vec![4; 4]);
        assert_eq!(backend.read_block(2).await, Err(BackendError::NoBlock(2)));
        assert_eq!(backend.read_block(5).await, Err(BackendError::NoBlock(5)));
    }

    #[tokio::test]
    async fn short_blocks_read_back_padded() {
        let backend = MemoryBackend::with_block_size("flash", 8);
        backend.write_block(BLOCK_TYPE_TDF, &[1, 2, 3]).await.unwrap();
        assert_eq!(
            backend.read_block(0).await.unwrap(),
            vec![1, 2, 3, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(BackendError::NoBlock(0).errno(), -errno::EINVAL);
    }
}

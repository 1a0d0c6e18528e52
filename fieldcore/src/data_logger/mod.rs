/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! TDF data logger: batches TDF records per output channel and pushes
//! completed blocks to a [`BlockBackend`].
//!
//! ```text
//! task ──log_array(mask)──► LoggerSet ──► TdfDataLogger[bit] ──flush──► BlockBackend
//!                                          (TdfBuffer, lock)
//! ```
//!
//! A full buffer is flushed and the remaining records are re-added to the
//! now-empty buffer.  A backend failure is returned to the caller and the
//! pending bytes stay in the buffer so a later flush can retry them.

pub mod backend;

use std::ops::BitOr;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::errno;
use crate::tdf::{TdfBuffer, TdfDataType, TdfError, TdfParser};

pub use backend::{BackendError, BackendInfo, BlockBackend, MemoryBackend, BLOCK_TYPE_TDF};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Smallest useful record (3 byte header + 1 byte payload).  Buffers with
/// less tailroom are flushed straight away.
pub const MIN_TAILROOM: usize = 4;

/// Number of addressable logger slots in a [`LoggerMask`].
pub const LOGGER_SLOTS: usize = 6;

// ── LoggerMask ────────────────────────────────────────────────────────────────

/// Bitmask selecting one or more loggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(transparent)]
pub struct LoggerMask(pub u8);

impl LoggerMask {
    pub const NONE: LoggerMask = LoggerMask(0);
    pub const FLASH: LoggerMask = LoggerMask(1 << 0);
    pub const REMOVABLE: LoggerMask = LoggerMask(1 << 1);
    pub const SERIAL: LoggerMask = LoggerMask(1 << 2);
    pub const UDP: LoggerMask = LoggerMask(1 << 3);
    pub const BT_ADV: LoggerMask = LoggerMask(1 << 4);
    pub const BT_PERIPHERAL: LoggerMask = LoggerMask(1 << 5);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: LoggerMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Slot indices of the set bits, lowest first.
    pub fn offsets(self) -> impl Iterator<Item = usize> {
        (0..8).filter(move |bit| self.0 & (1 << bit) != 0)
    }
}

impl BitOr for LoggerMask {
    type Output = LoggerMask;

    fn bitor(self, rhs: LoggerMask) -> LoggerMask {
        LoggerMask(self.0 | rhs.0)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error(transparent)]
    Tdf(#[from] TdfError),

    #[error("logger '{logger}' block write failed: {source}")]
    Backend {
        logger: String,
        #[source]
        source: BackendError,
    },

    #[error("logger '{0}' has no connected backend")]
    NotConnected(String),
}

impl LoggerError {
    pub fn errno(&self) -> i32 {
        match self {
            LoggerError::Tdf(e) => e.errno(),
            LoggerError::Backend { source, .. } => source.errno(),
            LoggerError::NotConnected(_) => -errno::ENOTCONN,
        }
    }
}

// ── TdfDataLogger ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct LoggerState {
    buf: TdfBuffer,
    block_overhead: usize,
    full_block_write: bool,
}

/// One TDF buffer bound to one backend.
pub struct TdfDataLogger {
    name: String,
    backend: Arc<dyn BlockBackend>,
    /// RAM available for buffering, including the block overhead.
    max_buffer_size: usize,
    state: Mutex<LoggerState>,
}

impl std::fmt::Debug for TdfDataLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdfDataLogger")
            .field("name", &self.name)
            .field("backend", &self.backend.name())
            .field("max_buffer_size", &self.max_buffer_size)
            .finish()
    }
}

impl TdfDataLogger {
    /// Create a logger whose buffer matches the backend block size, limited
    /// to `max_buffer_size`.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn BlockBackend>,
        max_buffer_size: usize,
    ) -> Self {
        let info = backend.info();
        let block_size = info.block_size.min(max_buffer_size);
        let capacity = block_size.saturating_sub(info.block_overhead);
        Self {
            name: name.into(),
            backend,
            max_buffer_size,
            state: Mutex::new(LoggerState {
                buf: TdfBuffer::new(capacity),
                block_overhead: info.block_overhead,
                full_block_write: info.full_block_write,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes waiting to be flushed.
    pub async fn bytes_pending(&self) -> usize {
        self.state.lock().await.buf.len()
    }

    /// Bytes still free in the current block.
    pub async fn bytes_remaining(&self) -> usize {
        self.state.lock().await.buf.remaining()
    }

    /// Log a single record.
    pub async fn log(
        &self,
        tdf_id: u16,
        tdf_len: u8,
        time: u64,
        data: &[u8],
    ) -> Result<(), LoggerError> {
        self.log_array(tdf_id, tdf_len, 1, time, 0, data).await
    }

    /// Log `tdf_num` records spaced `period` epoch ticks apart, flushing as
    /// often as needed to fit them all.
    pub async fn log_array(
        &self,
        tdf_id: u16,
        tdf_len: u8,
        tdf_num: u8,
        time: u64,
        period: u32,
        data: &[u8],
    ) -> Result<(), LoggerError> {
        let mut state = self.state.lock().await;
        if state.buf.capacity() == 0 {
            debug!(logger = %self.name, "currently disconnected");
            return Err(LoggerError::NotConnected(self.name.clone()));
        }
        self.log_locked(&mut state, tdf_id, tdf_len, tdf_num, time, period, data)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_locked(
        &self,
        state: &mut LoggerState,
        tdf_id: u16,
        tdf_len: u8,
        tdf_num: u8,
        mut time: u64,
        period: u32,
        mut data: &[u8],
    ) -> Result<(), LoggerError> {
        let mut pending = tdf_num;
        loop {
            match state.buf.add(tdf_id, tdf_len, pending, time, period, data) {
                Ok(written) if written == pending => break,
                Ok(written) => {
                    debug!(logger = %self.name, written, requested = pending, "partial add");
                    data = &data[tdf_len as usize * written as usize..];
                    if time != 0 {
                        time += period as u64 * written as u64;
                    }
                    pending -= written;
                    self.flush_locked(state).await?;
                }
                Err(TdfError::NoMemory) if !state.buf.is_empty() => {
                    debug!(logger = %self.name, "no space, flush and retry");
                    self.flush_locked(state).await?;
                }
                Err(e) => {
                    warn!(logger = %self.name, tdf_id, error = %e, "failed to add");
                    return Err(e.into());
                }
            }
        }
        debug!(
            logger = %self.name,
            offset = state.buf.len(),
            size = state.buf.capacity(),
            "current offset"
        );

        if state.buf.remaining() < MIN_TAILROOM {
            debug!(logger = %self.name, "auto flush");
            self.flush_locked(state).await?;
        }
        Ok(())
    }

    /// Push pending data to the backend.  No-op on an empty buffer.
    pub async fn flush(&self) -> Result<(), LoggerError> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut LoggerState) -> Result<(), LoggerError> {
        if state.buf.is_empty() {
            debug!(logger = %self.name, "no data to log");
            return Ok(());
        }

        let block_size = state.buf.capacity() + state.block_overhead;
        let mut block = Vec::with_capacity(block_size);
        block.resize(state.block_overhead, 0);
        block.extend_from_slice(state.buf.as_bytes());
        if state.full_block_write {
            block.resize(block_size, 0xFF);
        }

        if let Err(source) = self.backend.write_block(BLOCK_TYPE_TDF, &block).await {
            error!(logger = %self.name, error = %source, "failed to write block");
            return Err(LoggerError::Backend {
                logger: self.name.clone(),
                source,
            });
        }
        debug!(logger = %self.name, len = block.len(), "block written");
        state.buf.reset();
        Ok(())
    }

    /// React to a backend block size change.
    ///
    /// `0` means the backend disconnected and all of `max_buffer_size` is used
    /// for buffering.  When more data is pending than a smaller block can
    /// hold, the pending records are re-logged and flushed as needed.
    pub async fn block_size_update(&self, block_size: usize) -> Result<(), LoggerError> {
        let mut state = self.state.lock().await;
        let limited = if block_size == 0 {
            self.max_buffer_size
        } else {
            block_size.min(self.max_buffer_size)
        };
        let capacity = limited.saturating_sub(state.block_overhead);
        debug!(
            logger = %self.name,
            from = state.buf.capacity(),
            to = capacity,
            "block size update"
        );

        if state.buf.len() <= capacity {
            state.buf.set_capacity(capacity)?;
            return Ok(());
        }

        let pending = state.buf.as_bytes().to_vec();
        state.buf.reset();
        state.buf.set_capacity(capacity)?;
        for parsed in TdfParser::new(&pending) {
            let tdf = match parsed {
                Ok(tdf) => tdf,
                Err(e) => {
                    warn!(logger = %self.name, error = %e, "pending data unparsable");
                    break;
                }
            };
            if tdf.data_type == TdfDataType::DiffArray {
                warn!(logger = %self.name, tdf_id = tdf.tdf_id, "dropping diff array on resize");
                continue;
            }
            if let Err(e) = self
                .log_locked(
                    &mut state,
                    tdf.tdf_id,
                    tdf.tdf_len,
                    tdf.tdf_num,
                    tdf.time,
                    tdf.period,
                    tdf.data,
                )
                .await
            {
                warn!(logger = %self.name, tdf_id = tdf.tdf_id, error = %e, "re-log failed");
            }
        }
        Ok(())
    }
}

// ── LoggerSet ─────────────────────────────────────────────────────────────────

/// Loggers addressed by [`LoggerMask`] bit.
#[derive(Debug, Default, Clone)]
pub struct LoggerSet {
    slots: [Option<Arc<TdfDataLogger>>; LOGGER_SLOTS],
}

impl LoggerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `logger` to every slot in `mask`.
    pub fn register(&mut self, mask: LoggerMask, logger: Arc<TdfDataLogger>) {
        for offset in mask.offsets().filter(|o| *o < LOGGER_SLOTS) {
            self.slots[offset] = Some(Arc::clone(&logger));
        }
    }

    pub fn get(&self, mask: LoggerMask) -> Option<&Arc<TdfDataLogger>> {
        self.iter(mask).next()
    }

    /// Registered loggers selected by `mask`, lowest bit first.
    pub fn iter(&self, mask: LoggerMask) -> impl Iterator<Item = &Arc<TdfDataLogger>> {
        mask.offsets()
            .filter_map(move |offset| self.slots.get(offset).and_then(Option::as_ref))
    }

    pub async fn log(
        &self,
        mask: LoggerMask,
        tdf_id: u16,
        tdf_len: u8,
        time: u64,
        data: &[u8],
    ) -> Result<(), LoggerError> {
        self.log_array(mask, tdf_id, tdf_len, 1, time, 0, data).await
    }

    /// Log to every selected logger.  All loggers are attempted; the first
    /// error is returned.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_array(
        &self,
        mask: LoggerMask,
        tdf_id: u16,
        tdf_len: u8,
        tdf_num: u8,
        time: u64,
        period: u32,
        data: &[u8],
    ) -> Result<(), LoggerError> {
        let mut first_err = None;
        for logger in self.iter(mask) {
            if let Err(e) = logger
                .log_array(tdf_id, tdf_len, tdf_num, time, period, data)
                .await
            {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Flush every selected logger.
    pub async fn flush(&self, mask: LoggerMask) -> Result<(), LoggerError> {
        let mut first_err = None;
        for logger in self.iter(mask) {
            if let Err(e) = logger.flush().await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

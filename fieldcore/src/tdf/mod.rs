/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Tagged Data Format (TDF) encoder.
//!
//! A TDF record is a compact, optionally time-stamped block of one or more
//! fixed-size samples:
//!
//! ```text
//! ┌──────────┬──────┬─────────────────┬───────────────────┬──────────────┐
//! │ id_flags │ size │ timestamp 0/2/3/6│ array hdr 0 or 3  │ size * num   │
//! │   u16    │  u8  │                 │ num u8, period u16│   payload    │
//! └──────────┴──────┴─────────────────┴───────────────────┴──────────────┘
//! ```
//!
//! Encoding happens in two steps.  [`TdfBuffer::plan`] is a pure function
//! that decides the timestamp representation, whether an array header is
//! needed and how many records fit.  [`TdfBuffer::add`] then writes the plan
//! in a single pass, so a header never has to be rewritten or undone after
//! the sizing decision.
//!
//! | Situation | Timestamp written |
//! |---|---|
//! | `time == 0` | none |
//! | no previous timestamp in the buffer | absolute (6 bytes) |
//! | `0 <= delta <= 65535` ticks | relative (2 bytes) |
//! | `delta` fits signed 24 bits | extended relative (3 bytes) |
//! | otherwise | absolute (6 bytes) |

pub mod parse;

use thiserror::Error;

use crate::errno;
use crate::time::{epoch_time_seconds, epoch_time_subseconds};

pub use parse::{find_in_buf, TdfDataType, TdfParsed, TdfParser};

// ── Constants ─────────────────────────────────────────────────────────────────

pub const TDF_ID_MASK: u16 = 0x0FFF;
/// IDs must be strictly below this value; `0x0FFF` marks erased storage.
pub const TDF_ID_LIMIT: u16 = 4095;

pub const TDF_TIMESTAMP_MASK: u16 = 0xC000;
pub const TDF_TIMESTAMP_NONE: u16 = 0x0000;
pub const TDF_TIMESTAMP_ABSOLUTE: u16 = 0x4000;
pub const TDF_TIMESTAMP_RELATIVE: u16 = 0x8000;
pub const TDF_TIMESTAMP_EXTENDED_RELATIVE: u16 = 0xC000;

pub const TDF_ARRAY_MASK: u16 = 0x3000;
pub const TDF_ARRAY_NONE: u16 = 0x0000;
pub const TDF_ARRAY_TIME: u16 = 0x1000;
pub const TDF_ARRAY_DIFF: u16 = 0x2000;
pub const TDF_ARRAY_IDX: u16 = 0x3000;

pub const TDF_HEADER_LEN: usize = 3;
pub const TDF_TIME_LEN: usize = 6;
pub const TDF_ARRAY_HEADER_LEN: usize = 3;

/// Array periods above this value are stored scaled.
pub const ARRAY_PERIOD_VAL_MASK: u16 = 0x7FFF;
/// Flag marking a scaled array period.
pub const ARRAY_PERIOD_SCALED: u16 = 0x8000;
/// Scale factor of a scaled period, 125 ms resolution (8192 / 65536 s).
pub const ARRAY_PERIOD_SCALE_FACTOR: u32 = 8192;
/// Largest representable inter-sample period, in epoch ticks.
pub const ARRAY_PERIOD_MAX: u32 = ARRAY_PERIOD_VAL_MASK as u32 * ARRAY_PERIOD_SCALE_FACTOR;

const INT24_MAX: i64 = 0x7F_FFFF;
const INT24_MIN: i64 = -INT24_MAX - 1;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TdfError {
    #[error("invalid TDF ID {0} (must be in 1..4095)")]
    InvalidId(u16),

    #[error("invalid TDF argument: {0}")]
    InvalidArgument(&'static str),

    /// A single record can never fit, even in an empty buffer.
    #[error("record needs {required} bytes but buffer capacity is {capacity}")]
    TooLarge { required: usize, capacity: usize },

    /// Not even one record fits in the remaining space.
    #[error("insufficient space remaining in TDF buffer")]
    NoMemory,

    #[error("malformed TDF data: {0}")]
    Malformed(&'static str),
}

impl TdfError {
    /// Negative errno equivalent.
    pub fn errno(&self) -> i32 {
        match self {
            TdfError::InvalidId(_) | TdfError::InvalidArgument(_) | TdfError::Malformed(_) => {
                -errno::EINVAL
            }
            TdfError::TooLarge { .. } => -errno::ENOSPC,
            TdfError::NoMemory => -errno::ENOMEM,
        }
    }
}

// ── Timestamp encoding ────────────────────────────────────────────────────────

/// Timestamp representation chosen for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdfTimestamp {
    None,
    /// Full epoch time.
    Absolute(u64),
    /// Unsigned tick delta from the previous timestamp.
    Relative(u16),
    /// Signed 24-bit tick delta from the previous timestamp.
    ExtendedRelative(i32),
}

impl TdfTimestamp {
    /// Pick the most compact representation of `time` relative to
    /// `reference` (`0` = no reference yet).
    pub fn select(time: u64, reference: u64) -> Self {
        if time == 0 {
            return TdfTimestamp::None;
        }
        if reference == 0 {
            return TdfTimestamp::Absolute(time);
        }
        let delta = (time as i64).wrapping_sub(reference as i64);
        if (0..=u16::MAX as i64).contains(&delta) {
            TdfTimestamp::Relative(delta as u16)
        } else if (INT24_MIN..=INT24_MAX).contains(&delta) {
            TdfTimestamp::ExtendedRelative(delta as i32)
        } else {
            TdfTimestamp::Absolute(time)
        }
    }

    pub fn flags(&self) -> u16 {
        match self {
            TdfTimestamp::None => TDF_TIMESTAMP_NONE,
            TdfTimestamp::Absolute(_) => TDF_TIMESTAMP_ABSOLUTE,
            TdfTimestamp::Relative(_) => TDF_TIMESTAMP_RELATIVE,
            TdfTimestamp::ExtendedRelative(_) => TDF_TIMESTAMP_EXTENDED_RELATIVE,
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            TdfTimestamp::None => 0,
            TdfTimestamp::Absolute(_) => TDF_TIME_LEN,
            TdfTimestamp::Relative(_) => 2,
            TdfTimestamp::ExtendedRelative(_) => 3,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match *self {
            TdfTimestamp::None => {}
            TdfTimestamp::Absolute(t) => {
                out.extend_from_slice(&(epoch_time_seconds(t) as u32).to_le_bytes());
                out.extend_from_slice(&epoch_time_subseconds(t).to_le_bytes());
            }
            TdfTimestamp::Relative(d) => out.extend_from_slice(&d.to_le_bytes()),
            TdfTimestamp::ExtendedRelative(d) => out.extend_from_slice(&d.to_le_bytes()[..3]),
        }
    }
}

/// Encode an inter-sample period into the 16-bit array header field.
pub fn encode_array_period(period: u32) -> u16 {
    if period > ARRAY_PERIOD_VAL_MASK as u32 {
        ARRAY_PERIOD_SCALED | (period / ARRAY_PERIOD_SCALE_FACTOR) as u16
    } else {
        period as u16
    }
}

/// Decode the 16-bit array header period field.
pub fn decode_array_period(field: u16) -> u32 {
    if field & ARRAY_PERIOD_SCALED != 0 {
        ARRAY_PERIOD_SCALE_FACTOR * (field & ARRAY_PERIOD_VAL_MASK) as u32
    } else {
        field as u32
    }
}

// ── Encoding plan ─────────────────────────────────────────────────────────────

/// Sizing decisions for one [`TdfBuffer::add`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdfPlan {
    pub tdf_id: u16,
    pub tdf_len: u8,
    /// Records that will be written (may be less than requested).
    pub tdf_num: u8,
    pub time: u64,
    pub period: u32,
    pub timestamp: TdfTimestamp,
}

impl TdfPlan {
    pub fn has_array_header(&self) -> bool {
        self.tdf_num > 1
    }

    pub fn payload_len(&self) -> usize {
        self.tdf_len as usize * self.tdf_num as usize
    }

    /// Total bytes this plan appends to the buffer.
    pub fn encoded_len(&self) -> usize {
        let array = if self.has_array_header() {
            TDF_ARRAY_HEADER_LEN
        } else {
            0
        };
        TDF_HEADER_LEN + self.timestamp.encoded_len() + array + self.payload_len()
    }

    pub fn id_flags(&self) -> u16 {
        let array = if self.has_array_header() {
            TDF_ARRAY_TIME
        } else {
            TDF_ARRAY_NONE
        };
        self.timestamp.flags() | array | self.tdf_id
    }
}

// ── TdfBuffer ─────────────────────────────────────────────────────────────────

/// Size-bounded TDF output buffer plus its timestamp reference.
///
/// Single writer: callers serialize access.
#[derive(Debug, Clone)]
pub struct TdfBuffer {
    /// Last timestamp written, `0` when none.
    time: u64,
    data: Vec<u8>,
    capacity: usize,
}

impl TdfBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            time: 0,
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Rewind the cursor and forget the timestamp reference.
    pub fn reset(&mut self) {
        self.time = 0;
        self.data.clear();
    }

    /// Change the usable capacity, keeping pending data.
    ///
    /// Fails when more bytes are pending than the new capacity.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<(), TdfError> {
        if self.data.len() > capacity {
            return Err(TdfError::NoMemory);
        }
        self.capacity = capacity;
        Ok(())
    }

    /// Compute how a record set would be encoded without touching the buffer.
    pub fn plan(
        &self,
        tdf_id: u16,
        tdf_len: u8,
        tdf_num: u8,
        time: u64,
        period: u32,
    ) -> Result<TdfPlan, TdfError> {
        if tdf_id == 0 || tdf_id >= TDF_ID_LIMIT {
            return Err(TdfError::InvalidId(tdf_id));
        }
        if tdf_len == 0 || tdf_num == 0 {
            return Err(TdfError::InvalidArgument("zero record length or count"));
        }
        if period > ARRAY_PERIOD_MAX {
            return Err(TdfError::InvalidArgument("array period too large"));
        }

        let min_size = TDF_HEADER_LEN + if time != 0 { TDF_TIME_LEN } else { 0 } + tdf_len as usize;
        if min_size > self.capacity {
            return Err(TdfError::TooLarge {
                required: min_size,
                capacity: self.capacity,
            });
        }

        let timestamp = TdfTimestamp::select(time, self.time);
        let array_header = if tdf_num > 1 { TDF_ARRAY_HEADER_LEN } else { 0 };
        let total_header = TDF_HEADER_LEN + array_header + timestamp.encoded_len();
        let remaining = self.remaining();
        if remaining <= total_header {
            return Err(TdfError::NoMemory);
        }

        let len = tdf_len as usize;
        let payload_space = remaining - total_header;
        let mut num = tdf_num;
        if payload_space < len * tdf_num as usize {
            let mut can_fit = payload_space / len;
            if can_fit == 0 && tdf_num > 1 {
                // A single record needs no array header
                can_fit = ((payload_space + TDF_ARRAY_HEADER_LEN) / len).min(1);
            }
            if can_fit == 0 {
                return Err(TdfError::NoMemory);
            }
            num = can_fit as u8;
        }

        Ok(TdfPlan {
            tdf_id,
            tdf_len,
            tdf_num: num,
            time,
            period,
            timestamp,
        })
    }

    /// Append up to `tdf_num` records of `tdf_len` bytes from `data`.
    ///
    /// Returns the number of records written, which is less than `tdf_num`
    /// when the buffer filled up.  The caller is responsible for flushing and
    /// re-adding the remainder with its time advanced by `period * written`.
    pub fn add(
        &mut self,
        tdf_id: u16,
        tdf_len: u8,
        tdf_num: u8,
        time: u64,
        period: u32,
        data: &[u8],
    ) -> Result<u8, TdfError> {
        if data.len() < tdf_len as usize * tdf_num as usize {
            return Err(TdfError::InvalidArgument("payload shorter than len * num"));
        }
        let plan = self.plan(tdf_id, tdf_len, tdf_num, time, period)?;
        self.write(&plan, data);
        Ok(plan.tdf_num)
    }

    fn write(&mut self, plan: &TdfPlan, data: &[u8]) {
        self.data.extend_from_slice(&plan.id_flags().to_le_bytes());
        self.data.push(plan.tdf_len);
        plan.timestamp.write(&mut self.data);
        if plan.timestamp != TdfTimestamp::None {
            self.time = plan.time;
        }
        if plan.has_array_header() {
            self.data.push(plan.tdf_num);
            self.data
                .extend_from_slice(&encode_array_period(plan.period).to_le_bytes());
        }
        self.data.extend_from_slice(&data[..plan.payload_len()]);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::epoch_time_from;

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| i as u8).collect()
    }

    // ── Argument validation ───────────────────────────────────────────────────

    #[test]
    fn rejects_reserved_ids() {
        let mut buf = TdfBuffer::new(512);
        let data = payload(8);
        assert_eq!(buf.add(0, 4, 1, 0, 0, &data), Err(TdfError::InvalidId(0)));
        assert_eq!(
            buf.add(4095, 4, 1, 0, 0, &data),
            Err(TdfError::InvalidId(4095))
        );
        assert_eq!(buf.add(4094, 4, 1, 0, 0, &data), Ok(1));
    }

    #[test]
    fn rejects_zero_len_and_num() {
        let mut buf = TdfBuffer::new(512);
        let data = payload(8);
        assert_eq!(buf.add(1, 0, 1, 0, 0, &data).unwrap_err().errno(), -22);
        assert_eq!(buf.add(1, 4, 0, 0, 0, &data).unwrap_err().errno(), -22);
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_period_above_scaled_maximum() {
        let mut buf = TdfBuffer::new(512);
        let data = payload(8);
        assert!(matches!(
            buf.add(1, 4, 2, 0, ARRAY_PERIOD_MAX + 1, &data),
            Err(TdfError::InvalidArgument(_))
        ));
        assert_eq!(buf.add(1, 4, 2, 0, ARRAY_PERIOD_MAX, &data), Ok(2));
    }

    #[test]
    fn record_larger_than_buffer_is_enospc() {
        let mut buf = TdfBuffer::new(32);
        let data = payload(40);
        let err = buf.add(1, 30, 1, 0, 0, &data).unwrap_err();
        assert_eq!(
            err,
            TdfError::TooLarge {
                required: 33,
                capacity: 32
            }
        );
        assert_eq!(err.errno(), -28);
    }

    // ── Single records ────────────────────────────────────────────────────────

    #[test]
    fn untimed_single_record_layout() {
        let mut buf = TdfBuffer::new(512);
        let data = payload(17);
        assert_eq!(buf.add(37, 17, 1, 0, 0, &data), Ok(1));
        assert_eq!(buf.len(), 20);
        assert_eq!(buf.time(), 0);
        assert_eq!(&buf.as_bytes()[..3], &[37, 0x00, 17]);
        assert_eq!(&buf.as_bytes()[3..], &data[..]);
    }

    #[test]
    fn first_timestamp_is_absolute() {
        let mut buf = TdfBuffer::new(512);
        let t = epoch_time_from(1_000_000, 0x1234);
        assert_eq!(buf.add(5, 2, 1, t, 0, &[0xAA, 0xBB]), Ok(1));
        let bytes = buf.as_bytes();
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), TDF_TIMESTAMP_ABSOLUTE | 5);
        assert_eq!(&bytes[3..7], &1_000_000u32.to_le_bytes());
        assert_eq!(&bytes[7..9], &0x1234u16.to_le_bytes());
        assert_eq!(buf.len(), 3 + 6 + 2);
        assert_eq!(buf.time(), t);
    }

    // ── Timestamp deltas ──────────────────────────────────────────────────────

    #[test]
    fn small_positive_delta_is_relative() {
        let mut buf = TdfBuffer::new(512);
        let t1 = epoch_time_from(1000, 0);
        buf.add(5, 1, 1, t1, 0, &[1]).unwrap();
        let before = buf.len();
        buf.add(5, 1, 1, t1 + 65_535, 0, &[2]).unwrap();
        let rec = &buf.as_bytes()[before..];
        let flags = u16::from_le_bytes([rec[0], rec[1]]) & TDF_TIMESTAMP_MASK;
        assert_eq!(flags, TDF_TIMESTAMP_RELATIVE);
        assert_eq!(&rec[3..5], &[0xFF, 0xFF]);
        assert_eq!(rec.len(), 3 + 2 + 1);
    }

    #[test]
    fn medium_delta_is_extended_relative() {
        let mut buf = TdfBuffer::new(512);
        let t1 = epoch_time_from(1000, 0);
        buf.add(5, 1, 1, t1, 0, &[1]).unwrap();
        let before = buf.len();
        buf.add(5, 1, 1, t1 + 65_536, 0, &[2]).unwrap();
        let rec = &buf.as_bytes()[before..];
        assert_eq!(
            u16::from_le_bytes([rec[0], rec[1]]) & TDF_TIMESTAMP_MASK,
            TDF_TIMESTAMP_EXTENDED_RELATIVE
        );
        assert_eq!(&rec[3..6], &[0x00, 0x00, 0x01]);
        assert_eq!(buf.time(), t1 + 65_536);
    }

    #[test]
    fn negative_delta_is_extended_relative() {
        let mut buf = TdfBuffer::new(512);
        let t1 = epoch_time_from(1000, 0);
        buf.add(5, 1, 1, t1, 0, &[1]).unwrap();
        let before = buf.len();
        buf.add(5, 1, 1, t1 - 1, 0, &[2]).unwrap();
        let rec = &buf.as_bytes()[before..];
        assert_eq!(&rec[3..6], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn large_delta_falls_back_to_absolute() {
        let mut buf = TdfBuffer::new(512);
        let t1 = epoch_time_from(1000, 0);
        buf.add(5, 1, 1, t1, 0, &[1]).unwrap();
        let before = buf.len();
        buf.add(5, 1, 1, t1 + 0x80_0000, 0, &[2]).unwrap();
        let rec = &buf.as_bytes()[before..];
        assert_eq!(
            u16::from_le_bytes([rec[0], rec[1]]) & TDF_TIMESTAMP_MASK,
            TDF_TIMESTAMP_ABSOLUTE
        );
    }

    #[test]
    fn untimed_record_keeps_reference() {
        let mut buf = TdfBuffer::new(512);
        let t1 = epoch_time_from(1000, 0);
        buf.add(5, 1, 1, t1, 0, &[1]).unwrap();
        buf.add(6, 1, 1, 0, 0, &[2]).unwrap();
        assert_eq!(buf.time(), t1);
    }

    // ── Arrays ────────────────────────────────────────────────────────────────

    #[test]
    fn array_header_present_only_for_multiple_records() {
        let mut buf = TdfBuffer::new(512);
        let data = payload(12);
        assert_eq!(buf.add(9, 4, 3, 0, 100, &data), Ok(3));
        let bytes = buf.as_bytes();
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), TDF_ARRAY_TIME | 9);
        assert_eq!(bytes[3], 3);
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 100);
        assert_eq!(buf.len(), 3 + 3 + 12);
    }

    #[test]
    fn large_period_is_scaled() {
        assert_eq!(encode_array_period(0x7FFF), 0x7FFF);
        assert_eq!(encode_array_period(0x8000), 0x8000 | 4);
        assert_eq!(decode_array_period(0x8000 | 4), 4 * 8192);
        assert_eq!(decode_array_period(encode_array_period(ARRAY_PERIOD_MAX)), ARRAY_PERIOD_MAX);
    }

    // ── Capacity negotiation ──────────────────────────────────────────────────

    #[test]
    fn partial_write_returns_records_that_fit() {
        // header 3 + array 3 + 3 records * 10 bytes = 36
        let mut buf = TdfBuffer::new(40);
        let data = payload(50);
        assert_eq!(buf.add(1, 10, 5, 0, 0, &data), Ok(3));
        assert_eq!(buf.len(), 36);
        assert_eq!(buf.as_bytes()[3], 3);
    }

    #[test]
    fn array_header_is_reclaimed_for_last_record() {
        let mut buf = TdfBuffer::new(64);
        buf.add(1, 50, 1, 0, 0, &payload(50)).unwrap();
        // 64 - 53 = 11 remaining: 3 + 3 + 8 does not fit, 3 + 8 does
        assert_eq!(buf.remaining(), 11);
        assert_eq!(buf.add(2, 8, 4, 0, 0, &payload(32)), Ok(1));
        assert_eq!(buf.remaining(), 0);
        let rec = &buf.as_bytes()[53..];
        assert_eq!(u16::from_le_bytes([rec[0], rec[1]]) & TDF_ARRAY_MASK, TDF_ARRAY_NONE);
    }

    #[test]
    fn reclaim_never_produces_array_without_header_room() {
        let mut buf = TdfBuffer::new(16);
        buf.add(1, 10, 1, 0, 0, &payload(10)).unwrap();
        assert_eq!(buf.remaining(), 3);
        assert_eq!(buf.add(2, 1, 4, 0, 0, &payload(4)), Err(TdfError::NoMemory));

        // 1 payload byte + reclaimed 3 would hold two 2-byte records,
        // but without an array header only one can be written
        let mut buf = TdfBuffer::new(20);
        buf.add(1, 10, 1, 0, 0, &payload(10)).unwrap();
        assert_eq!(buf.remaining(), 7);
        assert_eq!(buf.add(2, 2, 4, 0, 0, &payload(8)), Ok(1));
        assert_eq!(buf.remaining(), 2);
    }

    #[test]
    fn full_buffer_is_enomem() {
        let mut buf = TdfBuffer::new(23);
        buf.add(1, 20, 1, 0, 0, &payload(20)).unwrap();
        let err = buf.add(1, 1, 1, 0, 0, &[0]).unwrap_err();
        assert_eq!(err, TdfError::NoMemory);
        assert_eq!(err.errno(), -12);
    }

    #[test]
    fn plan_does_not_mutate() {
        let buf = TdfBuffer::new(40);
        let plan = buf.plan(1, 10, 5, epoch_time_from(10, 0), 0).unwrap();
        assert_eq!(plan.tdf_num, 2);
        assert_eq!(plan.encoded_len(), 3 + 6 + 3 + 20);
        assert!(buf.is_empty());
        assert_eq!(buf.time(), 0);
    }

    #[test]
    fn reset_clears_reference() {
        let mut buf = TdfBuffer::new(64);
        buf.add(1, 1, 1, epoch_time_from(10, 0), 0, &[0]).unwrap();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.time(), 0);
    }
}

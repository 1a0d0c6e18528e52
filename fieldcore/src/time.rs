/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Epoch time representation and the clock abstraction used by the runner.
//!
//! Epoch time is a 48.16 fixed-point count of seconds since the GPS epoch
//! (1980-01-06T00:00:00Z):
//!
//! ```text
//!  63            16 15            0
//! ┌────────────────┬───────────────┐
//! │    seconds     │  subseconds   │   subseconds = 1/65536 s
//! └────────────────┴───────────────┘
//! ```
//!
//! TDF timestamps and deltas are expressed in these ticks.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Seconds between the Unix epoch and the GPS epoch, excluding leap seconds.
pub const GPS_UNIX_OFFSET_SECONDS_BASE: u64 = 315_964_800;

/// Leap seconds between GPS time and UTC.
pub const GPS_UNIX_OFFSET_SECONDS_LEAP: u64 = 18;

/// Epoch ticks per second.
pub const TICKS_PER_SEC: u64 = 65_536;

// ── Conversions ───────────────────────────────────────────────────────────────

/// Whole seconds of an epoch time.
pub fn epoch_time_seconds(epoch_time: u64) -> u64 {
    epoch_time >> 16
}

/// Fractional part of an epoch time, in 1/65536 s.
pub fn epoch_time_subseconds(epoch_time: u64) -> u16 {
    (epoch_time & 0xFFFF) as u16
}

/// Fractional part of an epoch time, in milliseconds.
pub fn epoch_time_milliseconds(epoch_time: u64) -> u16 {
    ((epoch_time_subseconds(epoch_time) as u32 * 1000) / 0x10000) as u16
}

/// Construct an epoch time from its components.
pub fn epoch_time_from(seconds: u64, subseconds: u16) -> u64 {
    (seconds << 16) | subseconds as u64
}

/// Convert a Unix timestamp into epoch time.
///
/// Times before the GPS epoch saturate to zero, which TDF treats as
/// "no timestamp".
pub fn epoch_time_from_unix(unix_seconds: u64, subseconds: u16) -> u64 {
    let seconds = (unix_seconds + GPS_UNIX_OFFSET_SECONDS_LEAP)
        .saturating_sub(GPS_UNIX_OFFSET_SECONDS_BASE);
    epoch_time_from(seconds, subseconds)
}

/// Convert an epoch time back into whole Unix seconds.
pub fn unix_time_from_epoch(epoch_time: u64) -> u64 {
    (epoch_time_seconds(epoch_time) + GPS_UNIX_OFFSET_SECONDS_BASE)
        .saturating_sub(GPS_UNIX_OFFSET_SECONDS_LEAP)
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Time source consumed by the auto-iterate driver.
pub trait Clock: Send + Sync {
    /// Seconds since the clock was started.
    fn uptime_s(&self) -> u32;

    /// Current epoch time, `0` when no time source is known.
    fn epoch_time(&self) -> u64;
}

/// Clock backed by the tokio monotonic clock and the host wall clock.
///
/// Uptime follows `tokio::time::Instant`, so paused-time tests advance it.
#[derive(Debug, Clone)]
pub struct SystemClock {
    boot: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn uptime_s(&self) -> u32 {
        self.boot.elapsed().as_secs() as u32
    }

    fn epoch_time(&self) -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => {
                let subseconds = ((d.subsec_nanos() as u64 * TICKS_PER_SEC) / 1_000_000_000) as u16;
                epoch_time_from_unix(d.as_secs(), subseconds)
            }
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_round_trip() {
        let t = epoch_time_from(1_000_000, 0x8000);
        assert_eq!(epoch_time_seconds(t), 1_000_000);
        assert_eq!(epoch_time_subseconds(t), 0x8000);
        assert_eq!(epoch_time_milliseconds(t), 500);
    }

    #[test]
    fn unix_conversion_applies_gps_offset() {
        // 2024-01-01T00:00:00Z
        let unix = 1_704_067_200;
        let t = epoch_time_from_unix(unix, 0);
        assert_eq!(epoch_time_seconds(t), unix + 18 - 315_964_800);
        assert_eq!(unix_time_from_epoch(t), unix);
    }

    #[test]
    fn pre_gps_epoch_saturates() {
        assert_eq!(epoch_time_from_unix(0, 0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn system_clock_uptime_follows_tokio_time() {
        let clock = SystemClock::new();
        assert_eq!(clock.uptime_s(), 0);
        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        assert_eq!(clock.uptime_s(), 3);
    }
}

/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Declarative task schedules and the per-schedule runtime state.
//!
//! ```text
//!  TaskSchedule (immutable, YAML)        TaskScheduleState (runner-owned)
//!  ┌──────────────────────────┐          ┌─────────────────────┐
//!  │ task_id ─────────────────┼──bind──► │ last_run            │
//!  │ validity / periodicity   │          │ runtime             │
//!  │ battery / states gates   │          │ last_terminate      │
//!  │ task_logging / task_args │          └─────────────────────┘
//!  └──────────────────────────┘
//! ```
//!
//! The decision functions over these types live in [`schedule`].

pub mod schedule;

use serde::Deserialize;

use crate::data_logger::LoggerMask;

pub use schedule::{
    should_start, should_terminate, validate, ScheduleError, ScheduleInputs, ScheduleReason,
};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Maximum `{loggers, tdf_mask}` pairs per schedule.
pub const TASK_LOGGING_MAX: usize = 2;

/// Maximum application state conditions per condition list.
pub const STATE_CONDITIONS_MAX: usize = 4;

// ── Application states ────────────────────────────────────────────────────────

/// Well-known application state bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AppState {
    /// The system is about to reboot; nothing may start.
    Rebooting = 0,
    /// The device is in its active (non-idle) mode.
    ApplicationActive = 1,
}

/// Set of application state bits (0..64).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppStates(u64);

impl AppStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, state: AppState) -> Self {
        self.set_bit(state as u8);
        self
    }

    pub fn set(&mut self, state: AppState) {
        self.set_bit(state as u8);
    }

    pub fn clear(&mut self, state: AppState) {
        self.clear_bit(state as u8);
    }

    pub fn contains(&self, state: AppState) -> bool {
        self.test_bit(state as u8)
    }

    pub fn set_bit(&mut self, bit: u8) {
        if bit < 64 {
            self.0 |= 1 << bit;
        }
    }

    pub fn clear_bit(&mut self, bit: u8) {
        if bit < 64 {
            self.0 &= !(1 << bit);
        }
    }

    pub fn test_bit(&self, bit: u8) -> bool {
        bit < 64 && self.0 & (1 << bit) != 0
    }

    /// Set state bits, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = u8> {
        let bits = self.0;
        (0..64u8).filter(move |bit| bits & (1 << bit) != 0)
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// One application state test: the bit must be set, or clear when inverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StateCondition {
    pub state: u8,
    #[serde(default)]
    pub invert: bool,
}

// ── Schedule descriptor ───────────────────────────────────────────────────────

/// Gate controlling whether a schedule is eligible at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    #[default]
    Always,
    /// Only while [`AppState::ApplicationActive`] is set.
    Active,
    /// Only while [`AppState::ApplicationActive`] is clear.
    Inactive,
    /// Restarted whenever not running, never terminated.
    PermanentlyRuns,
}

/// When a schedule wants its task started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Periodicity {
    /// No timing constraint.
    #[default]
    None,
    /// Whenever epoch seconds are a multiple of `period_s`.
    Fixed { period_s: u32 },
    /// At least `lockout_s` seconds after the previous start.
    Lockout {
        lockout_s: u32,
        /// Start immediately when the schedule has never run.
        #[serde(default)]
        ignore_first: bool,
    },
    /// `duration_s` seconds after the task of `schedule_idx` terminated.
    After { schedule_idx: usize, duration_s: u32 },
}

/// Battery percentage window, `0` disables a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct BatteryRange {
    #[serde(default)]
    pub lower: u8,
    #[serde(default)]
    pub upper: u8,
}

/// Which TDFs a schedule emits and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct TaskLogging {
    pub loggers: LoggerMask,
    pub tdf_mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GnssRunMode {
    #[default]
    SingleFix,
    Continuous,
}

/// Task specific arguments, one variant per task kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskArgs {
    #[default]
    None,
    NetworkScan {
        #[serde(default)]
        flags: u8,
        #[serde(default)]
        desired_cells: u8,
    },
    Imu {
        accel_range_g: u8,
        accel_rate_hz: u16,
        #[serde(default)]
        gyro_range_dps: u16,
        #[serde(default)]
        gyro_rate_hz: u16,
        fifo_sample_buffer: u16,
    },
    Gnss {
        #[serde(default)]
        run_mode: GnssRunMode,
        accuracy_m: u16,
        position_dop: u8,
        fix_timeout_s: u32,
    },
    TdfLogger {
        loggers: LoggerMask,
        tdfs: u32,
        logging_period_ms: u32,
        #[serde(default)]
        random_delay_ms: u16,
        #[serde(default)]
        per_run: u8,
    },
    Custom {
        data: Vec<u8>,
    },
}

/// Declarative rule for when a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TaskSchedule {
    pub task_id: u8,
    #[serde(default)]
    pub validity: Validity,
    #[serde(default)]
    pub periodicity: Periodicity,
    /// Runtime after which termination is requested, `0` = unbounded.
    #[serde(default)]
    pub timeout_s: u32,
    #[serde(default)]
    pub battery_start: BatteryRange,
    #[serde(default)]
    pub battery_terminate: BatteryRange,
    #[serde(default)]
    pub states_start: Vec<StateCondition>,
    /// Start even if `states_start` fails once this long since the last run.
    #[serde(default)]
    pub states_start_timeout_s: u32,
    #[serde(default)]
    pub states_terminate: Vec<StateCondition>,
    #[serde(default)]
    pub task_logging: Vec<TaskLogging>,
    #[serde(default)]
    pub task_args: TaskArgs,
}

impl TaskSchedule {
    pub fn new(task_id: u8, periodicity: Periodicity) -> Self {
        Self {
            task_id,
            periodicity,
            ..Default::default()
        }
    }

    /// Loggers this schedule sends `tdf_id` to, across all logging entries.
    ///
    /// TDF IDs are mapped onto mask bits by the task, `tdf_bit` is that bit.
    pub fn loggers_for(&self, tdf_bit: u32) -> LoggerMask {
        self.task_logging
            .iter()
            .filter(|l| tdf_bit < 32 && l.tdf_mask & (1 << tdf_bit) != 0)
            .fold(LoggerMask::NONE, |acc, l| acc | l.loggers)
    }
}

/// Mutable per-schedule state, owned by the task runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskScheduleState {
    /// Uptime of the most recent start.
    pub last_run: u32,
    /// Seconds the current run has been active.
    pub runtime: u32,
    /// Uptime at which the most recent run was observed complete.
    pub last_terminate: u32,
}

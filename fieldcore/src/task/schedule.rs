//! Pure schedule decision functions.
//!
//! | Decision | Combination | Conditions |
//! |---|---|---|
//! | start | all must hold | not rebooting, validity, periodicity, battery window, start states |
//! | terminate | any one suffices | rebooting, validity lost, timeout, battery, terminate states |

use thiserror::Error;

use super::{
    AppState, AppStates, BatteryRange, Periodicity, StateCondition, TaskSchedule,
    TaskScheduleState, Validity, STATE_CONDITIONS_MAX, TASK_LOGGING_MAX,
};
use crate::errno;

// ── Inputs ────────────────────────────────────────────────────────────────────

/// System conditions sampled once per runner tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduleInputs {
    pub app_states: AppStates,
    /// Seconds since boot.
    pub uptime: u32,
    /// Epoch (GPS) seconds.
    pub epoch_time: u32,
    /// Battery state of charge, 0..=100.
    pub battery_soc: u8,
}

// ── Validation errors ─────────────────────────────────────────────────────────

/// Why a schedule descriptor is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleReason {
    ZeroPeriod,
    ZeroLockout,
    /// AFTER chained to itself.
    SelfChained,
    BatteryOutOfRange { value: u8 },
    BatteryRangeInverted { lower: u8, upper: u8 },
    TooManyLoggingEntries { count: usize },
    TooManyStateConditions { count: usize },
}

impl std::fmt::Display for ScheduleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleReason::ZeroPeriod => write!(f, "fixed periodicity requires period_s > 0"),
            ScheduleReason::ZeroLockout => {
                write!(f, "lockout periodicity requires lockout_s > 0")
            }
            ScheduleReason::SelfChained => write!(f, "after periodicity references itself"),
            ScheduleReason::BatteryOutOfRange { value } => {
                write!(f, "battery threshold {}% outside 0..=100", value)
            }
            ScheduleReason::BatteryRangeInverted { lower, upper } => write!(
                f,
                "battery upper bound {}% must exceed lower bound {}%",
                upper, lower
            ),
            ScheduleReason::TooManyLoggingEntries { count } => write!(
                f,
                "{} task_logging entries (max {})",
                count, TASK_LOGGING_MAX
            ),
            ScheduleReason::TooManyStateConditions { count } => write!(
                f,
                "{} state conditions (max {})",
                count, STATE_CONDITIONS_MAX
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid schedule for task {task_id}: {reason}")]
pub struct ScheduleError {
    pub task_id: u8,
    pub reason: ScheduleReason,
}

impl ScheduleError {
    pub fn errno(&self) -> i32 {
        -errno::EINVAL
    }
}

// ── validate ──────────────────────────────────────────────────────────────────

fn validate_range(range: &BatteryRange) -> Result<(), ScheduleReason> {
    for value in [range.lower, range.upper] {
        if value > 100 {
            return Err(ScheduleReason::BatteryOutOfRange { value });
        }
    }
    if range.lower != 0 && range.upper != 0 && range.upper <= range.lower {
        return Err(ScheduleReason::BatteryRangeInverted {
            lower: range.lower,
            upper: range.upper,
        });
    }
    Ok(())
}

fn validate_reason(schedule: &TaskSchedule, own_idx: Option<usize>) -> Result<(), ScheduleReason> {
    match schedule.periodicity {
        Periodicity::Fixed { period_s: 0 } => return Err(ScheduleReason::ZeroPeriod),
        Periodicity::Lockout { lockout_s: 0, .. } => return Err(ScheduleReason::ZeroLockout),
        Periodicity::After { schedule_idx, .. } if Some(schedule_idx) == own_idx => {
            return Err(ScheduleReason::SelfChained)
        }
        _ => {}
    }
    validate_range(&schedule.battery_start)?;
    validate_range(&schedule.battery_terminate)?;
    if schedule.task_logging.len() > TASK_LOGGING_MAX {
        return Err(ScheduleReason::TooManyLoggingEntries {
            count: schedule.task_logging.len(),
        });
    }
    for states in [&schedule.states_start, &schedule.states_terminate] {
        if states.len() > STATE_CONDITIONS_MAX {
            return Err(ScheduleReason::TooManyStateConditions {
                count: states.len(),
            });
        }
    }
    Ok(())
}

/// Static sanity check of a schedule descriptor.
pub fn validate(schedule: &TaskSchedule) -> Result<(), ScheduleError> {
    validate_at(schedule, None)
}

/// [`validate`] with knowledge of the schedule's own table index, which also
/// rejects AFTER chains onto itself.
pub fn validate_at(schedule: &TaskSchedule, own_idx: Option<usize>) -> Result<(), ScheduleError> {
    validate_reason(schedule, own_idx).map_err(|reason| ScheduleError {
        task_id: schedule.task_id,
        reason,
    })
}

// ── Evaluation helpers ────────────────────────────────────────────────────────

fn validity_holds(validity: Validity, app_states: &AppStates) -> bool {
    let active = app_states.contains(AppState::ApplicationActive);
    match validity {
        Validity::Active => active,
        Validity::Inactive => !active,
        Validity::Always | Validity::PermanentlyRuns => true,
    }
}

/// All conditions hold; `empty` is returned for an empty list.
fn states_hold(conditions: &[StateCondition], app_states: &AppStates, empty: bool) -> bool {
    if conditions.is_empty() {
        return empty;
    }
    conditions
        .iter()
        .all(|c| app_states.test_bit(c.state) != c.invert)
}

// ── should_start / should_terminate ───────────────────────────────────────────

/// Whether a schedule that is not running should start now.
///
/// `after` is the state of the predecessor schedule for
/// [`Periodicity::After`], supplied by the runner.
pub fn should_start(
    schedule: &TaskSchedule,
    state: &TaskScheduleState,
    after: Option<&TaskScheduleState>,
    inputs: &ScheduleInputs,
) -> bool {
    let app_states = &inputs.app_states;
    let since_last_run = inputs.uptime.wrapping_sub(state.last_run);

    // Nothing starts while the system is going down
    if app_states.contains(AppState::Rebooting) {
        return false;
    }
    if !validity_holds(schedule.validity, app_states) {
        return false;
    }

    let periodicity = match schedule.periodicity {
        Periodicity::None => true,
        Periodicity::Fixed { period_s } => period_s != 0 && inputs.epoch_time % period_s == 0,
        Periodicity::Lockout {
            lockout_s,
            ignore_first,
        } => {
            // last_run must end up nonzero, so uptime 0 never counts as a first run
            since_last_run >= lockout_s
                || (ignore_first && state.last_run == 0 && inputs.uptime != 0)
        }
        Periodicity::After { duration_s, .. } => after.is_some_and(|linked| {
            linked.last_terminate != 0
                && linked.last_terminate.wrapping_add(duration_s) == inputs.uptime
        }),
    };

    let battery = &schedule.battery_start;
    let battery_lower = battery.lower == 0 || inputs.battery_soc >= battery.lower;
    let battery_upper = battery.upper == 0 || inputs.battery_soc <= battery.upper;

    let states = (schedule.states_start_timeout_s != 0
        && since_last_run >= schedule.states_start_timeout_s)
        || states_hold(&schedule.states_start, app_states, true);

    periodicity && battery_lower && battery_upper && states
}

/// Whether a running schedule should be asked to terminate.
pub fn should_terminate(
    schedule: &TaskSchedule,
    state: &TaskScheduleState,
    inputs: &ScheduleInputs,
) -> bool {
    let app_states = &inputs.app_states;

    if app_states.contains(AppState::Rebooting) {
        return true;
    }
    if !validity_holds(schedule.validity, app_states) {
        return true;
    }

    let timeout = schedule.timeout_s != 0 && state.runtime >= schedule.timeout_s;
    let battery = &schedule.battery_terminate;
    let battery_lower = battery.lower != 0 && inputs.battery_soc <= battery.lower;
    let battery_upper = battery.upper != 0 && inputs.battery_soc >= battery.upper;
    let states = states_hold(&schedule.states_terminate, app_states, false);

    timeout || battery_lower || battery_upper || states
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Demo tasks bound by the `fieldcore` binary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info, warn};

use fieldcore::data_logger::{LoggerMask, LoggerSet};
use fieldcore::runner::{ExecutorKind, Task, TaskConfig, TaskContext, TaskStatus};
use fieldcore::task::{Periodicity, TaskArgs, TaskSchedule};
use fieldcore::time::Clock;

pub const TASK_ID_TDF_LOGGER: u8 = 1;
pub const TASK_ID_HEARTBEAT: u8 = 2;

/// Device uptime in seconds, `u32`.
pub const TDF_UPTIME: u16 = 10;
/// Bit selecting [`TDF_UPTIME`] in `tdfs` and `tdf_mask`.
pub const TDF_UPTIME_BIT: u32 = 0;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

// ── tdf_logger ────────────────────────────────────────────────────────────────

/// Logs the selected TDFs every `logging_period_ms`, `per_run` times.
pub struct TdfLoggerTask {
    pub loggers: Arc<LoggerSet>,
    pub clock: Arc<dyn Clock>,
}

#[async_trait]
impl Task for TdfLoggerTask {
    async fn run(&self, ctx: &TaskContext) -> TaskStatus {
        let TaskArgs::TdfLogger {
            loggers,
            tdfs,
            logging_period_ms,
            random_delay_ms,
            per_run,
        } = ctx.schedule.task_args
        else {
            warn!(schedule = ctx.schedule_idx, "tdf_logger scheduled without tdf_logger arguments");
            return TaskStatus::Complete;
        };
        if ctx.is_terminated() {
            return TaskStatus::Complete;
        }

        // The first invocation only waits out the random start delay
        let delayed = random_delay_ms > 0;
        if delayed && ctx.reschedule_counter() == 0 {
            let delay = rand::thread_rng().gen_range(0..=random_delay_ms);
            debug!(delay_ms = delay, "delaying first sample");
            return TaskStatus::Reschedule(Duration::from_millis(u64::from(delay)));
        }
        let sample = ctx.reschedule_counter() - u32::from(delayed);

        if tdfs & (1 << TDF_UPTIME_BIT) != 0 {
            let mask = loggers | ctx.schedule.loggers_for(TDF_UPTIME_BIT);
            let uptime = self.clock.uptime_s();
            let time = self.clock.epoch_time();
            if let Err(e) = self
                .loggers
                .log(mask, TDF_UPTIME, 4, time, &uptime.to_le_bytes())
                .await
            {
                warn!(error = %e, errno = e.errno(), "failed to log uptime");
            }
        }

        if per_run != 0 && sample + 1 >= u32::from(per_run) {
            return TaskStatus::Complete;
        }
        TaskStatus::Reschedule(Duration::from_millis(u64::from(logging_period_ms)))
    }
}

// ── heartbeat ─────────────────────────────────────────────────────────────────

/// Emits a log line every second until terminated.
pub struct Heartbeat;

#[async_trait]
impl Task for Heartbeat {
    async fn run(&self, ctx: &TaskContext) -> TaskStatus {
        let mut beats = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_PERIOD) => {
                    beats += 1;
                    info!(schedule = ctx.schedule_idx, beats, "heartbeat");
                }
                _ = ctx.terminated() => break,
            }
        }
        debug!(beats, "heartbeat stopped");
        TaskStatus::Complete
    }
}

// ── Wiring ────────────────────────────────────────────────────────────────────

pub fn tasks(loggers: Arc<LoggerSet>, clock: Arc<dyn Clock>) -> Vec<TaskConfig> {
    vec![
        TaskConfig::new(
            "tdf_logger",
            TASK_ID_TDF_LOGGER,
            ExecutorKind::Workqueue,
            TdfLoggerTask { loggers, clock },
        ),
        TaskConfig::new("heartbeat", TASK_ID_HEARTBEAT, ExecutorKind::Thread, Heartbeat),
    ]
}

/// Schedules used when no configuration file is given.
///
/// Uptime is logged three times every ten seconds; the heartbeat runs for
/// three seconds two seconds after each logging burst.
pub fn default_schedules() -> Vec<TaskSchedule> {
    let mut logging = TaskSchedule::new(
        TASK_ID_TDF_LOGGER,
        Periodicity::Lockout {
            lockout_s: 10,
            ignore_first: true,
        },
    );
    logging.timeout_s = 5;
    logging.task_args = TaskArgs::TdfLogger {
        loggers: LoggerMask::FLASH,
        tdfs: 1 << TDF_UPTIME_BIT,
        logging_period_ms: 1000,
        random_delay_ms: 0,
        per_run: 3,
    };

    let mut heartbeat = TaskSchedule::new(
        TASK_ID_HEARTBEAT,
        Periodicity::After {
            schedule_idx: 0,
            duration_s: 2,
        },
    );
    heartbeat.timeout_s = 3;

    vec![logging, heartbeat]
}

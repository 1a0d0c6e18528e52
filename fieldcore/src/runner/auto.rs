//! Once-per-second driver for [`TaskRunner::iterate`].
//!
//! Ticks are scheduled on absolute deadlines (`start + n s`) so a slow tick
//! does not shift every following one. Each tick samples the clock, the
//! latest battery state and the application states, then runs the iteration
//! as a job on the runner's work queue.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::TaskRunner;
use crate::task::{AppStates, ScheduleInputs};
use crate::time::{epoch_time_seconds, Clock};

/// Most recent battery measurement published by the power subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatteryState {
    /// State of charge, 0..=100 %.
    pub soc: u8,
    pub voltage_mv: u32,
}

/// Handle to a running auto-iterate driver. Dropping it stops the driver.
#[derive(Debug)]
pub struct AutoIterate {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl AutoIterate {
    /// Stop ticking and wait for an in-progress tick to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for AutoIterate {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn the driver on the current runtime.
///
/// `default_soc` is used until the first [`BatteryState`] is published.
pub fn start_auto_iterate(
    runner: Arc<Mutex<TaskRunner>>,
    clock: Arc<dyn Clock>,
    battery: watch::Receiver<Option<BatteryState>>,
    app_states: watch::Receiver<AppStates>,
    default_soc: u8,
) -> AutoIterate {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let workqueue = runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .workqueue()
            .clone();
        let start = Instant::now();
        let mut tick: u64 = 0;
        info!(queue = %workqueue.name(), "task runner auto-iterate started");

        loop {
            let deadline = start + Duration::from_secs(tick);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep_until(deadline) => {}
            }
            tick += 1;

            let inputs = ScheduleInputs {
                app_states: *app_states.borrow(),
                uptime: clock.uptime_s(),
                epoch_time: epoch_time_seconds(clock.epoch_time()) as u32,
                battery_soc: battery.borrow().map_or(default_soc, |b| b.soc),
            };
            let runner = runner.clone();
            let result = workqueue
                .run(async move {
                    runner
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .iterate(&inputs);
                })
                .await;
            if result.is_err() {
                warn!("work queue closed, stopping auto-iterate");
                break;
            }
        }
        info!("task runner auto-iterate stopped");
    });

    AutoIterate { cancel, handle }
}

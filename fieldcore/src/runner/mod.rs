/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Task runner: binds schedules to tasks and drives them once per tick.
//!
//! # Lifecycle of one task
//!
//! ```text
//!            should_start                 should_terminate
//!   Idle ─────────────────► Running ───────────────────────► Terminating
//!    ▲                         │                                  │
//!    │      reaped on the      │ task returned Complete           │
//!    └──────── next tick ◄─────┴──────────────────────────────────┘
//! ```
//!
//! A task may be referenced by several schedules; while it runs for one of
//! them the others are not evaluated. Termination is cooperative: the
//! runner cancels the task's [`CancellationToken`] and waits for the task to
//! return.
//!
//! # Executors
//! * [`ExecutorKind::Workqueue`] – each run is a job on the shared serial
//!   [`WorkQueue`]. Returning [`TaskStatus::Reschedule`] re-queues the task
//!   after the delay, or immediately once termination was requested.
//! * [`ExecutorKind::Thread`] – the task runs as its own tokio task.

pub mod auto;
pub mod error;
pub mod workqueue;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::task::schedule::validate_at;
use crate::task::{
    should_start, should_terminate, Periodicity, ScheduleInputs, TaskSchedule, TaskScheduleState,
    Validity,
};

pub use auto::{start_auto_iterate, AutoIterate, BatteryState};
pub use error::RunnerError;
pub use workqueue::{WorkQueue, WorkQueueClosed};

/// Capacity of the schedule event channel; slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ── Task definition ───────────────────────────────────────────────────────────

/// Where a task body executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Workqueue,
    Thread,
}

/// Outcome of one invocation of [`Task::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Complete,
    /// Run again after the delay (skipped once termination is requested).
    Reschedule(Duration),
}

/// A schedulable unit of work.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, ctx: &TaskContext) -> TaskStatus;
}

/// Immutable description of a task known to the runner.
#[derive(Clone)]
pub struct TaskConfig {
    pub name: String,
    pub task_id: u8,
    pub executor: ExecutorKind,
    pub task: Arc<dyn Task>,
}

impl TaskConfig {
    pub fn new(
        name: impl Into<String>,
        task_id: u8,
        executor: ExecutorKind,
        task: impl Task + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            task_id,
            executor,
            task: Arc::new(task),
        }
    }
}

impl fmt::Debug for TaskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskConfig")
            .field("name", &self.name)
            .field("task_id", &self.task_id)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

/// Everything a task sees about the run it was started for.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Copy of the schedule that started this run.
    pub schedule: TaskSchedule,
    pub schedule_idx: usize,
    terminate: CancellationToken,
    reschedule_counter: u32,
}

impl TaskContext {
    /// Termination has been requested for this run.
    pub fn is_terminated(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Resolves once termination is requested.
    pub async fn terminated(&self) {
        self.terminate.cancelled().await
    }

    pub fn terminate_token(&self) -> &CancellationToken {
        &self.terminate
    }

    /// Number of reschedules so far in this run, `0` on the first call.
    pub fn reschedule_counter(&self) -> u32 {
        self.reschedule_counter
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEventKind {
    Started,
    TerminateRequest,
    Stopped,
}

/// State transition of one schedule, published to [`TaskRunner::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEvent {
    pub schedule_idx: usize,
    pub task_id: u8,
    pub kind: ScheduleEventKind,
}

// ── Runner-owned task state ───────────────────────────────────────────────────

#[derive(Debug)]
struct TaskData {
    running: bool,
    schedule_idx: usize,
    terminate: CancellationToken,
    done: Arc<AtomicBool>,
}

impl Default for TaskData {
    fn default() -> Self {
        Self {
            running: false,
            schedule_idx: 0,
            terminate: CancellationToken::new(),
            done: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// Marks a run finished when dropped, including when the run panics or its
/// queued job is discarded.
struct DoneGuard(Arc<AtomicBool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

// ── TaskRunner ────────────────────────────────────────────────────────────────

pub struct TaskRunner {
    schedules: Vec<TaskSchedule>,
    states: Vec<TaskScheduleState>,
    /// Schedule index → task index.
    bound: Vec<usize>,
    tasks: Vec<TaskConfig>,
    data: Vec<TaskData>,
    /// Task ID → task index.
    registry: HashMap<u8, usize>,
    workqueue: WorkQueue,
    events: broadcast::Sender<ScheduleEvent>,
}

impl TaskRunner {
    /// Validate and bind a schedule table to the task list.
    ///
    /// All schedule state starts zeroed and no task is running.
    pub fn new(
        schedules: Vec<TaskSchedule>,
        tasks: Vec<TaskConfig>,
        workqueue: WorkQueue,
    ) -> Result<Self, RunnerError> {
        let mut registry = HashMap::with_capacity(tasks.len());
        for (task_idx, task) in tasks.iter().enumerate() {
            if let Some(&first) = registry.get(&task.task_id) {
                let first: &TaskConfig = &tasks[first];
                return Err(RunnerError::DuplicateTaskId {
                    task_id: task.task_id,
                    first: first.name.clone(),
                    second: task.name.clone(),
                });
            }
            registry.insert(task.task_id, task_idx);
        }

        let mut bound = Vec::with_capacity(schedules.len());
        for (schedule_idx, schedule) in schedules.iter().enumerate() {
            validate_at(schedule, Some(schedule_idx)).map_err(|source| {
                RunnerError::InvalidSchedule {
                    schedule_idx,
                    source,
                }
            })?;
            if let Periodicity::After { schedule_idx: target, .. } = schedule.periodicity {
                if target >= schedules.len() {
                    return Err(RunnerError::UnknownChain {
                        schedule_idx,
                        target,
                    });
                }
            }
            let task_idx = registry.get(&schedule.task_id).copied().ok_or(
                RunnerError::UnknownTask {
                    schedule_idx,
                    task_id: schedule.task_id,
                },
            )?;
            bound.push(task_idx);
        }

        info!(
            schedules = schedules.len(),
            tasks = tasks.len(),
            "task runner initialised"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            states: vec![TaskScheduleState::default(); schedules.len()],
            data: tasks.iter().map(|_| TaskData::default()).collect(),
            schedules,
            bound,
            tasks,
            registry,
            workqueue,
            events,
        })
    }

    pub fn schedules(&self) -> &[TaskSchedule] {
        &self.schedules
    }

    pub fn schedule_state(&self, schedule_idx: usize) -> Option<&TaskScheduleState> {
        self.states.get(schedule_idx)
    }

    /// Schedule index the task is currently running for.
    pub fn running_schedule(&self, task_id: u8) -> Option<usize> {
        let data = &self.data[*self.registry.get(&task_id)?];
        data.running.then_some(data.schedule_idx)
    }

    pub fn is_running(&self, task_id: u8) -> bool {
        self.running_schedule(task_id).is_some()
    }

    /// Tasks started and not yet reaped.
    pub fn running_count(&self) -> usize {
        self.data.iter().filter(|d| d.running).count()
    }

    pub fn workqueue(&self) -> &WorkQueue {
        &self.workqueue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.events.subscribe()
    }

    /// One runner tick.
    ///
    /// Reaps finished tasks first so that an AFTER chain can start its
    /// successor in the same tick the predecessor is observed complete.
    pub fn iterate(&mut self, inputs: &ScheduleInputs) {
        self.reap(inputs.uptime);

        for schedule_idx in 0..self.schedules.len() {
            let task_idx = self.bound[schedule_idx];
            let data = &self.data[task_idx];

            if data.running && data.schedule_idx != schedule_idx {
                debug!(
                    schedule = schedule_idx,
                    owner = data.schedule_idx,
                    "task running for another schedule"
                );
                continue;
            }
            let running = data.running;
            let schedule = &self.schedules[schedule_idx];

            if schedule.validity == Validity::PermanentlyRuns {
                if !running {
                    self.start(schedule_idx, inputs.uptime);
                }
                let state = &mut self.states[schedule_idx];
                state.runtime = state.runtime.saturating_add(1);
                continue;
            }

            if running {
                let state = &mut self.states[schedule_idx];
                state.runtime = state.runtime.saturating_add(1);
                if should_terminate(schedule, state, inputs) {
                    self.terminate(schedule_idx);
                }
            } else {
                let after = match schedule.periodicity {
                    Periodicity::After { schedule_idx, .. } => self.states.get(schedule_idx),
                    _ => None,
                };
                if should_start(schedule, &self.states[schedule_idx], after, inputs) {
                    self.start(schedule_idx, inputs.uptime);
                }
            }
        }
    }

    /// Request termination of every running task.
    pub fn terminate_all(&mut self) {
        for task_idx in 0..self.tasks.len() {
            if self.data[task_idx].running {
                let schedule_idx = self.data[task_idx].schedule_idx;
                self.terminate(schedule_idx);
            }
        }
    }

    /// Collect finished runs without evaluating any schedule.
    ///
    /// Used while shutting down, after [`Self::terminate_all`].
    pub fn reap(&mut self, uptime: u32) {
        for (task_idx, data) in self.data.iter_mut().enumerate() {
            if !data.running || !data.done.load(Ordering::Acquire) {
                continue;
            }
            data.running = false;
            self.states[data.schedule_idx].last_terminate = uptime;
            debug!(
                task = %self.tasks[task_idx].name,
                schedule = data.schedule_idx,
                uptime,
                "task terminated"
            );
            let _ = self.events.send(ScheduleEvent {
                schedule_idx: data.schedule_idx,
                task_id: self.tasks[task_idx].task_id,
                kind: ScheduleEventKind::Stopped,
            });
        }
    }

    fn start(&mut self, schedule_idx: usize, uptime: u32) {
        let task_idx = self.bound[schedule_idx];
        let config = &self.tasks[task_idx];

        let state = &mut self.states[schedule_idx];
        state.last_run = uptime;
        state.runtime = 0;

        // Fresh signal per run so a stale cancellation cannot leak forward
        let terminate = CancellationToken::new();
        let done = Arc::new(AtomicBool::new(false));
        self.data[task_idx] = TaskData {
            running: true,
            schedule_idx,
            terminate: terminate.clone(),
            done: done.clone(),
        };

        let ctx = TaskContext {
            schedule: self.schedules[schedule_idx].clone(),
            schedule_idx,
            terminate,
            reschedule_counter: 0,
        };
        let guard = DoneGuard(done);

        info!(task = %config.name, schedule = schedule_idx, uptime, "task started");
        match config.executor {
            ExecutorKind::Workqueue => {
                queue_work(self.workqueue.clone(), config.task.clone(), ctx, guard)
            }
            ExecutorKind::Thread => {
                tokio::spawn(run_thread(config.task.clone(), ctx, guard));
            }
        }

        let _ = self.events.send(ScheduleEvent {
            schedule_idx,
            task_id: config.task_id,
            kind: ScheduleEventKind::Started,
        });
    }

    fn terminate(&mut self, schedule_idx: usize) {
        let task_idx = self.bound[schedule_idx];
        let data = &self.data[task_idx];
        // Only the first request per run is signalled and published
        if data.terminate.is_cancelled() {
            return;
        }
        debug!(
            task = %self.tasks[task_idx].name,
            schedule = schedule_idx,
            "requesting task termination"
        );
        data.terminate.cancel();
        let _ = self.events.send(ScheduleEvent {
            schedule_idx,
            task_id: self.tasks[task_idx].task_id,
            kind: ScheduleEventKind::TerminateRequest,
        });
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("schedules", &self.schedules.len())
            .field("tasks", &self.tasks)
            .field("workqueue", &self.workqueue.name())
            .finish_non_exhaustive()
    }
}

// ── Executors ─────────────────────────────────────────────────────────────────

/// Wait out a reschedule delay, cut short by a termination request.
async fn reschedule_delay(ctx: &TaskContext, delay: Duration) {
    if delay.is_zero() || ctx.is_terminated() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = ctx.terminated() => {}
    }
}

fn queue_work(wq: WorkQueue, task: Arc<dyn Task>, mut ctx: TaskContext, guard: DoneGuard) {
    let next_wq = wq.clone();
    let job = async move {
        match task.run(&ctx).await {
            TaskStatus::Complete => drop(guard),
            TaskStatus::Reschedule(delay) => {
                ctx.reschedule_counter = ctx.reschedule_counter.wrapping_add(1);
                // The delay runs off the queue so other jobs keep flowing
                tokio::spawn(async move {
                    reschedule_delay(&ctx, delay).await;
                    queue_work(next_wq, task, ctx, guard);
                });
            }
        }
    };
    if wq.submit(job).is_err() {
        warn!(queue = %wq.name(), "work queue closed, task dropped");
    }
}

async fn run_thread(task: Arc<dyn Task>, mut ctx: TaskContext, _guard: DoneGuard) {
    loop {
        match task.run(&ctx).await {
            TaskStatus::Complete => return,
            TaskStatus::Reschedule(delay) => {
                ctx.reschedule_counter = ctx.reschedule_counter.wrapping_add(1);
                reschedule_delay(&ctx, delay).await;
            }
        }
    }
}

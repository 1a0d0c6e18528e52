//! Errors raised while building a [`TaskRunner`](super::TaskRunner).

use thiserror::Error;

use crate::errno;
use crate::task::ScheduleError;

/// Why the runner refused a schedule table or task list.
///
/// All variants are configuration faults and map to `-EINVAL`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("task id {task_id} registered by both '{first}' and '{second}'")]
    DuplicateTaskId {
        task_id: u8,
        first: String,
        second: String,
    },

    #[error("schedule {schedule_idx} references unknown task id {task_id}")]
    UnknownTask { schedule_idx: usize, task_id: u8 },

    #[error("schedule {schedule_idx}: {source}")]
    InvalidSchedule {
        schedule_idx: usize,
        #[source]
        source: ScheduleError,
    },

    #[error("schedule {schedule_idx} runs after schedule {target}, which does not exist")]
    UnknownChain { schedule_idx: usize, target: usize },
}

impl RunnerError {
    pub fn errno(&self) -> i32 {
        -errno::EINVAL
    }
}

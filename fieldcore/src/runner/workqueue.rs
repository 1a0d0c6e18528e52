/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Serial job queue shared by the runner tick and workqueue tasks.
//!
//! One tokio task drains an unbounded channel of boxed futures and awaits
//! each to completion before taking the next, so at most one job runs at a
//! time. A long running job delays everything queued behind it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("work queue has shut down")]
pub struct WorkQueueClosed;

/// Handle to a serial work queue. Cloning shares the same queue.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
}

impl WorkQueue {
    /// Spawn the draining task on the current tokio runtime.
    ///
    /// The queue stops once every handle has been dropped.
    pub fn spawn(name: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let name: Arc<str> = Arc::from(name);
        let queue_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(queue = %queue_name, "work queue drained and closed");
        });
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a job behind everything already submitted.
    pub fn submit<F>(&self, job: F) -> Result<(), WorkQueueClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.send(Box::pin(job)).map_err(|_| WorkQueueClosed)
    }

    /// Queue a job and wait for its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T, WorkQueueClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(async move {
            let _ = done_tx.send(job.await);
        })?;
        done_rx.await.map_err(|_| WorkQueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let wq = WorkQueue::spawn("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            wq.submit(async move {
                order.lock().unwrap().push(i);
            })
            .unwrap();
        }
        // run() queues behind the submitted jobs
        wq.run(async {}).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_blocks_the_queue() {
        let wq = WorkQueue::spawn("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        wq.submit(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            o.lock().unwrap().push("slow");
        })
        .unwrap();

        let o = order.clone();
        let value = wq
            .run(async move {
                o.lock().unwrap().push("fast");
                42
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(*order.lock().unwrap(), vec!["slow", "fast"]);
    }
}

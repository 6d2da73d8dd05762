// Copyright © Verilayer Foundation
// SPDX-License-Identifier: Apache-2.0

//! Timer-driven job scheduler.
//!
//! A single serve task owns a min-heap of `(run_at, task)` pairs and one
//! timer armed to the earliest deadline. Incoming jobs re-arm the timer;
//! when it fires, every job whose deadline has passed runs (errors are
//! logged, not propagated) and recurrent jobs are re-queued one period out.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

type JobTask = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Job {
    run_at: Instant,
    period: Duration,
    recurrent: bool,
    task: JobTask,
}

// The heap only orders by deadline; `BinaryHeap` is a max-heap, so the
// comparison is reversed to pop the earliest deadline first.
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        other.run_at.cmp(&self.run_at)
    }
}

/// Handle for scheduling jobs. Cheap to clone; all clones feed the same
/// serve task.
#[derive(Clone)]
pub struct JobRunner {
    job_tx: mpsc::UnboundedSender<Job>,
    queue: Arc<Mutex<BinaryHeap<Job>>>,
    job_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
}

impl JobRunner {
    pub fn new() -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        Self {
            job_tx,
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            job_rx: Arc::new(tokio::sync::Mutex::new(job_rx)),
        }
    }

    /// Spawns the serve loop under the supervisor. The queue survives a
    /// restart; only the in-flight select is abandoned.
    pub fn start(&self) {
        let runner = self.clone();
        verilayer_supervisor::supervise("job_scheduler", move || {
            let runner = runner.clone();
            async move { runner.serve().await }
        });
    }

    /// Schedules `task` to run every `period`, first at `now + period`.
    pub fn every<F>(&self, period: Duration, task: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.push_job(Job {
            run_at: Instant::now() + period,
            period,
            recurrent: true,
            task: Arc::new(task),
        });
    }

    /// Schedules `task` to run once at `when`.
    pub fn at<F>(&self, when: Instant, task: F)
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.push_job(Job {
            run_at: when,
            period: Duration::ZERO,
            recurrent: false,
            task: Arc::new(task),
        });
    }

    fn push_job(&self, job: Job) {
        if self.job_tx.send(job).is_err() {
            tracing::error!("Job scheduler is gone, dropping job");
        }
    }

    async fn serve(&self) {
        let mut job_rx = self.job_rx.lock().await;
        // There may be expired jobs waiting if the serve loop is being
        // restarted after a panic.
        self.run_expired_jobs().await;
        loop {
            let next_deadline = self.queue.lock().peek().map(|job| job.run_at);
            let deadline =
                next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                incoming = job_rx.recv() => match incoming {
                    Some(job) => {
                        self.queue.lock().push(job);
                        self.run_expired_jobs().await;
                    }
                    // All handles dropped; nothing can ever be scheduled again.
                    None => return,
                },
                _ = tokio::time::sleep_until(deadline), if next_deadline.is_some() => {
                    self.run_expired_jobs().await;
                }
            }
        }
    }

    async fn run_expired_jobs(&self) {
        loop {
            let now = Instant::now();
            let job = {
                let mut queue = self.queue.lock();
                match queue.peek() {
                    Some(job) if job.run_at <= now => queue.pop(),
                    _ => None,
                }
            };
            let Some(mut job) = job else { return };
            if let Err(error) = (job.task)().await {
                tracing::error!(error = ?error, "Scheduled job failed");
            }
            if job.recurrent {
                job.run_at = Instant::now() + job.period;
                self.queue.lock().push(job);
            }
        }
    }
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    fn counting_task(counter: Arc<AtomicU64>) -> impl Fn() -> BoxFuture<'static, anyhow::Result<()>> {
        move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_job_runs_at_deadline() {
        let runner = JobRunner::new();
        runner.start();
        let counter = Arc::new(AtomicU64::new(0));
        runner.at(Instant::now() + Duration::from_secs(5), counting_task(counter.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recurrent_job_reschedules() {
        let runner = JobRunner::new();
        runner.start();
        let counter = Arc::new(AtomicU64::new(0));
        runner.every(Duration::from_secs(10), counting_task(counter.clone()));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_run_in_deadline_order() {
        let runner = JobRunner::new();
        runner.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [("late", 20u64), ("early", 5), ("middle", 10)] {
            let order = order.clone();
            runner.at(Instant::now() + Duration::from_secs(delay), move || {
                let order = order.clone();
                async move {
                    order.lock().push(label);
                    Ok(())
                }
                .boxed()
            });
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*order.lock(), vec!["early", "middle", "late"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_does_not_stop_the_runner() {
        let runner = JobRunner::new();
        runner.start();
        let counter = Arc::new(AtomicU64::new(0));
        runner.every(Duration::from_secs(5), {
            let counter = counter.clone();
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, AtomicOrdering::SeqCst);
                    anyhow::bail!("job failed");
                }
                .boxed()
            }
        });

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 3);
    }
}

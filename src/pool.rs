//! Bounded worker pool and the batch parallel executor.
//!
//! The pool runs a fixed set of workers over a buffered job queue (capacity
//! `2 x workers`). `close()` shuts the queue exactly once, drains remaining
//! results, and joins every worker; cancellation through the shared context
//! makes workers exit without picking up further jobs.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::default_worker_count;
use crate::errors::PipelineError;
use crate::session::RunContext;

/// A queued unit of work with an index for result alignment.
#[derive(Debug)]
pub struct Job<I> {
    pub index: usize,
    pub label: String,
    pub payload: I,
}

impl<I> Job<I> {
    pub fn new(index: usize, label: impl Into<String>, payload: I) -> Self {
        Self {
            index,
            label: label.into(),
            payload,
        }
    }
}

/// A completed job, tagged with the submitting job's index and label.
#[derive(Debug)]
pub struct JobResult<O> {
    pub index: usize,
    pub label: String,
    pub output: O,
}

/// Fixed-size pool of workers applying one handler to submitted jobs.
pub struct WorkerPool<I, O> {
    jobs_tx: Option<mpsc::Sender<Job<I>>>,
    results_rx: mpsc::Receiver<JobResult<O>>,
    handles: Vec<JoinHandle<()>>,
}

impl<I, O> WorkerPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Spawn `workers` tasks (minimum 1) applying `handler` to each job.
    pub fn new<F, Fut>(workers: usize, ctx: &RunContext, handler: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let workers = workers.max(1);
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job<I>>(workers * 2);
        let (results_tx, results_rx) = mpsc::channel::<JobResult<O>>(workers * 2);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let handler = Arc::new(handler);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let jobs_rx = Arc::clone(&jobs_rx);
            let results_tx = results_tx.clone();
            let handler = Arc::clone(&handler);
            let ctx = ctx.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = jobs_rx.lock().await;
                        tokio::select! {
                            _ = ctx.canceled() => None,
                            job = rx.recv() => job,
                        }
                    };
                    let Some(job) = job else {
                        debug!(worker_id, "worker exiting");
                        break;
                    };

                    let Job {
                        index,
                        label,
                        payload,
                    } = job;
                    let output = handler(payload).await;
                    if results_tx
                        .send(JobResult {
                            index,
                            label,
                            output,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }
        // Workers hold the only result senders; the channel closes when the
        // last worker exits.
        drop(results_tx);

        Self {
            jobs_tx: Some(jobs_tx),
            results_rx,
            handles,
        }
    }

    /// Enqueue a job. Fails after `close()`.
    pub async fn submit(&self, job: Job<I>) -> Result<(), PipelineError> {
        let tx = self
            .jobs_tx
            .as_ref()
            .ok_or_else(|| PipelineError::other("worker pool is closed"))?;
        tx.send(job)
            .await
            .map_err(|_| PipelineError::other("worker pool is shutting down"))
    }

    /// A detachable submit handle, usable from a feeder task while the pool
    /// itself drains results. `None` after `close()`.
    pub fn submitter(&self) -> Option<JobSubmitter<I>> {
        self.jobs_tx.as_ref().map(|tx| JobSubmitter {
            jobs_tx: tx.clone(),
        })
    }

    /// Receive the next completed job; `None` once the pool is drained.
    pub async fn next_result(&mut self) -> Option<JobResult<O>> {
        self.results_rx.recv().await
    }

    /// Close the job queue, drain outstanding results, and join all workers.
    /// Idempotent: a second call returns an empty drain immediately.
    pub async fn close(&mut self) -> Vec<JobResult<O>> {
        self.jobs_tx.take();

        let handles = std::mem::take(&mut self.handles);
        let mut drained = Vec::new();
        while let Some(result) = self.results_rx.recv().await {
            drained.push(result);
        }
        for handle in handles {
            handle.await.ok();
        }
        drained
    }
}

/// Cloneable submit handle to a pool's job queue.
///
/// The queue stays open while any submitter is alive; drop all of them (and
/// call `close()` on the pool) to let workers drain and exit.
pub struct JobSubmitter<I> {
    jobs_tx: mpsc::Sender<Job<I>>,
}

impl<I> JobSubmitter<I> {
    pub async fn submit(&self, job: Job<I>) -> Result<(), PipelineError> {
        self.jobs_tx
            .send(job)
            .await
            .map_err(|_| PipelineError::other("worker pool is shutting down"))
    }
}

/// Chooses sequential vs pool-backed execution for a batch of items.
///
/// Small batches (two items or fewer) run sequentially; larger batches go
/// through a [`WorkerPool`]. Results are index-aligned with the input;
/// a slot is `None` only when cancellation prevented the job from running.
pub struct ParallelExecutor {
    workers: usize,
}

impl Default for ParallelExecutor {
    fn default() -> Self {
        Self {
            workers: default_worker_count() * 2,
        }
    }
}

impl ParallelExecutor {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub async fn run_all<I, O, F, Fut>(
        &self,
        ctx: &RunContext,
        items: Vec<I>,
        op: F,
    ) -> Vec<Option<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        if items.len() <= 2 {
            let mut results = Vec::with_capacity(items.len());
            for item in items {
                if ctx.is_canceled() {
                    results.push(None);
                } else {
                    results.push(Some(op(item).await));
                }
            }
            return results;
        }

        let total = items.len();
        let mut pool = WorkerPool::new(self.workers.min(total), ctx, op);

        // Feed from a separate task so draining below provides the
        // backpressure relief both bounded queues need.
        let submitter = pool.submitter().expect("fresh pool has a submitter");
        let feeder = tokio::spawn(async move {
            for (index, item) in items.into_iter().enumerate() {
                let job = Job::new(index, format!("item-{index}"), item);
                if submitter.submit(job).await.is_err() {
                    break;
                }
            }
        });

        let mut results: Vec<Option<O>> = (0..total).map(|_| None).collect();
        let mut received = 0;
        while received < total {
            match pool.next_result().await {
                Some(result) => {
                    results[result.index] = Some(result.output);
                    received += 1;
                }
                None => break,
            }
        }

        feeder.await.ok();
        for result in pool.close().await {
            results[result.index] = Some(result.output);
        }
        results
    }
}

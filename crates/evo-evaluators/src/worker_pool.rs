//! Bounded worker pool for evaluation jobs.
//!
//! A fixed set of workers drains a job channel of capacity `2 × workers`.
//! Each job carries a one-shot reply channel; a broadcast cancellation
//! signal stops workers mid-job and turns queued jobs into cancellation
//! errors instead of stale successes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use evo_core::{EvaluationResult, EvolveError};

/// Work executed by pool workers.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, id: &str, code: &str) -> Result<EvaluationResult, EvolveError>;
}

struct Job {
    id: String,
    code: String,
    reply: oneshot::Sender<Result<EvaluationResult, EvolveError>>,
}

/// Fixed-size pool of evaluation workers.
pub struct WorkerPool {
    jobs_tx: mpsc::Sender<Job>,
    cancel_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Spawn `workers` workers running jobs through `handler`.
    pub fn new(workers: usize, handler: Arc<dyn JobHandler>) -> Self {
        let workers = workers.max(1);
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(workers * 2);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let handles = (0..workers)
            .map(|worker_id| {
                let jobs_rx = Arc::clone(&jobs_rx);
                let mut cancel_rx = cancel_rx.clone();
                let handler = Arc::clone(&handler);

                tokio::spawn(async move {
                    loop {
                        if *cancel_rx.borrow() {
                            debug!(worker = worker_id, "worker exiting");
                            return;
                        }

                        let job = {
                            let mut rx = jobs_rx.lock().await;
                            tokio::select! {
                                job = rx.recv() => job,
                                _ = cancel_rx.changed() => None,
                            }
                        };
                        let Some(job) = job else {
                            debug!(worker = worker_id, "worker exiting");
                            return;
                        };

                        let result = tokio::select! {
                            result = handler.handle(&job.id, &job.code) => result,
                            _ = cancel_rx.changed() => Err(EvolveError::Cancelled),
                        };

                        // Receiver may have given up; the result is
                        // dropped in that case.
                        let _ = job.reply.send(result);
                    }
                })
            })
            .collect();

        Self {
            jobs_tx,
            cancel_tx,
            workers: Mutex::new(handles),
            stopped: AtomicBool::new(false),
        }
    }

    /// Submit a job and wait for its result.
    ///
    /// Fails with `Cancelled` after the pool has stopped. Dropping the
    /// returned future abandons the reply channel and the job's result.
    pub async fn run(&self, id: &str, code: &str) -> Result<EvaluationResult, EvolveError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EvolveError::Cancelled);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            id: id.to_string(),
            code: code.to_string(),
            reply: reply_tx,
        };

        self.jobs_tx
            .send(job)
            .await
            .map_err(|_| EvolveError::Cancelled)?;

        reply_rx.await.map_err(|_| EvolveError::Cancelled)?
    }

    /// Signal cancellation, stop accepting jobs, and wait for all workers
    /// to finish. Queued jobs resolve to cancellation errors when their
    /// reply channels drop.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cancel_tx.send(true);

        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

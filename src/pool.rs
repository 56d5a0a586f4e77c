//! Worker pool
//!
//! A fixed number of workers draining one FIFO queue of submitted jobs.
//! There are no priorities and no per-job cancellation; long-running jobs
//! observe external flags (block pause, engine cancel) to terminate early.
//! Shutdown is graceful: jobs already queued still run before the workers
//! exit.

use crate::error::{DownloadError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default worker count
pub const DEFAULT_POOL_SIZE: usize = 16;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to a submitted job's result
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Wait for the job to finish and return its output. Fails with
    /// `Shutdown` if the pool dropped the job before it could run.
    pub async fn join(self) -> Result<T> {
        self.rx.await.map_err(|_| DownloadError::Shutdown)
    }
}

/// Fixed-size FIFO job executor
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `num_workers` workers (must be called inside a Tokio runtime)
    pub fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel::<Job>();

        // The receiver is shared: each worker takes the lock just long
        // enough to pop the next job, then runs it unlocked. Pop order is
        // the submission order.
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..num_workers)
            .map(|_| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            size: num_workers,
        }
    }

    /// Queue a job. Non-blocking; fails with `Shutdown` once the pool has
    /// been shut down.
    pub fn submit<F, T>(&self, fut: F) -> Result<JobHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = result_tx.send(fut.await);
        });

        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| DownloadError::Shutdown)?,
            None => return Err(DownloadError::Shutdown),
        }
        Ok(JobHandle { rx: result_rx })
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Close the intake, let the workers drain the queue and join them.
    pub async fn shutdown(&self) {
        // Dropping the sender ends the queue after the remaining jobs.
        drop(self.tx.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Close the intake; detached workers drain what is queued and exit.
        drop(self.tx.lock().take());
    }
}

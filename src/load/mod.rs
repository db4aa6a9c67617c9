//! Worker pools which drive a job source as fast as a rate limiter allows.

use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{limiter::RateLimiter, source::JobSource};

/// Runs a named workload: a pool of workers sharing one [JobSource] and one [RateLimiter].
///
/// Each worker loops until stopped:
/// 1. [wait](RateLimiter::wait) for the limiter,
/// 2. [run a job](JobSource::run_job),
/// 3. report the result to the limiter.
///
/// Failed jobs are counted and the worker carries on. There is no backoff, other than what the
/// limiter applies to everyone.
///
/// Dropping the manager stops it.
pub struct LoadManager {
    name: String,
    source: Arc<dyn JobSource>,
    limiter: Arc<RateLimiter>,

    stop: CancellationToken,
    pool: Mutex<Pool>,
}

#[derive(Debug, Default)]
struct Pool {
    workers: Vec<Worker>,
    /// Workers which have been asked to stop, but may still be finishing a job.
    retired: Vec<JoinHandle<()>>,
    next_id: usize,
}

#[derive(Debug)]
struct Worker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl LoadManager {
    /// Spawn `worker_count` workers. Must be called from within a Tokio runtime.
    pub fn start(
        name: impl Into<String>,
        source: Arc<dyn JobSource>,
        worker_count: usize,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let manager = Self {
            name: name.into(),
            source,
            limiter,
            stop: CancellationToken::new(),
            pool: Mutex::new(Pool::default()),
        };
        manager.set_worker_count(worker_count);
        manager
    }

    /// Grow or shrink the pool.
    ///
    /// New workers start immediately. Removed workers finish the job they are running, if any,
    /// then exit.
    pub fn set_worker_count(&self, count: usize) {
        if self.stop.is_cancelled() {
            tracing::warn!(manager = %self.name, count, "not resizing a stopped load manager");
            return;
        }

        let mut pool = self.pool();

        while pool.workers.len() < count {
            let id = format!("{}-{}", self.name, pool.next_id);
            pool.next_id += 1;

            tracing::info!(worker = %id, "spinning up worker");
            let stop = self.stop.child_token();
            let handle = tokio::spawn(work(
                id,
                Arc::clone(&self.source),
                Arc::clone(&self.limiter),
                stop.clone(),
            ));
            pool.workers.push(Worker { stop, handle });
        }

        while pool.workers.len() > count {
            if let Some(worker) = pool.workers.pop() {
                worker.stop.cancel();
                pool.retired.push(worker.handle);
            }
        }
        pool.retired.retain(|handle| !handle.is_finished());
    }

    /// The number of workers currently running.
    pub fn worker_count(&self) -> usize {
        self.pool().workers.len()
    }

    /// The workload name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The limiter every worker waits on.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Stop every worker, then the rate limiter.
    ///
    /// Workers exit at their next suspension point. Idempotent.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            tracing::info!(manager = %self.name, "stopping load manager");
        }
        self.stop.cancel();
        self.limiter.stop();
    }

    /// [Stop](Self::stop), then wait for every worker to exit.
    pub async fn stop_and_join(&self) {
        self.stop();

        let handles: Vec<_> = {
            let mut pool = self.pool();
            let workers = std::mem::take(&mut pool.workers);
            let mut handles = std::mem::take(&mut pool.retired);
            handles.extend(workers.into_iter().map(|worker| worker.handle));
            handles
        };

        for handle in handles {
            if let Err(error) = handle.await {
                tracing::error!(manager = %self.name, %error, "worker failed");
            }
        }
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Pool> {
        self.pool.lock().expect("worker pool lock poisoned")
    }
}

async fn work(
    id: String,
    source: Arc<dyn JobSource>,
    limiter: Arc<RateLimiter>,
    stop: CancellationToken,
) {
    let mut job_id: u64 = 0;
    loop {
        let waited = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            waited = limiter.wait() => waited,
        };
        if waited.is_err() {
            // The limiter has been stopped.
            break;
        }

        tracing::debug!(worker = %id, job_id, "running job");
        let (label, result) = source.run_job().await;
        if let Err(error) = &result {
            tracing::debug!(worker = %id, job_id, %label, %error, "job failed");
        }
        limiter.finish(&label, &result);

        job_id += 1;
    }
    tracing::info!(worker = %id, jobs = job_id, "worker stopped");
}

impl Drop for LoadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Debug for LoadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadManager")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("limiter", &self.limiter)
            .field("workers", &self.worker_count())
            .finish()
    }
}

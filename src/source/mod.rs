//! Where the work comes from.
//!
//! A [JobSource] runs one unit of work per call, and is shared by every worker of a workload.

use std::{fmt::Debug, future::Future};

use async_trait::async_trait;
use thiserror::Error;

mod pager;
mod projects;
mod round_robin;

pub use pager::PagerSource;
pub use projects::{FetcherError, MainBranchProject, Project, ProjectFetcher};
pub use round_robin::RoundRobinSource;

/// A type-erased error from a remote service.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a job failed. Counted by the rate limiter, never fatal.
#[derive(Debug, Error)]
pub enum JobError {
    /// The remote call failed.
    #[error("remote call failed: {0}")]
    Remote(#[source] BoxError),

    /// There was nothing to work on yet, e.g. no items have been prefetched.
    #[error("nothing available to work on")]
    NothingAvailable,
}

impl JobError {
    /// Wrap any error as a remote failure.
    pub fn remote(error: impl Into<BoxError>) -> Self {
        Self::Remote(error.into())
    }
}

/// The outcome of one job: a label to record it under, and whether it succeeded.
pub type JobOutcome = (String, Result<(), JobError>);

/// Runs units of work.
///
/// Called concurrently by many workers, so any cursor state needs its own lock.
#[async_trait]
pub trait JobSource: Debug + Send + Sync {
    /// Run one job to completion.
    async fn run_job(&self) -> JobOutcome;
}

/// One page from a paginated remote collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// The items on this page.
    pub items: Vec<T>,
    /// Where this page sits in the collection.
    pub meta: PageMeta,
}

/// Where a [Page] sits in the remote collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMeta {
    /// The offset which was requested.
    pub offset: usize,
    /// The page size which was requested.
    pub limit: usize,
    /// The size of the whole collection.
    pub total: usize,
}

/// A paginated remote collection.
#[async_trait]
pub trait PagedFetch: Send + Sync {
    /// What a page holds.
    type Item: Send;

    /// Fetch up to `limit` items starting at `offset`.
    async fn fetch(&self, offset: usize, limit: usize) -> Result<Page<Self::Item>, BoxError>;
}

/// Runs a closure as the job.
pub struct FnSource<F> {
    job: F,
}

impl<F, Fut> FnSource<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = JobOutcome> + Send,
{
    /// Run `job` for every job.
    pub fn new(job: F) -> Self {
        Self { job }
    }
}

#[async_trait]
impl<F, Fut> JobSource for FnSource<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = JobOutcome> + Send,
{
    async fn run_job(&self) -> JobOutcome {
        (self.job)().await
    }
}

impl<F> Debug for FnSource<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSource").finish_non_exhaustive()
    }
}

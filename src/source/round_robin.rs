use std::{
    fmt::{self, Debug},
    future::Future,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::metrics::{MetricsSink, NoopMetrics};

use super::{JobError, JobOutcome, JobSource, MainBranchProject, Project, ProjectFetcher};

/// Runs a job for each prefetched item in turn, cycling through the items fetched so far.
///
/// The collection keeps growing while the [ProjectFetcher] runs, so each call picks up whatever
/// has been fetched by then. Until something has been fetched, jobs fail with
/// [JobError::NothingAvailable].
pub struct RoundRobinSource<T, J> {
    name: String,
    fetcher: Arc<ProjectFetcher>,
    len: fn(&ProjectFetcher) -> usize,
    get: fn(&ProjectFetcher, usize) -> T,
    next: Mutex<usize>,
    job: J,
    metrics: Arc<dyn MetricsSink>,
}

impl<J> RoundRobinSource<Project, J> {
    /// Cycle through every project.
    pub fn projects(name: impl Into<String>, fetcher: Arc<ProjectFetcher>, job: J) -> Self {
        Self::over(
            name.into(),
            fetcher,
            ProjectFetcher::projects_len,
            ProjectFetcher::project,
            job,
        )
    }
}

impl<J> RoundRobinSource<MainBranchProject, J> {
    /// Cycle through the projects which have a main branch.
    pub fn main_branch_projects(
        name: impl Into<String>,
        fetcher: Arc<ProjectFetcher>,
        job: J,
    ) -> Self {
        Self::over(
            name.into(),
            fetcher,
            ProjectFetcher::main_branch_projects_len,
            ProjectFetcher::main_branch_project,
            job,
        )
    }
}

impl<T, J> RoundRobinSource<T, J> {
    fn over(
        name: String,
        fetcher: Arc<ProjectFetcher>,
        len: fn(&ProjectFetcher) -> usize,
        get: fn(&ProjectFetcher, usize) -> T,
        job: J,
    ) -> Self {
        Self {
            name,
            fetcher,
            len,
            get,
            next: Mutex::new(0),
            job,
            metrics: NoopMetrics::shared(),
        }
    }

    /// Where index gauges and job results are reported.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn next_item(&self) -> Option<T> {
        let mut next = self.next.lock().expect("round robin lock poisoned");

        let len = (self.len)(&self.fetcher);
        if len == 0 {
            return None;
        }
        if *next >= len {
            *next = 0;
        }

        self.metrics
            .record_gauge(&format!("{}Index", self.name), *next as f64);
        let item = (self.get)(&self.fetcher, *next);
        *next += 1;
        Some(item)
    }
}

#[async_trait]
impl<T, J, Fut> JobSource for RoundRobinSource<T, J>
where
    T: Send + 'static,
    J: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = JobOutcome> + Send,
{
    async fn run_job(&self) -> JobOutcome {
        match self.next_item() {
            Some(item) => (self.job)(item).await,
            None => {
                tracing::debug!(source = %self.name, "nothing fetched yet");
                (self.name.clone(), Err(JobError::NothingAvailable))
            }
        }
    }
}

impl<T, J> Debug for RoundRobinSource<T, J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundRobinSource")
            .field("name", &self.name)
            .field("next", &self.next)
            .field("fetcher", &self.fetcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::source::testing::VecFetch;

    use super::*;

    fn projects(n: usize) -> Vec<Project> {
        (0..n)
            .map(|i| Project {
                id: format!("p{i}"),
                main_branch_id: (i % 2 == 0).then(|| format!("b{i}")),
            })
            .collect()
    }

    fn succeeded(label: String) -> JobOutcome {
        (label, Ok(()))
    }

    async fn fetched(n: usize) -> Arc<ProjectFetcher> {
        let fetcher = ProjectFetcher::new(Arc::new(VecFetch::new(projects(n))), 0, n).start();
        fetcher.finished().await;
        fetcher
    }

    #[tokio::test]
    async fn cycles_through_projects() {
        let source = RoundRobinSource::projects("get project", fetched(3).await, |project: Project| async move {
            succeeded(project.id)
        });

        let mut labels = Vec::new();
        for _ in 0..7 {
            let (label, result) = source.run_job().await;
            assert!(result.is_ok());
            labels.push(label);
        }

        assert_eq!(labels, ["p0", "p1", "p2", "p0", "p1", "p2", "p0"]);
    }

    #[tokio::test]
    async fn cycles_through_main_branch_projects() {
        let source = RoundRobinSource::main_branch_projects(
            "get branch",
            fetched(5).await,
            |project: MainBranchProject| async move { succeeded(project.main_branch_id) },
        );

        let mut labels = Vec::new();
        for _ in 0..4 {
            labels.push(source.run_job().await.0);
        }

        assert_eq!(labels, ["b0", "b2", "b4", "b0"]);
    }

    #[tokio::test]
    async fn nothing_available_before_anything_is_fetched() {
        // Never started.
        let fetcher = Arc::new(ProjectFetcher::new(Arc::new(VecFetch::new(projects(3))), 0, 3));
        let source = RoundRobinSource::projects("get project", fetcher, |project: Project| async move {
            succeeded(project.id)
        });

        let (label, result) = source.run_job().await;

        assert_eq!(label, "get project");
        assert!(matches!(result, Err(JobError::NothingAvailable)));
    }

    #[tokio::test]
    async fn job_errors_are_passed_through() {
        let source = RoundRobinSource::projects("get project", fetched(2).await, |project: Project| async move {
            (format!("get {}", project.id), Err(JobError::remote("timed out")))
        });

        let (label, result) = source.run_job().await;

        assert_eq!(label, "get p0");
        assert!(matches!(result, Err(JobError::Remote(_))));
    }
}

use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::metrics::{MetricsSink, NoopMetrics};

use super::{BoxError, PagedFetch};

/// A project, as listed by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// The project ID.
    pub id: String,
    /// Set if the project has a main branch.
    pub main_branch_id: Option<String>,
}

/// A project known to have a main branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainBranchProject {
    /// The project ID.
    pub project_id: String,
    /// The ID of its main branch.
    pub main_branch_id: String,
}

/// Couldn't create a [ProjectFetcher].
#[derive(Debug, Error)]
pub enum FetcherError {
    /// The remote has no projects to fetch.
    #[error("unable to create project fetcher: no projects found")]
    Empty,

    /// Asking the remote how many projects it has failed.
    #[error("unable to create project fetcher: initial fetch failed: {0}")]
    InitialFetch(#[source] BoxError),
}

/// Prefetches projects in the background, for other sources to pick from.
///
/// Pages are fetched starting from the page containing `start_offset`, wrapping round to the
/// first page at the end of the collection. Fetching stops for good once `limit` projects have
/// been fetched, the whole collection has been covered, or the cursor is back at the starting
/// page.
///
/// Failed fetches are logged and retried after a delay.
pub struct ProjectFetcher {
    fetch: Arc<dyn PagedFetch<Item = Project>>,
    start_offset: usize,
    limit: usize,
    page_size: usize,
    retry_delay: Duration,
    metrics: Arc<dyn MetricsSink>,

    cache: Mutex<Cache>,

    stop: CancellationToken,
    /// Cancelled once the background task has exited.
    done: CancellationToken,
}

#[derive(Debug, Default)]
struct Cache {
    projects: Vec<Project>,
    main_branch_projects: Vec<MainBranchProject>,
}

impl ProjectFetcher {
    const DEFAULT_PAGE_SIZE: usize = 10;
    const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Fetch up to `limit` projects, starting from `start_offset`.
    pub fn new(
        fetch: Arc<dyn PagedFetch<Item = Project>>,
        start_offset: usize,
        limit: usize,
    ) -> Self {
        Self {
            fetch,
            start_offset,
            limit,
            page_size: Self::DEFAULT_PAGE_SIZE,
            retry_delay: Self::DEFAULT_RETRY_DELAY,
            metrics: NoopMetrics::shared(),
            cache: Mutex::new(Cache::default()),
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    /// Fetch up to `limit` projects, starting from a random offset.
    ///
    /// Asks the remote for a single project to learn how many there are.
    pub async fn with_random_start(
        fetch: Arc<dyn PagedFetch<Item = Project>>,
        limit: usize,
    ) -> Result<Self, FetcherError> {
        let page = fetch.fetch(0, 1).await.map_err(FetcherError::InitialFetch)?;

        let total = page.meta.total;
        if total == 0 {
            return Err(FetcherError::Empty);
        }
        let start_offset = rand::thread_rng().gen_range(0..total);

        tracing::info!(total, start_offset, "picked random start for project fetcher");

        Ok(Self::new(fetch, start_offset, limit))
    }

    /// How many projects to request per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be positive");
        self.page_size = page_size;
        self
    }

    /// How long to wait before retrying a failed fetch.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Where fetch results and main-branch discoveries are reported.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Start fetching in the background. Must be called from within a Tokio runtime.
    pub fn start(self) -> Arc<Self> {
        let fetcher = Arc::new(self);
        tokio::spawn(Arc::clone(&fetcher).run());
        fetcher
    }

    /// Stop fetching. Projects fetched so far remain available.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether fetching has finished, for whatever reason.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once fetching has finished.
    pub async fn finished(&self) {
        self.done.cancelled().await;
    }

    /// How many projects have been fetched so far.
    pub fn projects_len(&self) -> usize {
        self.cache().projects.len()
    }

    /// How many of the fetched projects have a main branch.
    pub fn main_branch_projects_len(&self) -> usize {
        self.cache().main_branch_projects.len()
    }

    /// # Panics
    ///
    /// If `index` is out of range.
    pub fn project(&self, index: usize) -> Project {
        let cache = self.cache();
        match cache.projects.get(index) {
            Some(project) => project.clone(),
            None => panic!(
                "invalid index {index}, projects length {}",
                cache.projects.len()
            ),
        }
    }

    /// # Panics
    ///
    /// If `index` is out of range.
    pub fn main_branch_project(&self, index: usize) -> MainBranchProject {
        let cache = self.cache();
        match cache.main_branch_projects.get(index) {
            Some(project) => project.clone(),
            None => panic!(
                "invalid index {index}, main branch projects length {}",
                cache.main_branch_projects.len()
            ),
        }
    }

    async fn run(self: Arc<Self>) {
        let _done = self.done.clone().drop_guard();

        let start_page = self.start_offset / self.page_size;
        let mut page = start_page;
        let mut fetched = 0;

        while fetched < self.limit {
            self.metrics.record_gauge("projectPage", page as f64);
            let offset = page * self.page_size;
            tracing::info!(offset, page_size = self.page_size, "fetching projects");

            let result = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                result = self.fetch.fetch(offset, self.page_size) => result,
            };
            let projects = match result {
                Ok(projects) => projects,
                Err(error) => {
                    tracing::error!(offset, %error, "unable to fetch projects");
                    self.metrics.record_event("get projects", true);
                    tokio::select! {
                        biased;
                        _ = self.stop.cancelled() => break,
                        _ = sleep(self.retry_delay) => continue,
                    }
                }
            };
            self.metrics.record_event("get projects", false);
            tracing::debug!(meta = ?projects.meta, "fetched projects");

            let total = projects.meta.total;
            fetched += projects.items.len();
            self.store(projects.items);

            if fetched >= total {
                break;
            }
            page += 1;
            if page * self.page_size >= total {
                page = 0;
            }
            if page == start_page {
                break;
            }
        }

        tracing::info!(fetched, stopped = self.stop.is_cancelled(), "finished fetching projects");
    }

    fn store(&self, projects: Vec<Project>) {
        let mut cache = self.cache();
        for project in projects {
            match &project.main_branch_id {
                Some(main_branch_id) => {
                    self.metrics.record_event("found main-branch", false);
                    cache.main_branch_projects.push(MainBranchProject {
                        project_id: project.id.clone(),
                        main_branch_id: main_branch_id.clone(),
                    });
                }
                None => self.metrics.record_event("missing main-branch", false),
            }
            cache.projects.push(project);
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, Cache> {
        self.cache.lock().expect("project cache lock poisoned")
    }
}

impl Debug for ProjectFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectFetcher")
            .field("start_offset", &self.start_offset)
            .field("limit", &self.limit)
            .field("page_size", &self.page_size)
            .field("projects", &self.projects_len())
            .field("main_branch_projects", &self.main_branch_projects_len())
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use crate::{assert_elapsed, metrics::testing::RecordingMetrics, source::testing::VecFetch};

    use super::*;

    fn projects(n: usize) -> Vec<Project> {
        (0..n)
            .map(|i| Project {
                id: format!("p{i}"),
                main_branch_id: (i % 3 == 0).then(|| format!("b{i}")),
            })
            .collect()
    }

    #[tokio::test]
    async fn stops_after_covering_a_small_collection() {
        let fetch = Arc::new(VecFetch::new(projects(25)));
        let fetcher = ProjectFetcher::new(fetch.clone(), 0, 100).start();

        fetcher.finished().await;

        assert!(fetcher.is_done());
        assert_eq!(fetch.requests(), vec![(0, 10), (10, 10), (20, 10)]);
        assert_eq!(fetcher.projects_len(), 25);
        assert_eq!(fetch.calls(), 3, "no fetches after covering the total");
    }

    #[tokio::test]
    async fn wraps_round_to_the_first_page() {
        let fetch = Arc::new(VecFetch::new(projects(25)));
        let fetcher = ProjectFetcher::new(fetch.clone(), 15, 100).start();

        fetcher.finished().await;

        assert_eq!(fetch.requests(), vec![(10, 10), (20, 10), (0, 10)]);
        assert_eq!(fetcher.project(0).id, "p10");
        assert_eq!(fetcher.project(15).id, "p0");
    }

    #[tokio::test]
    async fn stops_at_the_limit() {
        let fetch = Arc::new(VecFetch::new(projects(100)));
        let fetcher = ProjectFetcher::new(fetch.clone(), 0, 20).start();

        fetcher.finished().await;

        assert_eq!(fetch.requests(), vec![(0, 10), (10, 10)]);
        assert_eq!(fetcher.projects_len(), 20);
    }

    #[tokio::test]
    async fn starts_from_a_partial_last_page() {
        let fetch = Arc::new(VecFetch::new(projects(25)));
        let fetcher = ProjectFetcher::new(fetch.clone(), 22, 100)
            .with_page_size(5)
            .start();

        fetcher.finished().await;

        assert_eq!(fetch.requests().len(), 5);
        assert_eq!(fetch.requests()[0], (20, 5));
        assert_eq!(fetch.requests()[1], (0, 5));
        assert_eq!(fetcher.projects_len(), 25);
    }

    #[tokio::test]
    async fn splits_out_main_branch_projects() {
        let metrics = Arc::new(RecordingMetrics::default());
        let fetcher = ProjectFetcher::new(Arc::new(VecFetch::new(projects(10))), 0, 10)
            .with_metrics(metrics.clone())
            .start();

        fetcher.finished().await;

        assert_eq!(fetcher.projects_len(), 10);
        assert_eq!(fetcher.main_branch_projects_len(), 4);
        assert_eq!(
            fetcher.main_branch_project(1),
            MainBranchProject {
                project_id: "p3".to_string(),
                main_branch_id: "b3".to_string(),
            }
        );
        assert_eq!(metrics.events("found main-branch", false), 4);
        assert_eq!(metrics.events("missing main-branch", false), 6);
        assert_eq!(metrics.gauge("projectPage"), Some(0.));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_failed_fetches() {
        let metrics = Arc::new(RecordingMetrics::default());
        let fetch = Arc::new(VecFetch::new(projects(5)).failing_on([0, 1]));
        let fetcher = ProjectFetcher::new(fetch.clone(), 0, 100)
            .with_metrics(metrics.clone())
            .start();

        let start = Instant::now();
        fetcher.finished().await;

        assert_elapsed!(start, Duration::from_secs(2), Duration::from_millis(10));
        assert_eq!(fetch.calls(), 3);
        assert_eq!(fetcher.projects_len(), 5);
        assert_eq!(metrics.events("get projects", true), 2);
        assert_eq!(metrics.events("get projects", false), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_retrying() {
        let fetch = Arc::new(VecFetch::new(projects(5)).failing_on(0..1000));
        let fetcher = ProjectFetcher::new(fetch.clone(), 0, 100)
            .with_retry_delay(Duration::from_secs(60))
            .start();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!fetcher.is_done());

        fetcher.stop();
        fetcher.finished().await;

        assert!(fetcher.is_done());
        assert_eq!(fetch.calls(), 1);
        assert_eq!(fetcher.projects_len(), 0);
    }

    #[tokio::test]
    async fn random_start_is_within_the_collection() {
        let fetch = Arc::new(VecFetch::new(projects(50)));

        let fetcher = ProjectFetcher::with_random_start(fetch.clone(), 10)
            .await
            .unwrap();

        assert!(fetcher.start_offset < 50);
        assert_eq!(fetch.requests(), vec![(0, 1)]);
    }

    #[tokio::test]
    async fn random_start_needs_projects() {
        let empty = Arc::new(VecFetch::new(projects(0)));
        let result = ProjectFetcher::with_random_start(empty, 10).await;
        assert!(matches!(result, Err(FetcherError::Empty)));

        let failing = Arc::new(VecFetch::new(projects(5)).failing_on([0]));
        let result = ProjectFetcher::with_random_start(failing, 10).await;
        assert!(matches!(result, Err(FetcherError::InitialFetch(_))));
    }

    #[tokio::test]
    #[should_panic(expected = "invalid index 3, projects length 0")]
    async fn out_of_range_index_panics() {
        let fetcher = ProjectFetcher::new(Arc::new(VecFetch::new(projects(5))), 0, 5);

        fetcher.project(3);
    }
}

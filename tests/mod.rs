use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use rand::{rngs::SmallRng, Rng, SeedableRng};

use loadgen::{
    source::{MainBranchProject, Project},
    BoxError, ErrorFractionThreshold, JobError, JobOutcome, JobSource, LoadManager, MetricsSink,
    Page, PageMeta, PagedFetch, ProjectFetcher, RateFunction, RateLimiter, RoundRobinSource,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A server which fails every request while overloaded.
#[derive(Debug)]
struct Server {
    overloaded: AtomicBool,
    rng: Mutex<SmallRng>,
}

impl Server {
    fn new(seed: u64) -> Self {
        Self {
            overloaded: AtomicBool::new(false),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    fn set_overloaded(&self, overloaded: bool) {
        self.overloaded.store(overloaded, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobSource for Server {
    async fn run_job(&self) -> JobOutcome {
        let latency = Duration::from_millis(self.rng.lock().unwrap().gen_range(5..50));
        tokio::time::sleep(latency).await;

        let result = if self.overloaded.load(Ordering::SeqCst) {
            Err(JobError::remote("503 Service Unavailable"))
        } else {
            Ok(())
        };
        ("request".to_string(), result)
    }
}

/// Projects `p0..pN`, where every other one has a main branch.
#[derive(Debug)]
struct Projects {
    count: usize,
}

#[async_trait]
impl PagedFetch for Projects {
    type Item = Project;

    async fn fetch(&self, offset: usize, limit: usize) -> Result<Page<Project>, BoxError> {
        tokio::time::sleep(Duration::from_millis(20)).await;

        let items = (offset..(offset + limit).min(self.count))
            .map(|i| Project {
                id: format!("p{i}"),
                main_branch_id: (i % 2 == 0).then(|| format!("b{i}")),
            })
            .collect();
        Ok(Page {
            items,
            meta: PageMeta {
                offset,
                limit,
                total: self.count,
            },
        })
    }
}

#[derive(Debug, Default)]
struct Events {
    counts: Mutex<HashMap<(String, bool), u64>>,
}

impl Events {
    fn count(&self, event_type: &str, is_error: bool) -> u64 {
        let counts = self.counts.lock().unwrap();
        counts
            .get(&(event_type.to_string(), is_error))
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for Events {
    fn record_event(&self, event_type: &str, is_error: bool) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry((event_type.to_string(), is_error)).or_default() += 1;
    }
    fn record_gauge(&self, _event_type: &str, _value: f64) {}
    fn record_named_gauge(&self, _event_type: &str, _name: &str, _value: f64) {}
    fn record_duration(&self, _event_type: &str, _duration: Duration) {}
}

/// Precondition: time has been paused.
#[tokio::test(start_paused = true)]
async fn backs_off_under_errors_then_recovers() {
    init_tracing();

    let seed = rand::random();
    println!("Seed: {seed}");

    let server = Arc::new(Server::new(seed));
    let limiter = RateLimiter::builder("flaky", RateFunction::constant(50.))
        .with_rate_change_period(Duration::from_secs(1))
        .with_measurement_window(Duration::from_secs(5))
        .with_adjuster(ErrorFractionThreshold {
            min_rate: 1.,
            max_rate: 100.,
            ..Default::default()
        })
        .start();
    let manager = LoadManager::start("flaky", server.clone(), 10, Arc::clone(&limiter));

    server.set_overloaded(true);
    tokio::time::sleep(Duration::from_millis(10_500)).await;

    let state = limiter.state();
    println!("{state:#?}");
    assert!(
        (state.limit() - 1.).abs() < 1e-9,
        "backed off to the minimum, limit = {}",
        state.limit()
    );
    assert_eq!(state.base_limit(), 50.);
    assert_eq!(state.successes(), 0);

    server.set_overloaded(false);
    tokio::time::sleep(Duration::from_secs(30)).await;

    let state = limiter.state();
    println!("{state:#?}");
    assert!(state.limit() > 2., "climbing back, limit = {}", state.limit());
    assert_eq!(state.errors_in_window(), 0);

    manager.stop_and_join().await;
    limiter.terminated().await;
}

#[tokio::test(start_paused = true)]
async fn works_through_prefetched_projects() {
    init_tracing();

    let events = Arc::new(Events::default());

    let fetcher = ProjectFetcher::new(Arc::new(Projects { count: 40 }), 0, 100)
        .with_metrics(events.clone())
        .start();

    let source = RoundRobinSource::main_branch_projects(
        "get issues",
        Arc::clone(&fetcher),
        |project: MainBranchProject| async move {
            let outcome: JobOutcome = (format!("get issues {}", project.project_id), Ok(()));
            outcome
        },
    )
    .with_metrics(events.clone());

    let limiter = RateLimiter::builder("issues", RateFunction::constant(10.))
        .with_metrics(events.clone())
        .start();
    let manager = LoadManager::start("issues", Arc::new(source), 2, limiter);

    fetcher.finished().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    manager.stop_and_join().await;

    assert_eq!(fetcher.projects_len(), 40);
    assert_eq!(fetcher.main_branch_projects_len(), 20);
    assert_eq!(events.count("found main-branch", false), 20);
    assert_eq!(events.count("get projects", false), 4);

    // Jobs start before the first page arrives, with nothing to work on yet.
    assert!(events.count("get issues", true) > 0);
    assert!(events.count("get issues p0", false) > 0);
    assert!(events.count("get issues p38", false) > 0);
    assert_eq!(events.count("get issues p1", false), 0);
}

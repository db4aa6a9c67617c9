use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::metrics::{MetricsSink, NoopMetrics};

use super::{JobError, JobOutcome, JobSource, PagedFetch};

/// Walks a paginated collection one page per job, cycling back to the start.
///
/// Each job fetches the next page. Once a page starts at or beyond the collection's total, the
/// cursor resets to the first page.
///
/// Safe to share between workers: each page is claimed by exactly one job per cycle, however many
/// jobs overrun the end of the collection before the reset.
pub struct PagerSource<F> {
    name: String,
    fetch: F,
    page_size: usize,
    cursor: Mutex<Cursor>,
    metrics: Arc<dyn MetricsSink>,
}

#[derive(Debug)]
struct Cursor {
    /// Passes through the collection so far.
    cycle: u64,
    page: usize,
}

impl<F: PagedFetch> PagerSource<F> {
    /// Start at the page containing `start_offset`.
    pub fn new(name: impl Into<String>, fetch: F, start_offset: usize, page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be positive");
        Self {
            name: name.into(),
            fetch,
            page_size,
            cursor: Mutex::new(Cursor {
                cycle: 0,
                page: start_offset / page_size,
            }),
            metrics: NoopMetrics::shared(),
        }
    }

    /// Where page gauges and reset events are reported.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Claim the next page, returning it with the cycle it belongs to.
    fn next_page(&self) -> (u64, usize) {
        let mut cursor = self.cursor();
        let claimed = (cursor.cycle, cursor.page);
        cursor.page += 1;
        claimed
    }

    /// Back to the first page, unless another job already started a new cycle.
    fn reset_page(&self, cycle: u64) -> bool {
        let mut cursor = self.cursor();
        if cursor.cycle != cycle {
            return false;
        }
        cursor.cycle += 1;
        cursor.page = 0;
        true
    }

    fn cursor(&self) -> std::sync::MutexGuard<'_, Cursor> {
        self.cursor.lock().expect("pager lock poisoned")
    }
}

#[async_trait]
impl<F: PagedFetch> JobSource for PagerSource<F> {
    async fn run_job(&self) -> JobOutcome {
        let (cycle, page) = self.next_page();
        self.metrics
            .record_gauge(&format!("{}Page", self.name), page as f64);

        let offset = page * self.page_size;
        let result = match self.fetch.fetch(offset, self.page_size).await {
            Ok(fetched) => {
                let total = fetched.meta.total;
                self.metrics
                    .record_gauge(&format!("{}Total", self.name), total as f64);
                if offset >= total && self.reset_page(cycle) {
                    tracing::debug!(pager = %self.name, offset, total, "resetting to first page");
                    self.metrics
                        .record_event(&format!("{}ResetPage", self.name), false);
                }
                Ok(())
            }
            Err(error) => Err(JobError::Remote(error)),
        };

        (self.name.clone(), result)
    }
}

impl<F> Debug for PagerSource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagerSource")
            .field("name", &self.name)
            .field("page_size", &self.page_size)
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

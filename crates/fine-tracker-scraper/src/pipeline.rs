//! The refresh pipeline: walk pages, expand rows, upsert records.
//!
//! Failure handling is deliberately lopsided. A row that cannot be expanded
//! or lacks an external id is skipped and counted; a page that cannot be
//! loaded is retried and then degrades the run to partial success; a storage
//! failure aborts the run carrying the number of rows already upserted,
//! because those writes are durable either way.

use std::collections::HashSet;

use fine_tracker_core::build_record;
use fine_tracker_store_sqlite::SqliteFineStore;
use tracing::{debug, info, warn};

use crate::{ListingSession, ScrapeConfig, ScrapeError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("storage failure after {upserted} upserts")]
    Storage {
        upserted: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingExternalId,
    ExpandFailed,
    DuplicateId,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
pub struct RowSkip {
    pub page: usize,
    pub row: usize,
    pub reason: SkipReason,
}

/// Outcome of one refresh run, printable as JSON.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, Eq, PartialEq)]
pub struct RunReport {
    pub pages_completed: usize,
    pub rows_seen: usize,
    pub rows_upserted: usize,
    pub rows_skipped: usize,
    pub skips: Vec<RowSkip>,
}

impl RunReport {
    fn skip(&mut self, page: usize, row: usize, reason: SkipReason) {
        self.rows_skipped += 1;
        self.skips.push(RowSkip { page, row, reason });
    }
}

/// Runs one bounded refresh over the listing.
///
/// Pages are processed strictly in order; rows within a page strictly in
/// order. Re-running against the same data is a no-op apart from advancing
/// `ingested_at`, since every row is an upsert keyed by external id.
///
/// # Errors
/// Returns [`PipelineError::Scrape`] when the listing never becomes
/// readable, and [`PipelineError::Storage`] when a write fails; the latter
/// carries how many rows were already upserted.
pub async fn run_refresh<S: ListingSession + Send>(
    session: &mut S,
    store: &SqliteFineStore,
    config: &ScrapeConfig,
) -> Result<RunReport, PipelineError> {
    open_with_retry(session, config).await?;

    let mut report = RunReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut page = 0_usize;

    loop {
        // The banner can reappear on any redraw, so check at each page start.
        if let Err(err) = session.dismiss_consent(&config.consent_triggers).await {
            warn!(page, error = %err, "consent check failed, continuing");
        }

        let rows = session.row_count().await.map_err(PipelineError::Scrape)?;
        if rows == 0 {
            break;
        }
        debug!(page, rows, "processing listing page");

        for row in 0..rows {
            report.rows_seen += 1;

            let pairs = match session.expand_row(row).await {
                Ok(pairs) => pairs,
                Err(err) => {
                    warn!(page, row, error = %err, "row expansion failed");
                    report.skip(page, row, SkipReason::ExpandFailed);
                    continue;
                }
            };

            let record = match build_record(&pairs) {
                Ok(record) => record,
                Err(err) => {
                    warn!(page, row, error = %err, "row rejected");
                    report.skip(page, row, SkipReason::MissingExternalId);
                    continue;
                }
            };

            if !seen.insert(record.external_id.clone()) {
                debug!(page, row, external_id = %record.external_id, "duplicate within run");
                report.skip(page, row, SkipReason::DuplicateId);
                continue;
            }

            store
                .upsert_record(&record)
                .map_err(|source| PipelineError::Storage {
                    upserted: report.rows_upserted,
                    source,
                })?;
            report.rows_upserted += 1;
        }

        report.pages_completed += 1;
        page += 1;

        if config.max_pages.is_some_and(|max| page >= max) {
            break;
        }

        match advance_with_retry(session, config).await {
            Ok(true) => tokio::time::sleep(config.politeness_delay).await,
            Ok(false) => break,
            Err(err) => {
                warn!(page, error = %err, "page advance failed, stopping with partial data");
                break;
            }
        }
    }

    info!(
        pages = report.pages_completed,
        upserted = report.rows_upserted,
        skipped = report.rows_skipped,
        "refresh finished"
    );
    Ok(report)
}

async fn open_with_retry<S: ListingSession + Send>(
    session: &mut S,
    config: &ScrapeConfig,
) -> Result<(), ScrapeError> {
    let attempts = config.page_retry_limit.max(1);
    let mut backoff = config.retry_backoff;
    let mut last_err = ScrapeError::Timeout("listing load");

    for attempt in 1..=attempts {
        match session.open_listing().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(attempt, attempts, error = %err, "listing load failed");
                last_err = err;
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_err)
}

async fn advance_with_retry<S: ListingSession + Send>(
    session: &mut S,
    config: &ScrapeConfig,
) -> Result<bool, ScrapeError> {
    let attempts = config.page_retry_limit.max(1);
    let mut backoff = config.retry_backoff;
    let mut last_err = ScrapeError::Timeout("page advance");

    for attempt in 1..=attempts {
        match session.advance_page().await {
            Ok(more) => return Ok(more),
            Err(err) => {
                warn!(attempt, attempts, error = %err, "page advance failed");
                last_err = err;
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn must<T>(result: anyhow::Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_run(result: Result<RunReport, PipelineError>) -> RunReport {
        match result {
            Ok(report) => report,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteFineStore {
        let store = must(SqliteFineStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fast_config() -> ScrapeConfig {
        ScrapeConfig {
            retry_backoff: Duration::from_millis(1),
            politeness_delay: Duration::ZERO,
            ..ScrapeConfig::default()
        }
    }

    fn fine_row(id: &str, amount: &str) -> Vec<(String, String)> {
        vec![
            ("ETid".to_string(), id.to_string()),
            ("Country".to_string(), "Ireland".to_string()),
            ("Date of Decision".to_string(), "2023-05-12".to_string()),
            ("Fine [€]".to_string(), amount.to_string()),
        ]
    }

    struct FakeSession {
        pages: Vec<Vec<Vec<(String, String)>>>,
        current: usize,
        failing_rows: Vec<(usize, usize)>,
        open_failures_left: usize,
        consent_dismissed: bool,
        expanded_before_consent: bool,
    }

    impl FakeSession {
        fn new(pages: Vec<Vec<Vec<(String, String)>>>) -> Self {
            Self {
                pages,
                current: 0,
                failing_rows: Vec::new(),
                open_failures_left: 0,
                consent_dismissed: false,
                expanded_before_consent: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl ListingSession for FakeSession {
        async fn open_listing(&mut self) -> Result<(), ScrapeError> {
            if self.open_failures_left > 0 {
                self.open_failures_left -= 1;
                return Err(ScrapeError::Timeout("listing rows"));
            }
            self.current = 0;
            Ok(())
        }

        async fn dismiss_consent(&mut self, _triggers: &[String]) -> Result<bool, ScrapeError> {
            let first = !self.consent_dismissed;
            self.consent_dismissed = true;
            Ok(first)
        }

        async fn row_count(&mut self) -> Result<usize, ScrapeError> {
            Ok(self.pages.get(self.current).map_or(0, Vec::len))
        }

        async fn expand_row(
            &mut self,
            index: usize,
        ) -> Result<Vec<(String, String)>, ScrapeError> {
            if !self.consent_dismissed {
                self.expanded_before_consent = true;
            }
            if self.failing_rows.contains(&(self.current, index)) {
                return Err(ScrapeError::Timeout("child row"));
            }
            self.pages
                .get(self.current)
                .and_then(|rows| rows.get(index))
                .cloned()
                .ok_or_else(|| ScrapeError::Structure(format!("row {index} not present")))
        }

        async fn advance_page(&mut self) -> Result<bool, ScrapeError> {
            if self.current + 1 < self.pages.len() {
                self.current += 1;
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }

    #[tokio::test]
    async fn row_failures_do_not_stop_the_page() {
        let rows: Vec<Vec<(String, String)>> = (0..10)
            .map(|i| fine_row(&format!("ETid-{i}"), "1000"))
            .collect();
        let mut session = FakeSession::new(vec![rows]);
        session.failing_rows.push((0, 5));
        let store = fixture_store();

        let report = must_run(run_refresh(&mut session, &store, &fast_config()).await);
        assert_eq!(report.rows_seen, 10);
        assert_eq!(report.rows_upserted, 9);
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(report.skips[0].reason, SkipReason::ExpandFailed);
        assert_eq!(report.skips[0].row, 5);
        assert_eq!(must(store.count()), 9);
    }

    #[tokio::test]
    async fn max_pages_bounds_the_walk() {
        let pages = vec![
            vec![fine_row("ETid-1", "100")],
            vec![fine_row("ETid-2", "200")],
            vec![fine_row("ETid-3", "300")],
        ];
        let mut session = FakeSession::new(pages);
        let store = fixture_store();
        let config = ScrapeConfig {
            max_pages: Some(2),
            ..fast_config()
        };

        let report = must_run(run_refresh(&mut session, &store, &config).await);
        assert_eq!(report.pages_completed, 2);
        assert_eq!(report.rows_upserted, 2);
        assert_eq!(must(store.count()), 2);
    }

    #[tokio::test]
    async fn rows_without_an_id_are_counted_and_skipped() {
        let pages = vec![vec![
            fine_row("ETid-1", "100"),
            vec![("Country".to_string(), "Spain".to_string())],
        ]];
        let mut session = FakeSession::new(pages);
        let store = fixture_store();

        let report = must_run(run_refresh(&mut session, &store, &fast_config()).await);
        assert_eq!(report.rows_seen, 2);
        assert_eq!(report.rows_upserted, 1);
        assert_eq!(report.skips[0].reason, SkipReason::MissingExternalId);
    }

    #[tokio::test]
    async fn duplicate_ids_within_a_run_keep_the_first_row() {
        let pages = vec![vec![
            fine_row("ETid-1", "100"),
            fine_row("ETid-1", "999"),
        ]];
        let mut session = FakeSession::new(pages);
        let store = fixture_store();

        let report = must_run(run_refresh(&mut session, &store, &fast_config()).await);
        assert_eq!(report.rows_upserted, 1);
        assert_eq!(report.skips[0].reason, SkipReason::DuplicateId);

        let stored = match must(store.get_record("ETid-1")) {
            Some(record) => record,
            None => panic!("test failure: record missing"),
        };
        assert_eq!(stored.amount_eur, Some(100.0));
    }

    #[tokio::test]
    async fn refresh_is_idempotent_and_last_write_wins() {
        let store = fixture_store();

        let mut first = FakeSession::new(vec![vec![fine_row("ETid-1", "100")]]);
        must_run(run_refresh(&mut first, &store, &fast_config()).await);
        let original = match must(store.get_record("ETid-1")) {
            Some(record) => record,
            None => panic!("test failure: record missing"),
        };

        let mut second = FakeSession::new(vec![vec![fine_row("ETid-1", "2500")]]);
        must_run(run_refresh(&mut second, &store, &fast_config()).await);

        assert_eq!(must(store.count()), 1);
        let updated = match must(store.get_record("ETid-1")) {
            Some(record) => record,
            None => panic!("test failure: record missing"),
        };
        assert_eq!(updated.amount_eur, Some(2500.0));
        assert!(updated.ingested_at > original.ingested_at);
    }

    #[tokio::test]
    async fn a_bounded_rerun_does_not_delete_rows_from_later_pages() {
        let store = fixture_store();
        let pages = vec![
            vec![fine_row("ETid-1", "100")],
            vec![fine_row("ETid-2", "200")],
        ];

        let mut full = FakeSession::new(pages.clone());
        must_run(run_refresh(&mut full, &store, &fast_config()).await);
        assert_eq!(must(store.count()), 2);

        let mut bounded = FakeSession::new(pages);
        let config = ScrapeConfig {
            max_pages: Some(1),
            ..fast_config()
        };
        let report = must_run(run_refresh(&mut bounded, &store, &config).await);
        assert_eq!(report.pages_completed, 1);
        assert_eq!(must(store.count()), 2);
        assert!(must(store.get_record("ETid-2")).is_some());
    }

    #[tokio::test]
    async fn consent_is_dismissed_before_the_first_expansion() {
        let mut session = FakeSession::new(vec![vec![fine_row("ETid-1", "100")]]);
        let store = fixture_store();

        must_run(run_refresh(&mut session, &store, &fast_config()).await);
        assert!(!session.expanded_before_consent);
    }

    #[tokio::test]
    async fn listing_load_retries_then_succeeds() {
        let mut session = FakeSession::new(vec![vec![fine_row("ETid-1", "100")]]);
        session.open_failures_left = 2;
        let store = fixture_store();

        let report = must_run(run_refresh(&mut session, &store, &fast_config()).await);
        assert_eq!(report.rows_upserted, 1);
    }

    #[tokio::test]
    async fn listing_load_exhausting_retries_fails_the_run() {
        let mut session = FakeSession::new(vec![vec![fine_row("ETid-1", "100")]]);
        session.open_failures_left = 10;
        let store = fixture_store();

        let result = run_refresh(&mut session, &store, &fast_config()).await;
        assert!(matches!(result, Err(PipelineError::Scrape(_))));
        assert_eq!(must(store.count()), 0);
    }
}

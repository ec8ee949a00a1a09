//! Headless-browser scrape pipeline for the enforcement fines listing.
//!
//! The listing is a JavaScript-rendered DataTable: rows paginate in place and
//! the interesting fields live in a responsive child row that only exists
//! after clicking the parent. [`session::BrowserSession`] drives a single
//! Chrome page through that dance; [`pipeline::run_refresh`] walks pages and
//! rows strictly in order and upserts each one into the store.

pub mod pipeline;
pub mod session;

use std::time::Duration;

pub use pipeline::{run_refresh, PipelineError, RowSkip, RunReport, SkipReason};
pub use session::{BrowserSession, ListingSession};

const DEFAULT_BASE_URL: &str = "https://www.enforcementtracker.com/";

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("browser error: {0}")]
    Browser(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected page structure: {0}")]
    Structure(String),
}

/// Knobs for one refresh run.
///
/// Consent trigger phrases are configuration rather than code: the banner
/// vendor changes wording without notice and the fix should not need a
/// recompile of the matching logic.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub base_url: String,
    /// Stop after this many pages; `None` walks to the end of the data.
    pub max_pages: Option<usize>,
    /// Rows per page requested from the table's length control.
    pub page_length: usize,
    pub consent_triggers: Vec<String>,
    /// Upper bound on waiting for renders, expansions and page advances.
    pub render_timeout: Duration,
    /// Attempts per page load before giving up on the run.
    pub page_retry_limit: usize,
    /// Base delay between page-load retries, doubled per attempt.
    pub retry_backoff: Duration,
    /// Pause between pages so the source is not hammered.
    pub politeness_delay: Duration,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            max_pages: None,
            page_length: 100,
            consent_triggers: vec![
                "Accept".to_string(),
                "Accept all".to_string(),
                "Allow all".to_string(),
                "OK".to_string(),
            ],
            render_timeout: Duration::from_secs(15),
            page_retry_limit: 3,
            retry_backoff: Duration::from_millis(500),
            politeness_delay: Duration::from_secs(1),
        }
    }
}

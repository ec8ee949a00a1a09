//! Browser-backed access to the paginated listing table.
//!
//! [`ListingSession`] is the seam between the pipeline and the browser: the
//! pipeline only ever opens the listing, counts rows, expands one row at a
//! time and advances pages. [`BrowserSession`] implements that over a single
//! headless Chrome tab via CDP; tests implement it in memory.

use std::time::{Duration, Instant};

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use fine_tracker_core::normalize;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::{ScrapeConfig, ScrapeError};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[async_trait::async_trait]
pub trait ListingSession {
    /// Navigates to the listing and waits until the table has rows.
    async fn open_listing(&mut self) -> Result<(), ScrapeError>;

    /// Clicks the first visible consent control whose text matches one of
    /// `triggers`. Returns whether anything was dismissed.
    async fn dismiss_consent(&mut self, triggers: &[String]) -> Result<bool, ScrapeError>;

    /// Number of data rows on the current page.
    async fn row_count(&mut self) -> Result<usize, ScrapeError>;

    /// Expands row `index` and returns its raw `(label, value)` pairs, main
    /// row and responsive child row combined.
    async fn expand_row(&mut self, index: usize) -> Result<Vec<(String, String)>, ScrapeError>;

    /// Moves to the next page. `Ok(false)` means end of data.
    async fn advance_page(&mut self) -> Result<bool, ScrapeError>;
}

// The listing is a DataTable; all DOM work happens in evaluated snippets so
// one CDP round trip covers each step. Placeholders are substituted before
// evaluation.

const ROW_COUNT_JS: &str = r"
(() => {
  const rows = document.querySelectorAll('table.dataTable tbody tr');
  let count = 0;
  for (const row of rows) {
    if (row.classList.contains('child')) continue;
    if (row.querySelector('td.dataTables_empty')) continue;
    count += 1;
  }
  return count;
})()
";

const CONSENT_JS: &str = r#"
(() => {
  const triggers = __TRIGGERS__;
  const candidates = document.querySelectorAll(
    'button, a, input[type="button"], input[type="submit"]'
  );
  for (const el of candidates) {
    const text = (el.innerText || el.value || '').trim().toLowerCase();
    if (text && triggers.some((t) => t.toLowerCase() === text)) {
      el.click();
      return true;
    }
  }
  return false;
})()
"#;

const SET_PAGE_LENGTH_JS: &str = r#"
(() => {
  const select = document.querySelector(
    'div.dataTables_length select, select[name$="_length"]'
  );
  if (!select) return false;
  const wanted = String(__LENGTH__);
  if (!Array.from(select.options).some((o) => o.value === wanted)) return false;
  if (select.value === wanted) return false;
  select.value = wanted;
  select.dispatchEvent(new Event('change', { bubbles: true }));
  return true;
})()
"#;

const MAIN_ROW_PAIRS_JS: &str = r"
(() => {
  const table = document.querySelector('table.dataTable');
  if (!table) return null;
  const headers = Array.from(table.querySelectorAll('thead th'))
    .map((th) => th.innerText.trim());
  const rows = Array.from(table.querySelectorAll('tbody tr')).filter(
    (row) => !row.classList.contains('child')
      && !row.querySelector('td.dataTables_empty')
  );
  const row = rows[__INDEX__];
  if (!row) return null;
  const pairs = [];
  Array.from(row.cells).forEach((cell, i) => {
    const label = headers[i] || '';
    if (!label) return;
    const link = cell.querySelector('a[href]');
    if (link && label.toLowerCase().includes('source')) {
      pairs.push([label, link.getAttribute('href') || '']);
    } else {
      pairs.push([label, cell.innerText.trim()]);
    }
  });
  return pairs;
})()
";

const EXPAND_CLICK_JS: &str = r"
(() => {
  const rows = Array.from(
    document.querySelectorAll('table.dataTable tbody tr')
  ).filter(
    (row) => !row.classList.contains('child')
      && !row.querySelector('td.dataTables_empty')
  );
  const row = rows[__INDEX__];
  if (!row || !row.cells.length) return 'missing';
  const next = row.nextElementSibling;
  if (next && next.classList.contains('child')) return 'open';
  row.cells[0].click();
  return 'clicked';
})()
";

const CHILD_PAIRS_JS: &str = r"
(() => {
  const rows = Array.from(
    document.querySelectorAll('table.dataTable tbody tr')
  ).filter(
    (row) => !row.classList.contains('child')
      && !row.querySelector('td.dataTables_empty')
  );
  const row = rows[__INDEX__];
  if (!row) return null;
  const child = row.nextElementSibling;
  if (!child || !child.classList.contains('child')) return null;
  const pairs = [];
  child.querySelectorAll('span.dtr-title').forEach((title) => {
    const holder = title.parentElement;
    const data = holder ? holder.querySelector('span.dtr-data') : null;
    if (!data) return;
    pairs.push([title.innerText.trim(), data.innerText.trim()]);
  });
  child.querySelectorAll('a[href]').forEach((link) => {
    const href = link.getAttribute('href') || '';
    if (!href) return;
    pairs.push([href.includes('/etid-') ? 'Direct URL' : 'Source', href]);
  });
  child.innerText.split('\n').forEach((line) => {
    const s = line.trim();
    for (const label of ['Authority', 'Sector', 'Summary']) {
      if (s.startsWith(label)) {
        pairs.push([label, s.slice(label.length).replace(/^[\s:]+/, '')]);
        break;
      }
    }
  });
  return pairs;
})()
";

const FIRST_ROW_TEXT_JS: &str = r"
(() => {
  const rows = document.querySelectorAll('table.dataTable tbody tr');
  for (const row of rows) {
    if (row.classList.contains('child')) continue;
    if (row.querySelector('td.dataTables_empty')) continue;
    return row.innerText;
  }
  return '';
})()
";

const ADVANCE_CLICK_JS: &str = r"
(() => {
  const next = document.querySelector(
    'a.paginate_button.next:not(.disabled), button.paginate_button.next:not(.disabled)'
  );
  if (!next) return false;
  next.click();
  return true;
})()
";

/// One headless Chrome tab pointed at the listing.
///
/// Strictly sequential: there is exactly one page and every operation
/// awaits the previous one, matching how the table mutates in place.
pub struct BrowserSession {
    browser: Browser,
    handler_task: tokio::task::JoinHandle<()>,
    page: Page,
    base_url: String,
    page_length: usize,
    render_timeout: Duration,
}

impl BrowserSession {
    /// Launches a headless browser and opens a blank tab.
    ///
    /// # Errors
    /// Returns [`ScrapeError::Browser`] when Chrome cannot be launched or
    /// the tab cannot be created.
    pub async fn launch(config: &ScrapeConfig) -> Result<Self, ScrapeError> {
        let browser_config = BrowserConfig::builder()
            .build()
            .map_err(ScrapeError::Browser)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|err| ScrapeError::Browser(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| ScrapeError::Browser(err.to_string()))?;

        Ok(Self {
            browser,
            handler_task,
            page,
            base_url: config.base_url.clone(),
            page_length: config.page_length,
            render_timeout: config.render_timeout,
        })
    }

    /// Closes the tab and shuts the browser down.
    pub async fn close(mut self) -> Result<(), ScrapeError> {
        if let Err(err) = self.page.close().await {
            warn!(error = %err, "failed to close listing tab");
        }
        self.browser
            .close()
            .await
            .map_err(|err| ScrapeError::Browser(err.to_string()))?;
        let _ = self.browser.wait().await;
        self.handler_task.abort();
        Ok(())
    }

    async fn eval<T>(&self, js: String, label: &'static str) -> Result<T, ScrapeError>
    where
        T: serde::de::DeserializeOwned,
    {
        let outcome = tokio::time::timeout(self.render_timeout, self.page.evaluate(js))
            .await
            .map_err(|_| ScrapeError::Timeout(label))?
            .map_err(|err| ScrapeError::Browser(err.to_string()))?;

        outcome
            .into_value::<T>()
            .map_err(|err| ScrapeError::Structure(format!("{label}: {err}")))
    }

    async fn wait_for_rows(&self) -> Result<usize, ScrapeError> {
        let deadline = Instant::now() + self.render_timeout;
        loop {
            let count: usize = self.eval(ROW_COUNT_JS.to_string(), "listing rows").await?;
            if count > 0 {
                return Ok(count);
            }
            if Instant::now() >= deadline {
                return Err(ScrapeError::Timeout("listing rows"));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn set_page_length(&self) -> Result<(), ScrapeError> {
        let js = SET_PAGE_LENGTH_JS.replace("__LENGTH__", &self.page_length.to_string());
        let changed: bool = self.eval(js, "page length control").await?;
        if changed {
            debug!(length = self.page_length, "requested page length");
            // The change event triggers a redraw; wait for it to settle.
            self.wait_for_rows().await?;
        }
        Ok(())
    }

    fn absolutize(&self, pairs: Vec<(String, String)>) -> Vec<(String, String)> {
        absolutize_pairs(&self.base_url, pairs)
    }
}

/// The detail panel has no sector column of its own; a sector line is
/// folded into the summary as a `Sector: X.` prefix, or becomes the whole
/// summary when the panel carries no summary text.
fn fold_sector(mut pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut sector: Option<String> = None;
    pairs.retain(|(label, value)| {
        if label.trim().eq_ignore_ascii_case("sector") {
            if sector.is_none() && !value.trim().is_empty() {
                sector = Some(value.trim().to_string());
            }
            false
        } else {
            true
        }
    });

    let Some(sector) = sector else {
        return pairs;
    };

    let prefix = format!("Sector: {sector}. ");
    let existing = pairs.iter_mut().find(|(label, value)| {
        label.trim().eq_ignore_ascii_case("summary") && !value.trim().is_empty()
    });
    match existing {
        Some((_, value)) => *value = format!("{prefix}{value}"),
        None => pairs.push(("Summary".to_string(), prefix.trim_end().to_string())),
    }
    pairs
}

fn absolutize_pairs(base_url: &str, pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    pairs
        .into_iter()
        .map(|(label, value)| {
            let lowered = label.to_lowercase();
            if lowered.contains("url") || lowered.contains("source") {
                let resolved = normalize::absolute_url(base_url, &value).unwrap_or_default();
                (label, resolved)
            } else {
                (label, value)
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl ListingSession for BrowserSession {
    async fn open_listing(&mut self) -> Result<(), ScrapeError> {
        tokio::time::timeout(self.render_timeout, self.page.goto(self.base_url.clone()))
            .await
            .map_err(|_| ScrapeError::Timeout("listing navigation"))?
            .map_err(|err| ScrapeError::Browser(err.to_string()))?;

        self.wait_for_rows().await?;
        self.set_page_length().await?;
        Ok(())
    }

    async fn dismiss_consent(&mut self, triggers: &[String]) -> Result<bool, ScrapeError> {
        let encoded = serde_json::to_string(triggers)
            .map_err(|err| ScrapeError::Structure(format!("consent triggers: {err}")))?;
        let js = CONSENT_JS.replace("__TRIGGERS__", &encoded);
        let dismissed: bool = self.eval(js, "consent banner").await?;
        if dismissed {
            debug!("dismissed consent banner");
        }
        Ok(dismissed)
    }

    async fn row_count(&mut self) -> Result<usize, ScrapeError> {
        self.eval(ROW_COUNT_JS.to_string(), "row count").await
    }

    async fn expand_row(&mut self, index: usize) -> Result<Vec<(String, String)>, ScrapeError> {
        let main_js = MAIN_ROW_PAIRS_JS.replace("__INDEX__", &index.to_string());
        let main: Option<Vec<(String, String)>> = self.eval(main_js, "main row").await?;
        let mut pairs = main
            .ok_or_else(|| ScrapeError::Structure(format!("row {index} not present")))?;

        let click_js = EXPAND_CLICK_JS.replace("__INDEX__", &index.to_string());
        let state: String = self.eval(click_js, "row expand toggle").await?;
        if state == "missing" {
            return Err(ScrapeError::Structure(format!("row {index} has no cells")));
        }

        let child_js = CHILD_PAIRS_JS.replace("__INDEX__", &index.to_string());
        let deadline = Instant::now() + self.render_timeout;
        let child = loop {
            let child: Option<Vec<(String, String)>> =
                self.eval(child_js.clone(), "child row").await?;
            if let Some(found) = child {
                break found;
            }
            if Instant::now() >= deadline {
                return Err(ScrapeError::Timeout("child row"));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        pairs.extend(child);
        Ok(self.absolutize(fold_sector(pairs)))
    }

    async fn advance_page(&mut self) -> Result<bool, ScrapeError> {
        let before: String = self
            .eval(FIRST_ROW_TEXT_JS.to_string(), "first row text")
            .await?;
        let clicked: bool = self
            .eval(ADVANCE_CLICK_JS.to_string(), "next page control")
            .await?;
        if !clicked {
            return Ok(false);
        }

        let deadline = Instant::now() + self.render_timeout;
        loop {
            let after: String = self
                .eval(FIRST_ROW_TEXT_JS.to_string(), "first row text")
                .await?;
            if after.is_empty() {
                // Redraw in flight; keep polling until rows come back.
            } else if after != before {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Err(ScrapeError::Timeout("page advance"));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

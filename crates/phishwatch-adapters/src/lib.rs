//! Feed source contract + the OpenPhish HTML table adapter.

use async_trait::async_trait;
use phishwatch_core::RawRow;
use phishwatch_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "phishwatch-adapters";

pub const OPENPHISH_URL: &str = "https://openphish.com/";

/// CSS selector for the feed's report table.
const FEED_TABLE_SELECTOR: &str = "table.pure-table.pure-table-striped";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Page(String),
}

/// The input collaborator the polling loop drives: fetch the feed and reduce
/// its table body to rows of flat text cells. Errors are retrievable; the
/// caller logs them and tries again next cycle.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_rows(&self, http: &HttpFetcher, run_id: Uuid) -> Result<Vec<RawRow>, FeedError>;
}

/// The public OpenPhish feed page.
#[derive(Debug, Clone)]
pub struct OpenPhishFeed {
    url: String,
}

impl OpenPhishFeed {
    pub fn new() -> Self {
        Self::with_url(OPENPHISH_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for OpenPhishFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedSource for OpenPhishFeed {
    fn source_id(&self) -> &'static str {
        "openphish"
    }

    async fn fetch_rows(&self, http: &HttpFetcher, run_id: Uuid) -> Result<Vec<RawRow>, FeedError> {
        let body = http.fetch_text(run_id, &self.url).await?;
        parse_feed_rows(&body)
    }
}

/// Lift the feed table's body into rows of trimmed cell text.
///
/// Rows are returned in page order, one entry per `<tr>`, each cell one
/// `<td>`. A page without the report table is an error; empty rows are not
/// (the extractor treats them as separators).
pub fn parse_feed_rows(html: &str) -> Result<Vec<RawRow>, FeedError> {
    let document = Html::parse_document(html);
    let table_sel = selector(FEED_TABLE_SELECTOR)?;
    let row_sel = selector("tbody tr")?;
    let cell_sel = selector("td")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Err(FeedError::Page("feed table not found in page".to_string()));
    };

    let mut rows = Vec::new();
    for tr in table.select(&row_sel) {
        let cells = tr
            .select(&cell_sel)
            .map(|td| td.text().collect::<String>().trim().to_string())
            .collect();
        rows.push(RawRow::new(cells));
    }
    Ok(rows)
}

fn selector(input: &str) -> Result<Selector, FeedError> {
    Selector::parse(input).map_err(|err| FeedError::Page(err.to_string()))
}

//! Ingestion pipeline: row extraction, dedup, the polling loop, and the
//! brand frequency report.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use phishwatch_adapters::{FeedSource, OpenPhishFeed, OPENPHISH_URL};
use phishwatch_core::{BrandNormalizer, PhishReport, RawRow};
use phishwatch_storage::{HttpClientConfig, HttpFetcher, ReportStore};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "phishwatch-sync";

/// Time-of-day layout used by the feed's third column.
const FEED_TIME_FORMAT: &str = "%H:%M:%S";

/// The feed reports times three hours ahead of local wall clock; the offset
/// is folded into the recency check rather than applied to the timestamp.
const RECENCY_OFFSET_MINUTES: f64 = 180.0;

/// Exclusive upper bound on offset-adjusted record age, in minutes.
const RECENCY_WINDOW_MINUTES: f64 = 16.0;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub output_path: PathBuf,
    pub feed_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            output_path: PathBuf::from("test2.csv"),
            feed_url: OPENPHISH_URL.to_string(),
            user_agent: "phishwatch/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval_secs: std::env::var("PHISHWATCH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.interval_secs),
            output_path: std::env::var("PHISHWATCH_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            feed_url: std::env::var("PHISHWATCH_FEED_URL").unwrap_or(defaults.feed_url),
            user_agent: std::env::var("PHISHWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("PHISHWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
        }
    }
}

/// Convert feed rows into typed reports, normalizing the brand column and
/// applying the recency window.
///
/// Malformed rows (wrong cell count, empty URL, unparseable time) are logged
/// and skipped so one bad row never discards the batch; zero-cell rows are
/// separators and skipped silently. Output order follows input order.
pub fn extract_candidates(
    rows: &[RawRow],
    now: NaiveDateTime,
    reference_date: NaiveDate,
    brands: &BrandNormalizer,
) -> Vec<PhishReport> {
    let mut candidates = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        if row.is_empty() {
            continue;
        }
        if row.cells.len() != 3 {
            warn!(index, cells = row.cells.len(), "skipping feed row with unexpected cell count");
            continue;
        }

        let url = &row.cells[0];
        if url.is_empty() {
            warn!(index, "skipping feed row with empty URL");
            continue;
        }

        let reported_time = match NaiveTime::parse_from_str(&row.cells[2], FEED_TIME_FORMAT) {
            Ok(time) => time,
            Err(err) => {
                warn!(index, time = %row.cells[2], %err, "skipping feed row with unparseable report time");
                continue;
            }
        };
        let reported_at = reference_date.and_time(reported_time);

        if !within_recency_window(now, reported_at) {
            continue;
        }

        candidates.push(PhishReport {
            url: url.clone(),
            target: brands.normalize(&row.cells[1]),
            reported_at,
        });
    }
    candidates
}

fn within_recency_window(now: NaiveDateTime, reported_at: NaiveDateTime) -> bool {
    let age_minutes = (now - reported_at).num_seconds() as f64 / 60.0;
    age_minutes - RECENCY_OFFSET_MINUTES < RECENCY_WINDOW_MINUTES
}

/// Drop candidates whose URL is already persisted. Repeats within the batch
/// are dropped too; the first occurrence wins. `known_urls` is not touched;
/// the caller merges survivors only after a successful append.
pub fn dedupe_against_known(
    candidates: Vec<PhishReport>,
    known_urls: &HashSet<String>,
) -> Vec<PhishReport> {
    let mut seen_in_batch = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| {
            !known_urls.contains(&candidate.url) && seen_in_batch.insert(candidate.url.clone())
        })
        .collect()
}

/// Attack counts per canonical brand, most-targeted first, truncated to
/// `limit`. Ties keep the order brands were first seen in the record list.
pub fn top_brands(records: &[PhishReport], limit: usize) -> Vec<(String, usize)> {
    let mut first_seen: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for record in records {
        if !counts.contains_key(&record.target) {
            first_seen.push(record.target.clone());
        }
        *counts.entry(record.target.clone()).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = first_seen
        .into_iter()
        .map(|brand| {
            let count = counts[&brand];
            (brand, count)
        })
        .collect();
    // Stable sort: equal counts keep first-seen order.
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked.truncate(limit);
    ranked
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_rows: usize,
    pub extracted: usize,
    pub appended: usize,
}

/// Owns the feed source, the HTTP client, the report store, and the
/// in-memory view of the persisted dataset. The view is mutated only between
/// cycles, never concurrently.
pub struct FeedWatcher {
    config: SyncConfig,
    http: HttpFetcher,
    source: Box<dyn FeedSource>,
    store: ReportStore,
    brands: BrandNormalizer,
    records: Vec<PhishReport>,
    known_urls: HashSet<String>,
}

impl FeedWatcher {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let store = ReportStore::new(config.output_path.clone());
        let source: Box<dyn FeedSource> = Box::new(OpenPhishFeed::with_url(config.feed_url.clone()));
        Ok(Self {
            config,
            http,
            source,
            store,
            brands: BrandNormalizer::new(),
            records: Vec::new(),
            known_urls: HashSet::new(),
        })
    }

    /// Swap the feed source (tests use this to run against canned rows).
    pub fn with_source(mut self, source: Box<dyn FeedSource>) -> Self {
        self.source = source;
        self
    }

    /// Every report persisted so far, in append order.
    pub fn records(&self) -> &[PhishReport] {
        &self.records
    }

    /// Seed the in-memory view from disk. A missing dataset is a first run
    /// and yields an empty view.
    pub fn load_existing(&mut self) -> Result<usize> {
        let loaded = self
            .store
            .load()
            .with_context(|| format!("loading {}", self.store.path().display()))?;
        self.known_urls = loaded.known_urls;
        self.records = loaded.records;
        Ok(self.records.len())
    }

    /// Run one polling cycle: fetch, extract, dedup, persist.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, phishwatch_adapters::FeedError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let rows = self.source.fetch_rows(&self.http, run_id).await?;
        let now = Local::now().naive_local();
        let (extracted, appended) = self.ingest_rows(run_id, &rows, now);

        Ok(CycleSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched_rows: rows.len(),
            extracted,
            appended,
        })
    }

    /// Extract, dedup, and persist one batch of rows against the current
    /// state. Returns (extracted, appended) counts. A store failure is
    /// logged and leaves the state untouched, so the records are retried on
    /// the next cycle.
    fn ingest_rows(&mut self, run_id: Uuid, rows: &[RawRow], now: NaiveDateTime) -> (usize, usize) {
        let candidates = extract_candidates(rows, now, now.date(), &self.brands);
        let extracted = candidates.len();
        let fresh = dedupe_against_known(candidates, &self.known_urls);

        if fresh.is_empty() {
            info!(%run_id, "no new data");
            return (extracted, 0);
        }

        match self.store.append(&fresh) {
            Ok(()) => {
                let appended = fresh.len();
                self.known_urls
                    .extend(fresh.iter().map(|report| report.url.clone()));
                self.records.extend(fresh);
                info!(%run_id, appended, "appended new reports");
                (extracted, appended)
            }
            Err(err) => {
                error!(%run_id, %err, "failed to append reports; will retry next cycle");
                (extracted, 0)
            }
        }
    }

    /// Poll the feed until `shutdown` flips. The interval separates cycle
    /// completion from the next cycle start, and the wait is interruptible;
    /// shutdown is honored only between cycles, never mid-cycle.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let existing = self.load_existing()?;
        info!(
            existing,
            path = %self.store.path().display(),
            source = self.source.source_id(),
            interval_secs = self.config.interval_secs,
            "starting feed watcher"
        );

        let interval = Duration::from_secs(self.config.interval_secs);
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(summary) => debug!(
                    run_id = %summary.run_id,
                    fetched_rows = summary.fetched_rows,
                    extracted = summary.extracted,
                    appended = summary.appended,
                    "cycle complete"
                ),
                Err(err) => warn!(%err, "cycle failed; retrying next interval"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("feed watcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use phishwatch_adapters::FeedError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn row(cells: &[&str]) -> RawRow {
        cells.iter().copied().collect()
    }

    fn fixed_now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(14, 10, 0)
            .unwrap()
    }

    fn watcher_at(dir: &std::path::Path) -> FeedWatcher {
        let config = SyncConfig {
            output_path: dir.join("reports.csv"),
            ..SyncConfig::default()
        };
        FeedWatcher::new(config).expect("watcher")
    }

    #[test]
    fn extraction_normalizes_brands_and_keeps_recent_rows() {
        let rows = vec![row(&["http://evil.example/a", "AT&T Inc.", "14:00:00"])];
        let brands = BrandNormalizer::new();
        let now = fixed_now();

        let candidates = extract_candidates(&rows, now, now.date(), &brands);

        assert_eq!(
            candidates,
            vec![PhishReport {
                url: "http://evil.example/a".to_string(),
                target: "AT&T".to_string(),
                reported_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                    .unwrap()
                    .and_hms_opt(14, 0, 0)
                    .unwrap(),
            }]
        );
    }

    #[test]
    fn recency_window_boundary_is_exclusive() {
        let brands = BrandNormalizer::new();
        let now = fixed_now();

        // Offset-adjusted age of exactly 15 minutes: kept.
        let at_15 = now - ChronoDuration::minutes(195);
        let rows = vec![row(&["http://a", "Google", &at_15.format("%H:%M:%S").to_string()])];
        assert_eq!(extract_candidates(&rows, now, now.date(), &brands).len(), 1);

        // Offset-adjusted age of exactly 16 minutes: dropped.
        let at_16 = now - ChronoDuration::minutes(196);
        let rows = vec![row(&["http://a", "Google", &at_16.format("%H:%M:%S").to_string()])];
        assert!(extract_candidates(&rows, now, now.date(), &brands).is_empty());
    }

    #[test]
    fn malformed_rows_are_skipped_without_discarding_the_batch() {
        let rows = vec![
            row(&[]),
            row(&["http://evil.example/a", "AT&T Inc.", "14:00:00"]),
            row(&["http://evil.example/bad", "Google", "not-a-time"]),
            row(&["", "Google", "14:01:00"]),
            row(&["http://evil.example/short", "Google"]),
            row(&["http://evil.example/b", "Google LLC", "14:05:00"]),
        ];
        let brands = BrandNormalizer::new();
        let now = fixed_now();

        let candidates = extract_candidates(&rows, now, now.date(), &brands);

        let urls: Vec<&str> = candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["http://evil.example/a", "http://evil.example/b"]);
    }

    #[test]
    fn extraction_preserves_input_row_order() {
        let rows = vec![
            row(&["http://c", "Google", "14:02:00"]),
            row(&["http://a", "Google", "14:00:00"]),
            row(&["http://b", "Google", "14:01:00"]),
        ];
        let brands = BrandNormalizer::new();
        let now = fixed_now();

        let urls: Vec<String> = extract_candidates(&rows, now, now.date(), &brands)
            .into_iter()
            .map(|c| c.url)
            .collect();
        assert_eq!(urls, vec!["http://c", "http://a", "http://b"]);
    }

    fn candidate(url: &str) -> PhishReport {
        PhishReport {
            url: url.to_string(),
            target: "Google".to_string(),
            reported_at: fixed_now(),
        }
    }

    #[test]
    fn dedupe_filters_known_and_batch_internal_urls() {
        let known: HashSet<String> = ["http://known".to_string()].into_iter().collect();
        let batch = vec![
            candidate("http://known"),
            candidate("http://fresh"),
            candidate("http://fresh"),
            candidate("http://other"),
        ];

        let fresh = dedupe_against_known(batch, &known);
        let urls: Vec<&str> = fresh.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["http://fresh", "http://other"]);
    }

    #[test]
    fn dedupe_is_idempotent_against_the_same_known_set() {
        let known: HashSet<String> = ["http://known".to_string()].into_iter().collect();
        let batch = vec![candidate("http://known"), candidate("http://fresh")];

        let once = dedupe_against_known(batch, &known);
        let twice = dedupe_against_known(once.clone(), &known);
        assert_eq!(once, twice);
    }

    #[test]
    fn top_brands_ranks_by_count_with_stable_ties() {
        let records = vec![
            candidate_with_target("http://1", "Google"),
            candidate_with_target("http://2", "AT&T"),
            candidate_with_target("http://3", "AT&T"),
            candidate_with_target("http://4", "PayPal"),
            candidate_with_target("http://5", "Netflix"),
            candidate_with_target("http://6", "PayPal"),
        ];

        let ranked = top_brands(&records, 3);
        assert_eq!(
            ranked,
            vec![
                ("AT&T".to_string(), 2),
                ("PayPal".to_string(), 2),
                ("Google".to_string(), 1),
            ]
        );
    }

    #[test]
    fn top_brands_of_an_empty_record_list_is_empty() {
        assert!(top_brands(&[], 3).is_empty());
    }

    fn candidate_with_target(url: &str, target: &str) -> PhishReport {
        PhishReport {
            url: url.to_string(),
            target: target.to_string(),
            reported_at: fixed_now(),
        }
    }

    #[test]
    fn ingest_appends_fresh_reports_and_updates_state() {
        let dir = tempdir().expect("tempdir");
        let mut watcher = watcher_at(dir.path());
        let rows = vec![row(&["http://evil.example/a", "AT&T Inc.", "14:00:00"])];
        let now = fixed_now();

        let (extracted, appended) = watcher.ingest_rows(Uuid::new_v4(), &rows, now);
        assert_eq!((extracted, appended), (1, 1));
        assert_eq!(watcher.records().len(), 1);

        let loaded = ReportStore::new(dir.path().join("reports.csv"))
            .load()
            .expect("load");
        assert_eq!(loaded.records, watcher.records());
    }

    #[test]
    fn a_repeated_url_is_never_persisted_twice_across_cycles() {
        let dir = tempdir().expect("tempdir");
        let mut watcher = watcher_at(dir.path());
        let rows = vec![row(&["http://evil.example/a", "AT&T Inc.", "14:00:00"])];
        let now = fixed_now();

        let (_, first) = watcher.ingest_rows(Uuid::new_v4(), &rows, now);
        let (_, second) = watcher.ingest_rows(Uuid::new_v4(), &rows, now);
        assert_eq!(first, 1);
        assert_eq!(second, 0);

        let loaded = ReportStore::new(dir.path().join("reports.csv"))
            .load()
            .expect("load");
        assert_eq!(loaded.records.len(), 1);
    }

    #[test]
    fn an_empty_feed_leaves_the_store_untouched() {
        let dir = tempdir().expect("tempdir");
        let mut watcher = watcher_at(dir.path());

        let (extracted, appended) = watcher.ingest_rows(Uuid::new_v4(), &[], fixed_now());
        assert_eq!((extracted, appended), (0, 0));
        assert!(!dir.path().join("reports.csv").exists());
    }

    #[test]
    fn loading_seeds_the_duplicate_check_from_disk() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path().join("reports.csv"));
        store
            .append(&[candidate("http://evil.example/a")])
            .expect("seed append");

        let mut watcher = watcher_at(dir.path());
        assert_eq!(watcher.load_existing().expect("load"), 1);

        let rows = vec![row(&["http://evil.example/a", "Google", "14:00:00"])];
        let (_, appended) = watcher.ingest_rows(Uuid::new_v4(), &rows, fixed_now());
        assert_eq!(appended, 0);
    }

    struct CannedFeed {
        cycles: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FeedSource for CannedFeed {
        fn source_id(&self) -> &'static str {
            "canned"
        }

        async fn fetch_rows(
            &self,
            _http: &HttpFetcher,
            _run_id: Uuid,
        ) -> Result<Vec<RawRow>, FeedError> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            let reported = Local::now().naive_local().format("%H:%M:%S").to_string();
            Ok(vec![
                ["http://evil.example/live", "AT&T Inc.", reported.as_str()]
                    .into_iter()
                    .collect(),
            ])
        }
    }

    #[tokio::test]
    async fn the_loop_finishes_its_cycle_and_stops_on_shutdown() {
        let dir = tempdir().expect("tempdir");
        let cycles = Arc::new(AtomicUsize::new(0));
        let config = SyncConfig {
            output_path: dir.path().join("reports.csv"),
            interval_secs: 600,
            ..SyncConfig::default()
        };
        let watcher = FeedWatcher::new(config)
            .expect("watcher")
            .with_source(Box::new(CannedFeed {
                cycles: cycles.clone(),
            }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut watcher = watcher;
            watcher.run(shutdown_rx).await.expect("run");
            watcher
        });

        // Give the first cycle time to complete, then interrupt the wait.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).expect("signal shutdown");

        let watcher = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop promptly")
            .expect("join");

        assert_eq!(cycles.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.records().len(), 1);
        assert_eq!(top_brands(watcher.records(), 3), vec![("AT&T".to_string(), 1)]);
    }
}

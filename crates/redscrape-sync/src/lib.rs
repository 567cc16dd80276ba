//! Collection and persistence pipeline: pull posts from a source, filter them
//! by time window, then hand the normalized table to storage or a local file.

mod export;

use futures_util::StreamExt;
use redscrape_core::{normalize_records, RawRecord, ScraperDefaults, TimeWindow, POST_SCHEMA};
use redscrape_reddit::{PostSource, SourceError};
use redscrape_storage::{import_table, ConnectionManager, ImportOptions, ImportReport, TableName};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use export::{read_records_json, write_parquet_table};

pub const CRATE_NAME: &str = "redscrape-sync";

/// What to collect: which communities, how many posts each, and from when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectRequest {
    pub communities: Vec<String>,
    pub window: TimeWindow,
    /// Maximum posts retained per community.
    pub limit: usize,
}

impl CollectRequest {
    pub fn from_defaults(defaults: &ScraperDefaults) -> Self {
        Self {
            communities: defaults.communities.clone(),
            window: TimeWindow::unbounded(),
            limit: defaults.post_limit,
        }
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommunityOutcome {
    pub community: String,
    pub collected: usize,
    /// Posts newer than the window end.
    pub skipped_newer: usize,
    pub error: Option<String>,
}

impl CommunityOutcome {
    fn new(community: &str) -> Self {
        Self {
            community: community.to_string(),
            collected: 0,
            skipped_newer: 0,
            error: None,
        }
    }
}

/// Records gathered across all requested communities, in request order.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub records: Vec<RawRecord>,
    pub outcomes: Vec<CommunityOutcome>,
}

impl Collection {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CommunityOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }
}

/// Collect newest posts for every requested community.
///
/// A community's stream is abandoned at the first post older than the window
/// start, so later pages are never requested. Source errors are logged and
/// recorded in that community's outcome; the remaining communities still run.
pub async fn collect_posts(source: &dyn PostSource, request: &CollectRequest) -> Collection {
    let mut collection = Collection::default();
    for community in &request.communities {
        let span = info_span!("collect", community = community.as_str());
        let outcome = collect_community(source, community, request, &mut collection.records)
            .instrument(span)
            .await;
        collection.outcomes.push(outcome);
    }
    info!(
        communities = request.communities.len(),
        posts = collection.len(),
        failed = collection.failures().count(),
        "collection finished"
    );
    collection
}

async fn collect_community(
    source: &dyn PostSource,
    community: &str,
    request: &CollectRequest,
    records: &mut Vec<RawRecord>,
) -> CommunityOutcome {
    let mut outcome = CommunityOutcome::new(community);
    if request.limit == 0 {
        return outcome;
    }

    let mut posts = source.new_posts(community);
    while let Some(item) = posts.next().await {
        let post = match item {
            Ok(post) => post,
            Err(err) => {
                match &err {
                    SourceError::NotFound(_) => warn!(community, "subreddit not found"),
                    SourceError::Forbidden(_) => warn!(community, "access to subreddit forbidden"),
                    other => error!(community, error = %other, "error scraping subreddit"),
                }
                outcome.error = Some(err.to_string());
                break;
            }
        };

        if let Some(created) = post.created_at() {
            if request.window.is_before_start(created) {
                debug!(community, post_id = %post.id, "reached posts older than window start");
                break;
            }
            if request.window.is_after_end(created) {
                outcome.skipped_newer += 1;
                continue;
            }
        }

        records.push(post.into_record(community));
        outcome.collected += 1;
        if outcome.collected >= request.limit {
            break;
        }
    }

    info!(
        community,
        collected = outcome.collected,
        skipped_newer = outcome.skipped_newer,
        "collected posts"
    );
    outcome
}

/// Normalize `records` and import them into `table`.
///
/// Returns `None` when the records cannot be normalized or the import cannot
/// start; per-batch failures are reported inside the [`ImportReport`].
pub async fn store_records(
    db: &mut ConnectionManager,
    table: &TableName,
    records: &[RawRecord],
    options: ImportOptions,
) -> Option<ImportReport> {
    let data = match normalize_records(records, &POST_SCHEMA) {
        Ok(data) => data,
        Err(err) => {
            error!(error = %err, "error importing data: records could not be normalized");
            return None;
        }
    };

    match import_table(db, table, &data, options).await {
        Ok(report) => {
            info!(%table, %report, "import finished");
            Some(report)
        }
        Err(err) => {
            error!(%table, error = %err, "error importing data");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use redscrape_core::{DatabaseConfig, SourcePost};
    use redscrape_reddit::FixturePostSource;

    fn post(id: &str, created_utc: i64) -> SourcePost {
        SourcePost {
            id: id.to_string(),
            author: Some("ferris".into()),
            title: format!("post {id}"),
            selftext: String::new(),
            permalink: format!("/r/rust/comments/{id}/"),
            created_utc,
            score: 1,
            num_comments: 0,
        }
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn request(communities: &[&str], window: TimeWindow, limit: usize) -> CollectRequest {
        CollectRequest {
            communities: communities.iter().map(|s| s.to_string()).collect(),
            window,
            limit,
        }
    }

    fn ids(collection: &Collection) -> Vec<&str> {
        collection
            .records
            .iter()
            .filter_map(|r| r["id"].as_str())
            .collect()
    }

    #[tokio::test]
    async fn older_than_start_stops_without_pulling_further() {
        let source = FixturePostSource::default().with_posts(
            "rust",
            vec![post("p100", 100), post("p90", 90), post("p80", 80), post("p70", 70)],
        );
        let window = TimeWindow::between(Some(at(85)), None);
        let collection = collect_posts(&source, &request(&["rust"], window, 10)).await;

        assert_eq!(ids(&collection), vec!["p100", "p90"]);
        // p80 ends the scan; p70 is never requested.
        assert_eq!(source.posts_pulled(), 3);
    }

    #[tokio::test]
    async fn newer_than_end_is_skipped_not_terminal() {
        let source = FixturePostSource::default().with_posts(
            "rust",
            vec![post("p100", 100), post("p90", 90), post("p80", 80)],
        );
        let window = TimeWindow::between(None, Some(at(90)));
        let collection = collect_posts(&source, &request(&["rust"], window, 10)).await;

        assert_eq!(ids(&collection), vec!["p90", "p80"]);
        assert_eq!(collection.outcomes[0].skipped_newer, 1);
    }

    #[tokio::test]
    async fn limit_caps_retained_posts_per_community() {
        let source = FixturePostSource::default()
            .with_posts("rust", (0..5).map(|i| post(&format!("r{i}"), 100 - i)).collect())
            .with_posts("python", (0..5).map(|i| post(&format!("p{i}"), 100 - i)).collect());
        let collection =
            collect_posts(&source, &request(&["rust", "python"], TimeWindow::unbounded(), 2)).await;

        assert_eq!(ids(&collection), vec!["r0", "r1", "p0", "p1"]);
        assert_eq!(source.posts_pulled(), 4);
        assert_eq!(collection.records[2]["subreddit"], "python");

        let none = collect_posts(&source, &request(&["rust"], TimeWindow::unbounded(), 0)).await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn failing_community_does_not_abort_the_rest() {
        let source = FixturePostSource::default()
            .with_forbidden("private")
            .with_posts("rust", vec![post("ok", 50)]);
        let collection = collect_posts(
            &source,
            &request(&["missing", "private", "rust"], TimeWindow::unbounded(), 10),
        )
        .await;

        assert_eq!(ids(&collection), vec!["ok"]);
        let failed: Vec<&str> = collection.failures().map(|o| o.community.as_str()).collect();
        assert_eq!(failed, vec!["missing", "private"]);
        assert!(collection.outcomes[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("not found")));
        assert_eq!(collection.outcomes[2].collected, 1);
    }

    #[test]
    fn request_defaults_come_from_config() {
        let req = CollectRequest::from_defaults(&ScraperDefaults::default())
            .with_window(TimeWindow::last_months(1, at(100 * 86_400)));
        assert_eq!(req.communities, vec!["python", "learnpython"]);
        assert_eq!(req.limit, 10);
        assert_eq!(req.window.start, Some(at(70 * 86_400)));
    }

    #[tokio::test]
    async fn store_records_reports_failures_as_none() {
        let mut db = ConnectionManager::new(&DatabaseConfig {
            host: "localhost".into(),
            port: 5432,
            username: "scraper".into(),
            password: None,
            database: "reddit".into(),
        });
        let table = TableName::posts();

        let missing_key: Vec<RawRecord> = vec![serde_json::json!({"title": "no id"})
            .as_object()
            .cloned()
            .unwrap()];
        assert!(store_records(&mut db, &table, &missing_key, ImportOptions::default())
            .await
            .is_none());

        let valid: Vec<RawRecord> = vec![post("a", 1).into_record("rust")];
        assert!(store_records(&mut db, &table, &valid, ImportOptions::default())
            .await
            .is_none());
    }
}

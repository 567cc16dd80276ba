//! Core data model, column schema and record normalization for redscrape.

pub mod config;
pub mod normalize;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

pub use config::{ConfigError, DatabaseConfig, RedditConfig, ScraperDefaults};
pub use normalize::{normalize_records, NormalizeError, NormalizedTable};

pub const CRATE_NAME: &str = "redscrape-core";

/// Relation that stores collected posts.
pub const POSTS_TABLE: &str = "reddit_posts";

/// Author recorded when the platform no longer exposes one.
pub const DELETED_AUTHOR: &str = "[deleted]";

/// Heterogeneous source record: field name to value.
pub type RawRecord = serde_json::Map<String, JsonValue>;

/// One post as exposed by the platform client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePost {
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    pub title: String,
    #[serde(default)]
    pub selftext: String,
    pub permalink: String,
    /// Seconds since the unix epoch.
    pub created_utc: i64,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: i64,
}

impl SourcePost {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.created_utc, 0)
    }

    pub fn permalink_url(&self) -> String {
        format!("https://reddit.com{}", self.permalink)
    }

    /// Flatten into the raw record shape consumed by the normalizer.
    pub fn into_record(self, community: &str) -> RawRecord {
        let url = self.permalink_url();
        let author = self.author.unwrap_or_else(|| DELETED_AUTHOR.to_string());
        let value = json!({
            "id": self.id,
            "author": author,
            "title": self.title,
            "text": self.selftext,
            "url": url,
            "created_utc": self.created_utc,
            "score": self.score,
            "num_comments": self.num_comments,
            "subreddit": community,
        });
        match value {
            JsonValue::Object(map) => map,
            _ => RawRecord::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl Column {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Text,
            nullable: false,
        }
    }

    pub const fn optional_text(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Text,
            nullable: true,
        }
    }

    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Integer,
            nullable: false,
        }
    }

    pub const fn timestamp(name: &'static str) -> Self {
        Self {
            name,
            kind: ColumnKind::Timestamp,
            nullable: true,
        }
    }
}

pub const POST_COLUMNS: &[Column] = &[
    Column::text("id"),
    Column::text("author"),
    Column::text("title"),
    Column::optional_text("text"),
    Column::optional_text("url"),
    Column::timestamp("created_utc"),
    Column::integer("score"),
    Column::integer("num_comments"),
    Column::text("subreddit"),
];

/// Ordered column list shared by the insert statement and row serialization.
///
/// Both sides read column order from the same value, so a statement built from
/// a schema always lines up with rows normalized against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSchema {
    columns: &'static [Column],
    primary_key: &'static str,
}

pub const POST_SCHEMA: ColumnSchema = ColumnSchema::new(POST_COLUMNS, "id");

impl ColumnSchema {
    pub const fn new(columns: &'static [Column], primary_key: &'static str) -> Self {
        Self {
            columns,
            primary_key,
        }
    }

    pub fn columns(&self) -> &'static [Column] {
        self.columns
    }

    pub fn primary_key(&self) -> &'static str {
        self.primary_key
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        self.columns.iter().map(|c| c.name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn primary_key_index(&self) -> Option<usize> {
        self.position(self.primary_key)
    }

    pub fn non_key_columns(&self) -> impl Iterator<Item = &'static Column> {
        let key = self.primary_key;
        self.columns.iter().filter(move |c| c.name != key)
    }
}

/// A single serialized cell, bound as a statement parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Null,
}

impl CellValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            CellValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            CellValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

/// What to do when an imported row's primary key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Skip rows whose key is already stored.
    #[default]
    Ignore,
    /// Replace the stored row's non-key columns.
    Overwrite,
    /// Plain insert; a key violation fails the whole batch.
    Fail,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::Ignore => "ignore",
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::Fail => "fail",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown conflict policy `{0}` (expected ignore, overwrite or fail)")]
pub struct ParsePolicyError(String);

impl FromStr for ConflictPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" | "insert-ignore" => Ok(ConflictPolicy::Ignore),
            "overwrite" | "upsert" => Ok(ConflictPolicy::Overwrite),
            "fail" | "plain" => Ok(ConflictPolicy::Fail),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Creation-time filter applied while collecting. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// Window covering the last `months` thirty-day months up to `now`.
    pub fn last_months(months: u32, now: DateTime<Utc>) -> Self {
        Self {
            start: Some(now - Duration::days(30 * i64::from(months))),
            end: None,
        }
    }

    pub fn is_before_start(&self, ts: DateTime<Utc>) -> bool {
        self.start.is_some_and(|start| ts < start)
    }

    pub fn is_after_end(&self, ts: DateTime<Utc>) -> bool {
        self.end.is_some_and(|end| ts > end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn post(id: &str, created_utc: i64) -> SourcePost {
        SourcePost {
            id: id.to_string(),
            author: None,
            title: format!("title {id}"),
            selftext: String::new(),
            permalink: format!("/r/rust/comments/{id}/"),
            created_utc,
            score: 3,
            num_comments: 1,
        }
    }

    #[test]
    fn source_post_flattens_into_record_with_permalink_url() {
        let record = post("abc", 1_700_000_000).into_record("rust");
        assert_eq!(record["id"], "abc");
        assert_eq!(record["author"], DELETED_AUTHOR);
        assert_eq!(record["url"], "https://reddit.com/r/rust/comments/abc/");
        assert_eq!(record["created_utc"], 1_700_000_000);
        assert_eq!(record["subreddit"], "rust");
        for name in POST_SCHEMA.names() {
            assert!(record.contains_key(name), "record missing {name}");
        }
    }

    #[test]
    fn post_schema_keys_on_id() {
        assert_eq!(POST_SCHEMA.primary_key_index(), Some(0));
        assert_eq!(POST_SCHEMA.len(), 9);
        assert!(POST_SCHEMA.non_key_columns().all(|c| c.name != "id"));
        assert_eq!(POST_SCHEMA.position("created_utc"), Some(5));
    }

    #[test]
    fn conflict_policy_parses_aliases() {
        assert_eq!("ignore".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Ignore);
        assert_eq!("UPSERT".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Overwrite);
        assert_eq!("plain".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::Fail);
        assert!("merge".parse::<ConflictPolicy>().is_err());
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::Ignore);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let start = Utc.timestamp_opt(85, 0).single().unwrap();
        let end = Utc.timestamp_opt(95, 0).single().unwrap();
        let window = TimeWindow::between(Some(start), Some(end));
        assert!(!window.is_before_start(start));
        assert!(window.is_before_start(start - Duration::seconds(1)));
        assert!(!window.is_after_end(end));
        assert!(window.is_after_end(end + Duration::seconds(1)));
        assert!(!TimeWindow::unbounded().is_before_start(start));
    }

    #[test]
    fn last_months_uses_thirty_day_months() {
        let now = Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).single().unwrap();
        let window = TimeWindow::last_months(3, now);
        assert_eq!(window.start, Some(now - Duration::days(90)));
        assert_eq!(window.end, None);
    }
}

//! Parameterized reads returning rows as column-to-value maps.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::error;

use crate::{ConnectionManager, StorageError, TableName};

pub type RowMap = serde_json::Map<String, JsonValue>;

/// A bind parameter for [`fetch`]; values never reach the statement text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParam {
    Text(String),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl QueryParam {
    /// Integers stay integers, anything else is bound as text.
    pub fn parse_loose(input: &str) -> Self {
        match input.trim().parse::<i64>() {
            Ok(v) => QueryParam::Integer(v),
            Err(_) => QueryParam::Text(input.to_string()),
        }
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        QueryParam::Text(value.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(value: String) -> Self {
        QueryParam::Text(value)
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        QueryParam::Integer(value)
    }
}

impl From<DateTime<Utc>> for QueryParam {
    fn from(value: DateTime<Utc>) -> Self {
        QueryParam::Timestamp(value)
    }
}

/// Wrap a read query so each result row comes back as one JSON object.
pub fn wrap_as_json_rows(query: &str) -> String {
    let inner = query.trim().trim_end_matches(';').trim_end();
    // Newlines keep a trailing `--` comment from swallowing the closing paren.
    format!("SELECT to_jsonb(q) AS record_json FROM (\n{inner}\n) AS q")
}

/// Run a parameterized read query (`$1`, `$2`, ... placeholders).
///
/// Returns `None` if the query fails or no session is open; the cause is
/// logged.
pub async fn fetch(
    db: &mut ConnectionManager,
    query: &str,
    params: &[QueryParam],
) -> Option<Vec<RowMap>> {
    match try_fetch(db, query, params).await {
        Ok(rows) => Some(rows),
        Err(err) => {
            error!(error = %err, query, "error fetching data");
            None
        }
    }
}

async fn try_fetch(
    db: &mut ConnectionManager,
    query: &str,
    params: &[QueryParam],
) -> Result<Vec<RowMap>, StorageError> {
    let conn = db.session()?;
    let sql = wrap_as_json_rows(query);

    let mut q = sqlx::query_scalar::<_, JsonValue>(&sql);
    for param in params {
        q = match param {
            QueryParam::Text(s) => q.bind(s.clone()),
            QueryParam::Integer(v) => q.bind(*v),
            QueryParam::Timestamp(ts) => q.bind(*ts),
        };
    }

    let rows = q.fetch_all(conn).await?;
    Ok(rows
        .into_iter()
        .filter_map(|value| match value {
            JsonValue::Object(map) => Some(map),
            _ => None,
        })
        .collect())
}

/// Stored posts of one community, at most `limit` of them.
pub async fn get_posts_by_subreddit(
    db: &mut ConnectionManager,
    table: &TableName,
    subreddit: &str,
    limit: i64,
) -> Option<Vec<RowMap>> {
    let query = format!("SELECT * FROM {table} WHERE subreddit = $1 LIMIT $2");
    fetch(db, &query, &[subreddit.into(), limit.into()]).await
}

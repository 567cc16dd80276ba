//! Chunked multi-row inserts with per-batch commit and rollback.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use redscrape_core::{
    CellValue, Column, ColumnKind, ColumnSchema, ConflictPolicy, NormalizedTable,
};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{Connection, Postgres, QueryBuilder, Row};
use tracing::{error, info, info_span, warn, Instrument};

use crate::{ConnectionManager, StorageError, TableName};

/// Postgres caps a single statement at this many bind parameters.
pub const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOptions {
    pub policy: ConflictPolicy,
    pub batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            policy: ConflictPolicy::Ignore,
            batch_size: redscrape_core::config::DEFAULT_BATCH_SIZE,
        }
    }
}

/// Row accounting for one import.
///
/// `attempted` counts every input row. Rows end up in exactly one of
/// `inserted`, `updated`, `skipped` or `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub attempted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub batches_committed: usize,
    pub batches_failed: usize,
}

impl ImportReport {
    pub fn is_complete(&self) -> bool {
        self.batches_failed == 0
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows processed: {} inserted, {} updated, {} skipped as duplicates, {} failed ({} of {} batches committed)",
            self.attempted,
            self.inserted,
            self.updated,
            self.skipped,
            self.failed,
            self.batches_committed,
            self.batches_committed + self.batches_failed,
        )
    }
}

/// Multi-row `INSERT` for one schema and conflict policy.
#[derive(Debug, Clone, Copy)]
pub struct InsertStatement<'s> {
    table: &'s TableName,
    schema: &'s ColumnSchema,
    policy: ConflictPolicy,
}

impl<'s> InsertStatement<'s> {
    pub fn new(table: &'s TableName, schema: &'s ColumnSchema, policy: ConflictPolicy) -> Self {
        Self {
            table,
            schema,
            policy,
        }
    }

    /// Build the statement for `rows`, binding cells in schema order.
    pub fn build<'a>(&self, rows: &[Vec<CellValue>]) -> QueryBuilder<'a, Postgres> {
        let columns = self.schema.names().collect::<Vec<_>>().join(", ");
        let mut qb = QueryBuilder::new(format!("INSERT INTO {} ({columns}) ", self.table));

        let schema_columns = self.schema.columns();
        qb.push_values(rows, |mut b, row| {
            for (column, cell) in schema_columns.iter().zip(row) {
                push_cell(&mut b, column, cell);
            }
        });

        let key = self.schema.primary_key();
        match self.policy {
            ConflictPolicy::Ignore => {
                qb.push(format!(" ON CONFLICT ({key}) DO NOTHING"));
            }
            ConflictPolicy::Overwrite => {
                let assignments = self
                    .schema
                    .non_key_columns()
                    .map(|c| format!("{0} = EXCLUDED.{0}", c.name))
                    .chain(std::iter::once("updated_at = now()".to_string()))
                    .collect::<Vec<_>>()
                    .join(", ");
                qb.push(format!(" ON CONFLICT ({key}) DO UPDATE SET {assignments}"));
            }
            ConflictPolicy::Fail => {}
        }

        // xmax is zero for freshly inserted tuples and non-zero for updated ones.
        qb.push(" RETURNING (xmax = 0) AS inserted");
        qb
    }
}

fn push_cell<'a>(
    b: &mut Separated<'_, 'a, Postgres, &'static str>,
    column: &Column,
    cell: &CellValue,
) {
    match cell {
        CellValue::Text(s) => {
            b.push_bind(s.clone());
        }
        CellValue::Integer(v) => {
            b.push_bind(*v);
        }
        CellValue::Timestamp(ts) => {
            b.push_bind(*ts);
        }
        CellValue::Null => match column.kind {
            ColumnKind::Text => {
                b.push_bind(None::<String>);
            }
            ColumnKind::Integer => {
                b.push_bind(None::<i64>);
            }
            ColumnKind::Timestamp => {
                b.push_bind(None::<DateTime<Utc>>);
            }
        },
    }
}

/// Keep only the last row for each primary key, preserving relative order.
pub fn collapse_duplicate_keys(table: &NormalizedTable) -> Vec<Vec<CellValue>> {
    let mut seen = HashSet::new();
    let keyed: Vec<(&str, &Vec<CellValue>)> = table.keys().zip(table.rows()).collect();
    let mut kept: Vec<(&str, &Vec<CellValue>)> = keyed
        .into_iter()
        .rev()
        .filter(|(key, _)| seen.insert(*key))
        .collect();
    kept.reverse();
    kept.into_iter().map(|(_, row)| row.clone()).collect()
}

#[derive(Debug, Default)]
struct BatchOutcome {
    inserted: usize,
    updated: usize,
    returned: usize,
}

impl BatchOutcome {
    fn from_rows(rows: &[PgRow]) -> Result<Self, sqlx::Error> {
        Self::from_flags(rows.iter().map(|row| row.try_get::<bool, _>("inserted")))
    }

    /// Tally `RETURNING` flags; an undecodable flag fails the whole batch.
    fn from_flags<I>(flags: I) -> Result<Self, sqlx::Error>
    where
        I: IntoIterator<Item = Result<bool, sqlx::Error>>,
    {
        let mut outcome = Self::default();
        for flag in flags {
            if flag? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
            outcome.returned += 1;
        }
        Ok(outcome)
    }
}

/// Import `data` into `table` in batches of `options.batch_size` rows.
///
/// Every batch is its own transaction. A failing batch is logged and rolled
/// back and the import continues with the next one; batches already
/// committed stay committed. `Err` is only returned for invalid input or when
/// no session is open.
pub async fn import_table(
    db: &mut ConnectionManager,
    table: &TableName,
    data: &NormalizedTable,
    options: ImportOptions,
) -> Result<ImportReport, StorageError> {
    if options.batch_size == 0 {
        return Err(StorageError::ZeroBatchSize);
    }
    let columns = data.schema().len();
    let widest_batch = options.batch_size.min(data.len());
    if widest_batch * columns > MAX_BIND_PARAMS {
        return Err(StorageError::TooManyParameters {
            rows: widest_batch,
            columns,
            limit: MAX_BIND_PARAMS,
        });
    }

    let conn = db.session()?;
    let rows: Cow<'_, [Vec<CellValue>]> = match options.policy {
        ConflictPolicy::Overwrite => Cow::Owned(collapse_duplicate_keys(data)),
        _ => Cow::Borrowed(data.rows()),
    };

    let mut report = ImportReport {
        attempted: data.len(),
        skipped: data.len() - rows.len(),
        ..ImportReport::default()
    };
    let statement = InsertStatement::new(table, data.schema(), options.policy);

    for (batch_no, batch) in rows.chunks(options.batch_size).enumerate() {
        let start = batch_no * options.batch_size;
        let end = start + batch.len();
        let span = info_span!("import_batch", %table, batch = batch_no, policy = %options.policy);

        match insert_batch(conn, &statement, batch).instrument(span).await {
            Ok(outcome) => {
                report.inserted += outcome.inserted;
                report.updated += outcome.updated;
                report.skipped += batch.len() - outcome.returned;
                report.batches_committed += 1;
                info!(
                    %table,
                    rows = batch.len(),
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    "committed records {start} to {end}"
                );
            }
            Err(err) => {
                report.failed += batch.len();
                report.batches_failed += 1;
                error!(%table, error = %err, "error inserting records {start} to {end}; batch rolled back");
            }
        }
    }

    info!(
        %table,
        attempted = report.attempted,
        inserted = report.inserted,
        updated = report.updated,
        skipped = report.skipped,
        failed = report.failed,
        "import finished"
    );
    Ok(report)
}

async fn insert_batch(
    conn: &mut PgConnection,
    statement: &InsertStatement<'_>,
    batch: &[Vec<CellValue>],
) -> Result<BatchOutcome, sqlx::Error> {
    let mut tx = conn.begin().await?;
    let mut qb = statement.build(batch);
    let result = qb.build().fetch_all(&mut *tx).await;

    match result.and_then(|rows| BatchOutcome::from_rows(&rows)) {
        Ok(outcome) => {
            tx.commit().await?;
            Ok(outcome)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redscrape_core::{normalize_records, RawRecord, POST_SCHEMA};
    use serde_json::json;
    use sqlx::postgres::PgConnectOptions;

    fn table_of(ids: &[(&str, &str)]) -> NormalizedTable {
        let records: Vec<RawRecord> = ids
            .iter()
            .map(|(id, title)| {
                let value = json!({
                    "id": id,
                    "author": "a",
                    "title": title,
                    "created_utc": 1_700_000_000,
                    "subreddit": "rust",
                });
                value.as_object().cloned().unwrap_or_default()
            })
            .collect();
        normalize_records(&records, &POST_SCHEMA).unwrap()
    }

    #[test]
    fn ignore_policy_skips_conflicting_keys() {
        let table = TableName::posts();
        let data = table_of(&[("a", "one"), ("b", "two")]);
        let qb = InsertStatement::new(&table, &POST_SCHEMA, ConflictPolicy::Ignore).build(data.rows());
        let sql = qb.sql();
        assert!(sql.starts_with(
            "INSERT INTO reddit_posts (id, author, title, text, url, created_utc, score, num_comments, subreddit) VALUES "
        ));
        assert!(sql.contains("$18"));
        assert!(!sql.contains("$19"));
        assert!(sql.ends_with("ON CONFLICT (id) DO NOTHING RETURNING (xmax = 0) AS inserted"));
    }

    #[test]
    fn overwrite_policy_updates_every_non_key_column() {
        let table = TableName::posts();
        let data = table_of(&[("a", "one")]);
        let qb =
            InsertStatement::new(&table, &POST_SCHEMA, ConflictPolicy::Overwrite).build(data.rows());
        let sql = qb.sql();
        assert!(sql.contains("ON CONFLICT (id) DO UPDATE SET author = EXCLUDED.author, title = EXCLUDED.title"));
        assert!(sql.contains("subreddit = EXCLUDED.subreddit, updated_at = now()"));
        assert!(!sql.contains("id = EXCLUDED.id"));
    }

    #[test]
    fn fail_policy_is_a_plain_insert() {
        let table = TableName::posts();
        let data = table_of(&[("a", "one")]);
        let qb = InsertStatement::new(&table, &POST_SCHEMA, ConflictPolicy::Fail).build(data.rows());
        assert!(!qb.sql().contains("ON CONFLICT"));
    }

    #[test]
    fn collapse_keeps_last_occurrence_in_order() {
        let data = table_of(&[("a", "first"), ("b", "only"), ("a", "second"), ("c", "only")]);
        let rows = collapse_duplicate_keys(&data);
        let summary: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r[0].as_text().unwrap(), r[2].as_text().unwrap()))
            .collect();
        assert_eq!(summary, vec![("b", "only"), ("a", "second"), ("c", "only")]);
    }

    #[test]
    fn batch_outcome_splits_inserts_from_updates() {
        let outcome = BatchOutcome::from_flags([Ok(true), Ok(false), Ok(true)]).unwrap();
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.returned, 3);
    }

    #[test]
    fn undecodable_insert_flag_fails_the_batch() {
        let flags = vec![
            Ok(true),
            Err(sqlx::Error::ColumnNotFound("inserted".into())),
            Ok(false),
        ];
        let result = BatchOutcome::from_flags(flags);
        assert!(matches!(result, Err(sqlx::Error::ColumnNotFound(col)) if col == "inserted"));
    }

    #[test]
    fn report_display_separates_processed_from_inserted() {
        let report = ImportReport {
            attempted: 10,
            inserted: 6,
            updated: 0,
            skipped: 4,
            failed: 0,
            batches_committed: 1,
            batches_failed: 0,
        };
        assert!(report.is_complete());
        assert_eq!(
            report.to_string(),
            "10 rows processed: 6 inserted, 0 updated, 4 skipped as duplicates, 0 failed (1 of 1 batches committed)"
        );
    }

    #[tokio::test]
    async fn invalid_batch_sizes_are_rejected_before_touching_the_session() {
        let mut db = ConnectionManager::from_options(PgConnectOptions::new());
        let data = table_of(&[("a", "one")]);

        let zero = ImportOptions {
            batch_size: 0,
            ..ImportOptions::default()
        };
        assert!(matches!(
            import_table(&mut db, &TableName::posts(), &data, zero).await,
            Err(StorageError::ZeroBatchSize)
        ));

        let many: Vec<(String, String)> = (0..8000).map(|i| (format!("id{i}"), "t".to_string())).collect();
        let refs: Vec<(&str, &str)> = many.iter().map(|(a, b)| (a.as_str(), b.as_str())).collect();
        let big = table_of(&refs);
        let huge = ImportOptions {
            batch_size: 8000,
            ..ImportOptions::default()
        };
        assert!(matches!(
            import_table(&mut db, &TableName::posts(), &big, huge).await,
            Err(StorageError::TooManyParameters { rows: 8000, columns: 9, .. })
        ));
    }

    #[tokio::test]
    async fn import_without_session_reports_not_connected() {
        let mut db = ConnectionManager::from_options(PgConnectOptions::new());
        let data = table_of(&[("a", "one")]);
        let result = import_table(&mut db, &TableName::posts(), &data, ImportOptions::default()).await;
        assert!(matches!(result, Err(StorageError::NotConnected)));
    }
}

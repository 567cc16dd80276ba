//! PostgreSQL session management, batch import and read helpers for redscrape.

mod import;
mod query;

use std::fmt;

use redscrape_core::{ColumnKind, ColumnSchema, DatabaseConfig, POSTS_TABLE};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Postgres, Transaction};
use thiserror::Error;
use tracing::{error, info, warn};

pub use import::{
    collapse_duplicate_keys, import_table, ImportOptions, ImportReport, InsertStatement,
    MAX_BIND_PARAMS,
};
pub use query::{fetch, get_posts_by_subreddit, wrap_as_json_rows, QueryParam, RowMap};

pub const CRATE_NAME: &str = "redscrape-storage";

/// Columns indexed when the posts relation is created.
pub const INDEXED_COLUMNS: &[&str] = &["author", "subreddit", "created_utc", "score"];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no open database session")]
    NotConnected,
    #[error("invalid table name `{0}`")]
    InvalidTableName(String),
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("batches of {rows} rows x {columns} columns exceed the {limit} bind parameter limit")]
    TooManyParameters {
        rows: usize,
        columns: usize,
        limit: usize,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Validated, possibly schema-qualified relation name.
///
/// Relation names are spliced into statement text, so only plain identifiers
/// are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: &str) -> Result<Self, StorageError> {
        let name = name.trim();
        let segments: Vec<&str> = name.split('.').collect();
        let valid = segments.len() <= 2 && segments.iter().all(|s| is_identifier(s));
        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(StorageError::InvalidTableName(name.to_string()))
        }
    }

    pub fn posts() -> Self {
        Self(POSTS_TABLE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self::posts()
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    segment.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Owns the single session to the store and its transaction boundaries.
///
/// The session closes on [`ConnectionManager::disconnect`] or when the manager
/// is dropped, whichever comes first.
pub struct ConnectionManager {
    options: PgConnectOptions,
    conn: Option<PgConnection>,
    server_version: Option<String>,
}

impl ConnectionManager {
    pub fn new(config: &DatabaseConfig) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .database(&config.database);
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        Self::from_options(options)
    }

    pub fn from_options(options: PgConnectOptions) -> Self {
        Self {
            options,
            conn: None,
            server_version: None,
        }
    }

    /// Open the session. Failures are logged and reported as `false`.
    pub async fn connect(&mut self) -> bool {
        if self.conn.is_some() {
            return true;
        }

        let mut conn = match PgConnection::connect_with(&self.options).await {
            Ok(conn) => conn,
            Err(err) => {
                error!(
                    host = self.options.get_host(),
                    port = self.options.get_port(),
                    error = %err,
                    "error connecting to database"
                );
                return false;
            }
        };

        match sqlx::query_scalar::<_, String>("SELECT version()")
            .fetch_one(&mut conn)
            .await
        {
            Ok(version) => {
                info!(server_version = %version, "connected to database");
                self.server_version = Some(version);
            }
            Err(err) => warn!(error = %err, "connected but could not read server version"),
        }

        self.conn = Some(conn);
        true
    }

    /// Close the session if one is open. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.server_version = None;
        match conn.close().await {
            Ok(()) => info!("database connection closed"),
            Err(err) => warn!(error = %err, "error while closing database connection"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn session(&mut self) -> Result<&mut PgConnection, StorageError> {
        self.conn.as_mut().ok_or(StorageError::NotConnected)
    }

    /// Start a transaction; dropping it without commit rolls it back.
    pub async fn begin(&mut self) -> Result<Transaction<'_, Postgres>, StorageError> {
        Ok(self.session()?.begin().await?)
    }

    /// Create `table` and its indexes for `schema` if they do not exist yet.
    pub async fn ensure_schema(&mut self, table: &TableName, schema: &ColumnSchema) -> bool {
        let statements = schema_statements(table, schema);
        let result: Result<(), StorageError> = async {
            let mut tx = self.begin().await?;
            for sql in &statements {
                sqlx::query(sql).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(%table, indexes = statements.len() - 1, "table and indexes ready");
                true
            }
            Err(err) => {
                error!(%table, error = %err, "error creating table");
                false
            }
        }
    }
}

/// `CREATE TABLE` plus `CREATE INDEX` statements for `schema`, all idempotent.
pub fn schema_statements(table: &TableName, schema: &ColumnSchema) -> Vec<String> {
    let mut defs: Vec<String> = schema
        .columns()
        .iter()
        .map(|column| {
            let ty = match column.kind {
                ColumnKind::Text => "TEXT",
                ColumnKind::Integer => "BIGINT",
                ColumnKind::Timestamp => "TIMESTAMPTZ",
            };
            let mut def = format!("{} {ty}", column.name);
            if column.name == schema.primary_key() {
                def.push_str(" PRIMARY KEY");
            } else if column.kind == ColumnKind::Integer {
                def.push_str(" NOT NULL DEFAULT 0");
            } else if !column.nullable {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();
    defs.push("created_at TIMESTAMPTZ NOT NULL DEFAULT now()".to_string());
    defs.push("updated_at TIMESTAMPTZ NOT NULL DEFAULT now()".to_string());

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)",
        defs.join(",\n    ")
    )];

    let index_prefix = table.as_str().replace('.', "_");
    statements.extend(
        INDEXED_COLUMNS
            .iter()
            .filter(|name| schema.position(name).is_some())
            .map(|name| {
                format!("CREATE INDEX IF NOT EXISTS idx_{index_prefix}_{name} ON {table} ({name})")
            }),
    );
    statements
}

//! Raw record to tabular row conversion.

use chrono::DateTime;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{CellValue, Column, ColumnKind, ColumnSchema, RawRecord};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("schema primary key `{0}` is not one of its columns")]
    UnknownPrimaryKey(&'static str),
    #[error("record {index} has no `{column}` value")]
    MissingPrimaryKey { index: usize, column: &'static str },
    #[error("record {index}: `{column}` value {value} is not {expected}")]
    InvalidValue {
        index: usize,
        column: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("row {index} has {actual} cells, schema expects {expected}")]
    RowWidth {
        index: usize,
        actual: usize,
        expected: usize,
    },
}

/// Rows laid out in the column order of the schema they were built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTable {
    schema: ColumnSchema,
    rows: Vec<Vec<CellValue>>,
}

impl NormalizedTable {
    /// Wrap pre-built rows, checking each one against the schema width.
    pub fn from_rows(
        schema: ColumnSchema,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<Self, NormalizeError> {
        if schema.primary_key_index().is_none() {
            return Err(NormalizeError::UnknownPrimaryKey(schema.primary_key()));
        }
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != schema.len())
        {
            return Err(NormalizeError::RowWidth {
                index,
                actual: row.len(),
                expected: schema.len(),
            });
        }
        Ok(Self { schema, rows })
    }

    pub fn schema(&self) -> &ColumnSchema {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<CellValue>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cells of one column, top to bottom.
    pub fn column<'a>(&'a self, name: &str) -> Option<impl Iterator<Item = &'a CellValue> + 'a> {
        let idx = self.schema.position(name)?;
        Some(self.rows.iter().map(move |row| &row[idx]))
    }

    /// Primary key of each row.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        let idx = self.schema.primary_key_index().unwrap_or(0);
        self.rows
            .iter()
            .map(move |row| row[idx].as_text().unwrap_or_default())
    }
}

/// Convert heterogeneous records into fixed-width rows ordered by `schema`.
///
/// `created_utc`-style timestamp columns are read as integer seconds since the
/// epoch; a missing or null timestamp becomes [`CellValue::Null`]. Missing text
/// becomes the empty string and missing integers become zero.
pub fn normalize_records(
    records: &[RawRecord],
    schema: &ColumnSchema,
) -> Result<NormalizedTable, NormalizeError> {
    let key_idx = schema
        .primary_key_index()
        .ok_or(NormalizeError::UnknownPrimaryKey(schema.primary_key()))?;

    let mut rows = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let row = schema
            .columns()
            .iter()
            .map(|column| normalize_cell(index, column, record.get(column.name)))
            .collect::<Result<Vec<_>, _>>()?;

        if row[key_idx].as_text().map_or(true, |key| key.trim().is_empty()) {
            return Err(NormalizeError::MissingPrimaryKey {
                index,
                column: schema.primary_key(),
            });
        }
        rows.push(row);
    }

    Ok(NormalizedTable {
        schema: *schema,
        rows,
    })
}

fn normalize_cell(
    index: usize,
    column: &Column,
    value: Option<&JsonValue>,
) -> Result<CellValue, NormalizeError> {
    let value = value.filter(|v| !v.is_null());
    let invalid = |value: &JsonValue, expected: &'static str| NormalizeError::InvalidValue {
        index,
        column: column.name,
        value: value.to_string(),
        expected,
    };

    match column.kind {
        ColumnKind::Text => Ok(CellValue::Text(match value {
            None => String::new(),
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        })),
        ColumnKind::Integer => match value {
            None => Ok(CellValue::Integer(0)),
            Some(v) => integer_of(v)
                .map(CellValue::Integer)
                .ok_or_else(|| invalid(v, "an integer")),
        },
        ColumnKind::Timestamp => match value {
            None => Ok(CellValue::Null),
            Some(v) => integer_of(v)
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .map(CellValue::Timestamp)
                .ok_or_else(|| invalid(v, "epoch seconds")),
        },
    }
}

fn integer_of(value: &JsonValue) -> Option<i64> {
    let from_float = |f: f64| f.is_finite().then(|| f.trunc() as i64);
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(from_float)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(from_float))
        }
        _ => None,
    }
}

//! Local file formats: Parquet output for collected tables and JSON record input.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::SecondsFormat;
use parquet::arrow::ArrowWriter;
use redscrape_core::{ColumnKind, NormalizedTable, RawRecord};
use serde_json::Value as JsonValue;

/// Write `table` as a single-row-group Parquet file, one column per schema column.
///
/// Timestamps are stored as RFC 3339 strings. Returns the number of rows written.
pub fn write_parquet_table(path: impl AsRef<Path>, table: &NormalizedTable) -> Result<usize> {
    let path = path.as_ref();
    let batch = record_batch(table)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(batch.num_rows())
}

fn record_batch(table: &NormalizedTable) -> Result<RecordBatch> {
    let schema = table.schema();
    let rows = table.rows();

    let mut fields = Vec::with_capacity(schema.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.len());
    for (idx, column) in schema.columns().iter().enumerate() {
        let nullable = column.name != schema.primary_key();
        match column.kind {
            ColumnKind::Text => {
                fields.push(ArrowField::new(column.name, DataType::Utf8, nullable));
                arrays.push(Arc::new(StringArray::from(
                    rows.iter().map(|r| r[idx].as_text()).collect::<Vec<_>>(),
                )));
            }
            ColumnKind::Integer => {
                fields.push(ArrowField::new(column.name, DataType::Int64, nullable));
                arrays.push(Arc::new(Int64Array::from(
                    rows.iter().map(|r| r[idx].as_integer()).collect::<Vec<_>>(),
                )));
            }
            ColumnKind::Timestamp => {
                fields.push(ArrowField::new(column.name, DataType::Utf8, true));
                arrays.push(Arc::new(StringArray::from(
                    rows.iter()
                        .map(|r| {
                            r[idx]
                                .as_timestamp()
                                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
                        })
                        .collect::<Vec<_>>(),
                )));
            }
        }
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .context("building posts record batch")
}

/// Load a JSON array of records, as produced by an earlier collection or by hand.
pub fn read_records_json(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;

    let JsonValue::Array(items) = value else {
        bail!("{} must hold a JSON array of records", path.display());
    };
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match item {
            JsonValue::Object(map) => Ok(map),
            other => bail!(
                "record {idx} in {} is not an object: {other}",
                path.display()
            ),
        })
        .collect()
}

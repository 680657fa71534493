// 🛬 Landing Area - raw CSV batches and the Raw Unifier
// Batches are written once per table per run and never mutated

use crate::error::{PipelineError, Result};
use crate::schema::{require_source_schema, TableSchema};
use crate::storage::ObjectStore;
use crate::table::{DataType, Table, Value};
use chrono::NaiveDateTime;
use csv::{ReaderBuilder, WriterBuilder};
use std::sync::Arc;

/// Fixed-width so batch keys sort in run order
const RUN_LABEL_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%6f";

/// `{table}/{run_timestamp}.csv`
pub fn landing_key(table: &str, run_at: NaiveDateTime) -> String {
    format!("{}/{}.csv", table, run_at.format(RUN_LABEL_FORMAT))
}

// ============================================================================
// CSV CODEC
// ============================================================================

/// Null marker in landed CSV, so that empty text survives the round trip.
/// Text that itself starts with a backslash is written with one extra leading backslash.
pub const NULL_TOKEN: &str = "\\N";

fn encode_field(value: &Value) -> String {
    match value {
        Value::Null => NULL_TOKEN.to_string(),
        Value::Text(text) if text.starts_with('\\') => format!("\\{}", text),
        other => other.render(),
    }
}

fn decode_field(field: &str, data_type: DataType) -> std::result::Result<Value, String> {
    if field == NULL_TOKEN {
        return Ok(Value::Null);
    }
    match (data_type, field.strip_prefix('\\')) {
        (DataType::Text, Some(escaped)) => Ok(Value::Text(escaped.to_string())),
        _ => Value::parse(field, data_type),
    }
}

pub fn encode_csv(table: &Table) -> Result<Vec<u8>> {
    let key = table.name().to_string();
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(Vec::new());

    writer
        .write_record(table.column_names())
        .map_err(|e| PipelineError::codec("csv", &key, e))?;
    for row in table.rows() {
        writer
            .write_record(row.iter().map(encode_field))
            .map_err(|e| PipelineError::codec("csv", &key, e))?;
    }

    writer
        .into_inner()
        .map_err(|e| PipelineError::codec("csv", &key, e))
}

/// Parse a landed batch. The header must equal the declared column list.
pub fn decode_csv(key: &str, bytes: &[u8], schema: &TableSchema) -> Result<Table> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes);

    let header = reader
        .headers()
        .map_err(|e| PipelineError::codec("csv", key, e))?
        .clone();
    let header: Vec<&str> = header.iter().collect();
    let declared = schema.column_names();
    if header != declared {
        return Err(PipelineError::schema(
            &schema.name,
            format!(
                "{} has columns [{}], declared [{}]",
                key,
                header.join(", "),
                declared.join(", ")
            ),
        ));
    }

    let mut table = schema.empty_table();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| PipelineError::codec("csv", key, e))?;
        let mut values = Vec::with_capacity(schema.columns.len());
        for (col, field) in schema.columns.iter().zip(record.iter()) {
            let value = decode_field(field, col.data_type).map_err(|e| {
                // +2: one-based, after the header
                PipelineError::schema(&schema.name, format!("{} line {}: {}: {}", key, line + 2, col.name, e))
            })?;
            values.push(value);
        }
        table.push_row(values)?;
    }

    Ok(table)
}

// ============================================================================
// LANDING AREA
// ============================================================================

pub struct LandingArea {
    store: Arc<dyn ObjectStore>,
}

impl LandingArea {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        LandingArea { store }
    }

    /// Store one raw batch, returning its key
    pub fn write_batch(&self, table: &Table, run_at: NaiveDateTime) -> Result<String> {
        let key = landing_key(table.name(), run_at);
        let bytes = encode_csv(table)?;
        self.store.put(&key, &bytes)?;
        tracing::info!(table = table.name(), key = %key, rows = table.len(), "Landed batch");
        Ok(key)
    }

    /// Batch keys of a table in arrival order
    pub fn batches(&self, table: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .store
            .list(&format!("{}/", table))?
            .into_iter()
            .filter(|k| k.ends_with(".csv"))
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub fn read_batch(&self, key: &str, schema: &TableSchema) -> Result<Table> {
        let bytes = self
            .store
            .get(key)?
            .ok_or_else(|| PipelineError::storage(key, "batch listed but missing"))?;
        decode_csv(key, &bytes, schema)
    }

    /// Every landed row of a table, batch after batch, without deduplication
    pub fn unify(&self, table: &str) -> Result<Table> {
        let schema = require_source_schema(table)?;
        let keys = self.batches(table)?;
        if keys.is_empty() {
            return Err(PipelineError::empty(table, "no landed batches"));
        }

        let batches = keys
            .iter()
            .map(|key| self.read_batch(key, &schema))
            .collect::<Result<Vec<_>>>()?;

        let unified = Table::concat(table, batches)?;
        tracing::debug!(table, batches = keys.len(), rows = unified.len(), "Unified landing batches");
        Ok(unified)
    }
}

// 🏛️ Warehouse Loader - processed snapshots into the star schema
// Each table is read, stripped to the warehouse columns and applied in its own transaction

use crate::error::{PipelineError, Result};
use crate::processed::{table_for_key, ProcessedStore};
use crate::schema::{default_load_strategy, output_schema, LoadStrategy, OUTPUT_TABLES};
use crate::table::{DataType, Table, Value};
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Boolean(b) => ToSqlOutput::from(*b),
            Value::Date(_) | Value::Time(_) | Value::Timestamp(_) => ToSqlOutput::from(self.render()),
        })
    }
}

pub trait Warehouse {
    /// Column names of a warehouse table; empty when the table does not exist
    fn columns(&self, table: &str) -> Result<Vec<String>>;

    /// Write all rows of `table` in one transaction, returning the rows written
    fn apply(&mut self, table: &Table, strategy: LoadStrategy, primary_key: &[String]) -> Result<usize>;
}

// ============================================================================
// SQLITE BACKEND
// ============================================================================

pub struct SqliteWarehouse {
    conn: Connection,
}

fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Integer => "INTEGER",
        DataType::Real => "REAL",
        DataType::Text => "TEXT",
        DataType::Boolean => "BOOLEAN",
        DataType::Date => "DATE",
        DataType::Time => "TIME",
        DataType::Timestamp => "TIMESTAMP",
    }
}

impl SqliteWarehouse {
    pub fn open(path: &Path, timeout: Duration) -> Result<Self> {
        let target = format!("warehouse {}", path.display());
        let conn = Connection::open(path).map_err(|e| PipelineError::connectivity(&target, e))?;
        conn.busy_timeout(timeout)
            .map_err(|e| PipelineError::connectivity(&target, e))?;
        Ok(SqliteWarehouse { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        SqliteWarehouse { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Create any missing star-schema table. Existing tables are left as they are.
    pub fn bootstrap(&self) -> Result<()> {
        let fail = |e: rusqlite::Error| PipelineError::connectivity("warehouse bootstrap", e);

        // WAL for crash recovery
        self.conn.pragma_update(None, "journal_mode", "WAL").map_err(fail)?;

        for name in OUTPUT_TABLES {
            let Some(schema) = output_schema(name) else {
                continue;
            };
            let mut columns: Vec<String> = schema
                .columns
                .iter()
                .map(|c| {
                    format!(
                        "\"{}\" {}{}",
                        c.name,
                        sql_type(c.data_type),
                        if c.nullable { "" } else { " NOT NULL" }
                    )
                })
                .collect();
            columns.push(format!("PRIMARY KEY ({})", quoted(&schema.primary_key)));

            self.conn
                .execute(
                    &format!("CREATE TABLE IF NOT EXISTS \"{}\" (\n    {}\n)", name, columns.join(",\n    ")),
                    [],
                )
                .map_err(fail)?;
        }
        Ok(())
    }
}

fn quoted(columns: &[impl AsRef<str>]) -> String {
    columns
        .iter()
        .map(|c| format!("\"{}\"", c.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Warehouse for SqliteWarehouse {
    fn columns(&self, table: &str) -> Result<Vec<String>> {
        let target = format!("warehouse table {}", table);
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1)")
            .map_err(|e| PipelineError::connectivity(&target, e))?;
        let names = stmt
            .query_map([table], |row| row.get::<_, String>(0))
            .map_err(|e| PipelineError::connectivity(&target, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| PipelineError::connectivity(&target, e))?;
        Ok(names)
    }

    fn apply(&mut self, table: &Table, strategy: LoadStrategy, primary_key: &[String]) -> Result<usize> {
        let target = format!("warehouse table {}", table.name());
        let fail = |e: rusqlite::Error| PipelineError::connectivity(&target, e);

        let names = table.column_names();
        let placeholders = (1..=names.len()).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ");
        let mut sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            table.name(),
            quoted(&names),
            placeholders
        );
        if strategy == LoadStrategy::Upsert {
            let updates: Vec<String> = names
                .iter()
                .filter(|c| !primary_key.iter().any(|k| k == *c))
                .map(|c| format!("\"{0}\" = excluded.\"{0}\"", c))
                .collect();
            let action = if updates.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", updates.join(", "))
            };
            sql.push_str(&format!(" ON CONFLICT ({}) {}", quoted(primary_key), action));
        }

        // Dropping the transaction without commit rolls it back
        let tx = self.conn.transaction().map_err(fail)?;
        if strategy == LoadStrategy::Replace {
            tx.execute(&format!("DELETE FROM \"{}\"", table.name()), [])
                .map_err(fail)?;
        }
        {
            let mut stmt = tx.prepare(&sql).map_err(fail)?;
            for row in table.rows() {
                stmt.execute(params_from_iter(row.iter())).map_err(fail)?;
            }
        }
        tx.commit().map_err(fail)?;
        Ok(table.len())
    }
}

// ============================================================================
// LOADER
// ============================================================================

/// `{"Records": [artifact_key, ...]}`; absent means every artifact in the processed store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    #[serde(rename = "Records", default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<String>>,
}

impl LoadRequest {
    pub fn for_keys(keys: Vec<String>) -> Self {
        LoadRequest { records: Some(keys) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Pending,
    Reading,
    /// Empty artifact, nothing applied
    Skipped,
    Applying,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableLoad {
    pub key: String,
    pub table: Option<String>,
    pub state: LoadState,
    pub rows: usize,
    pub reason: Option<String>,
}

impl TableLoad {
    fn new(key: &str) -> Self {
        TableLoad {
            key: key.to_string(),
            table: None,
            state: LoadState::Pending,
            rows: 0,
            reason: None,
        }
    }

    fn advance(&mut self, state: LoadState) {
        tracing::debug!(key = %self.key, from = ?self.state, to = ?state, "Load state");
        self.state = state;
    }

    fn fail(&mut self, err: PipelineError) {
        tracing::error!(key = %self.key, error = %err, "Load failed");
        self.reason = Some(err.to_string());
        self.advance(LoadState::Failed);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub loads: Vec<TableLoad>,
}

impl LoadReport {
    fn keys_in(&self, state: LoadState) -> Vec<&str> {
        self.loads
            .iter()
            .filter(|l| l.state == state)
            .map(|l| l.key.as_str())
            .collect()
    }

    pub fn committed(&self) -> Vec<&str> {
        self.keys_in(LoadState::Committed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.keys_in(LoadState::Skipped)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.keys_in(LoadState::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "loaded {} table(s), skipped {}",
            self.committed().len(),
            self.skipped().len()
        );
        let failed = self.failed();
        if !failed.is_empty() {
            summary.push_str(&format!("; failed: {}", failed.join(", ")));
        }
        summary
    }
}

pub struct Loader<'a, W: Warehouse> {
    processed: &'a ProcessedStore,
    warehouse: &'a mut W,
    strategies: HashMap<String, LoadStrategy>,
}

impl<'a, W: Warehouse> Loader<'a, W> {
    pub fn new(processed: &'a ProcessedStore, warehouse: &'a mut W) -> Self {
        Loader {
            processed,
            warehouse,
            strategies: HashMap::new(),
        }
    }

    /// Per-table overrides of the default strategy
    pub fn with_strategies(mut self, strategies: HashMap<String, LoadStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn strategy_for(&self, table: &str) -> LoadStrategy {
        self.strategies
            .get(table)
            .copied()
            .unwrap_or_else(|| default_load_strategy(table))
    }

    /// Load each requested artifact independently. Only listing the processed store can fail the call.
    pub fn run(&mut self, request: &LoadRequest) -> Result<LoadReport> {
        let keys = match &request.records {
            Some(keys) => keys.clone(),
            None => self.processed.list()?,
        };

        let mut report = LoadReport::default();
        for key in keys {
            let mut load = TableLoad::new(&key);
            self.load_one(&mut load);
            report.loads.push(load);
        }

        tracing::info!(
            committed = report.committed().len(),
            skipped = report.skipped().len(),
            failed = report.failed().len(),
            "Load complete"
        );
        Ok(report)
    }

    fn load_one(&mut self, load: &mut TableLoad) {
        load.advance(LoadState::Reading);
        let table = match self.read_stripped(&load.key) {
            Ok(table) => table,
            Err(e) => return load.fail(e),
        };
        load.table = Some(table.name().to_string());

        if table.is_empty() {
            tracing::info!(table = table.name(), "Empty artifact, nothing to load");
            return load.advance(LoadState::Skipped);
        }

        load.advance(LoadState::Applying);
        let strategy = self.strategy_for(table.name());
        let primary_key = output_schema(table.name())
            .map(|s| s.primary_key)
            .unwrap_or_default();
        match self.warehouse.apply(&table, strategy, &primary_key) {
            Ok(rows) => {
                tracing::info!(table = table.name(), rows, strategy = strategy.name(), "Loaded table");
                load.rows = rows;
                load.advance(LoadState::Committed);
            }
            Err(e) => load.fail(e),
        }
    }

    /// Artifact with any column the warehouse table lacks removed
    fn read_stripped(&self, key: &str) -> Result<Table> {
        let name = table_for_key(key)?;
        let table = self.processed.read(key)?;

        let warehouse_columns = self.warehouse.columns(&name)?;
        if warehouse_columns.is_empty() {
            return Err(PipelineError::schema(&name, "table does not exist in the warehouse"));
        }

        let kept: Vec<(&str, &str)> = table
            .column_names()
            .into_iter()
            .filter(|c| warehouse_columns.iter().any(|w| w == c))
            .map(|c| (c, c))
            .collect();
        if kept.len() < table.columns().len() {
            tracing::debug!(table = %name, dropped = table.columns().len() - kept.len(), "Stripping columns unknown to the warehouse");
        }
        table.select(&name, &kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processed::{artifact_key, encode_parquet};
    use crate::schema::require_output_schema;
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use crate::table::Column;
    use std::sync::Arc;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn warehouse() -> SqliteWarehouse {
        let wh = SqliteWarehouse::from_connection(Connection::open_in_memory().unwrap());
        wh.bootstrap().unwrap();
        wh
    }

    fn currency(rows: Vec<Vec<Value>>) -> Table {
        let schema = require_output_schema("dim_currency").unwrap();
        Table::with_rows("dim_currency", schema.columns, rows).unwrap()
    }

    fn count(wh: &SqliteWarehouse, table: &str) -> i64 {
        wh.connection()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_bootstrap_is_idempotent() {
        let wh = warehouse();
        wh.bootstrap().unwrap();
        assert_eq!(
            wh.columns("dim_currency").unwrap(),
            vec!["currency_id", "currency_code", "currency_name"]
        );
        assert!(wh.columns("no_such_table").unwrap().is_empty());
    }

    #[test]
    fn test_empty_artifact_is_skipped_and_others_still_load() {
        let processed = ProcessedStore::new(Arc::new(MemoryObjectStore::new()));
        processed
            .write(&require_output_schema("dim_design").unwrap().empty_table())
            .unwrap();
        processed
            .write(&currency(vec![vec![Value::Integer(1), text("GBP"), text("British Pound")]]))
            .unwrap();

        let mut wh = warehouse();
        let report = Loader::new(&processed, &mut wh).run(&LoadRequest::default()).unwrap();

        assert_eq!(report.skipped(), vec!["dim-design.parquet"]);
        assert_eq!(report.committed(), vec!["dim-currency.parquet"]);
        assert!(report.is_success());
        assert_eq!(count(&wh, "dim_currency"), 1);
    }

    #[test]
    fn test_upsert_updates_existing_key() {
        let processed = ProcessedStore::new(Arc::new(MemoryObjectStore::new()));
        let mut wh = warehouse();
        let mut strategies = HashMap::new();
        strategies.insert("dim_currency".to_string(), LoadStrategy::Upsert);

        processed
            .write(&currency(vec![vec![Value::Integer(1), text("GBP"), Value::Null]]))
            .unwrap();
        Loader::new(&processed, &mut wh)
            .with_strategies(strategies.clone())
            .run(&LoadRequest::default())
            .unwrap();

        processed
            .write(&currency(vec![vec![Value::Integer(1), text("GBP"), text("British Pound")]]))
            .unwrap();
        Loader::new(&processed, &mut wh)
            .with_strategies(strategies)
            .run(&LoadRequest::default())
            .unwrap();

        assert_eq!(count(&wh, "dim_currency"), 1);
        let name: String = wh
            .connection()
            .query_row("SELECT currency_name FROM dim_currency WHERE currency_id = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "British Pound");
    }

    #[test]
    fn test_replace_and_append() {
        let mut wh = warehouse();
        let first = currency(vec![
            vec![Value::Integer(1), text("GBP"), Value::Null],
            vec![Value::Integer(2), text("USD"), Value::Null],
        ]);
        let key = vec!["currency_id".to_string()];
        wh.apply(&first, LoadStrategy::Replace, &key).unwrap();
        wh.apply(&currency(vec![vec![Value::Integer(3), text("EUR"), Value::Null]]), LoadStrategy::Append, &key)
            .unwrap();
        assert_eq!(count(&wh, "dim_currency"), 3);

        wh.apply(&currency(vec![vec![Value::Integer(1), text("GBP"), Value::Null]]), LoadStrategy::Replace, &key)
            .unwrap();
        assert_eq!(count(&wh, "dim_currency"), 1);
    }

    #[test]
    fn test_failed_apply_rolls_back_only_that_table() {
        let mut wh = warehouse();
        let key = vec!["currency_id".to_string()];
        wh.apply(&currency(vec![vec![Value::Integer(1), text("GBP"), Value::Null]]), LoadStrategy::Replace, &key)
            .unwrap();

        // Duplicate key inside one append: the whole table write is rolled back
        let dupes = currency(vec![
            vec![Value::Integer(2), text("USD"), Value::Null],
            vec![Value::Integer(2), text("USD"), Value::Null],
        ]);
        assert!(wh.apply(&dupes, LoadStrategy::Append, &key).is_err());
        assert_eq!(count(&wh, "dim_currency"), 1);
    }

    #[test]
    fn test_columns_unknown_to_warehouse_are_stripped() {
        let objects = Arc::new(MemoryObjectStore::new());
        let processed = ProcessedStore::new(objects.clone());

        let mut table = currency(vec![vec![Value::Integer(1), text("GBP"), text("British Pound")]]);
        table
            .add_column(Column::new("index", DataType::Integer), vec![Value::Integer(0)])
            .unwrap();
        objects
            .put(&artifact_key("dim_currency"), &encode_parquet(&table).unwrap())
            .unwrap();

        let mut wh = warehouse();
        let report = Loader::new(&processed, &mut wh).run(&LoadRequest::default()).unwrap();
        assert_eq!(report.committed(), vec!["dim-currency.parquet"]);
        assert_eq!(count(&wh, "dim_currency"), 1);
    }

    #[test]
    fn test_bad_key_fails_alone() {
        let processed = ProcessedStore::new(Arc::new(MemoryObjectStore::new()));
        processed
            .write(&currency(vec![vec![Value::Integer(1), text("GBP"), Value::Null]]))
            .unwrap();

        let mut wh = warehouse();
        let request: LoadRequest =
            serde_json::from_str(r#"{"Records": ["bogus.parquet", "dim-currency.parquet"]}"#).unwrap();
        let report = Loader::new(&processed, &mut wh).run(&request).unwrap();

        assert_eq!(report.failed(), vec!["bogus.parquet"]);
        assert_eq!(report.committed(), vec!["dim-currency.parquet"]);
        assert!(!report.is_success());
        assert!(report.summary().contains("failed: bogus.parquet"));
    }
}

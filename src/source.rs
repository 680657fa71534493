// 🏭 Source Database - the transactional system we extract from
// Treated as a query capability: latest change time and changed rows per table

use crate::error::{PipelineError, Result};
use crate::schema::{TableSchema, CHANGE_COLUMN};
use crate::table::{DataType, Table, Value};
use crate::watermark::Watermark;
use chrono::NaiveDateTime;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

pub trait SourceDatabase {
    /// Most recent change time of a table, None when it has no rows
    fn latest_update(&self, table: &str) -> Result<Option<NaiveDateTime>>;

    /// Declared columns of every row changed strictly after `after`
    fn rows_updated_after(&self, schema: &TableSchema, after: Watermark) -> Result<ChangedRows>;
}

/// Rows changed after a watermark, plus the newest change time among them
#[derive(Debug, Clone)]
pub struct ChangedRows {
    pub table: Table,
    /// None exactly when `table` is empty
    pub latest: Option<NaiveDateTime>,
}

// ============================================================================
// SQLITE BACKEND
// ============================================================================

pub struct SqliteSource {
    conn: Connection,
}

impl SqliteSource {
    /// Open read-only with a bounded busy timeout
    pub fn open(path: &Path, timeout: Duration) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| PipelineError::connectivity(format!("source {}", path.display()), e))?;
        conn.busy_timeout(timeout)
            .map_err(|e| PipelineError::connectivity("source", e))?;
        Ok(SqliteSource { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        SqliteSource { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Change times are compared chronologically, never as strings
    fn change_time(table: &str, raw: ValueRef<'_>) -> Result<NaiveDateTime> {
        match value_from_sql(raw, DataType::Timestamp, table, CHANGE_COLUMN)? {
            Value::Timestamp(ts) => Ok(ts),
            other => Err(PipelineError::schema(
                table,
                format!("{} is not a timestamp: {:?}", CHANGE_COLUMN, other),
            )),
        }
    }
}

impl SourceDatabase for SqliteSource {
    fn latest_update(&self, table: &str) -> Result<Option<NaiveDateTime>> {
        let target = format!("source table {}", table);
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT \"{}\" FROM \"{}\"", CHANGE_COLUMN, table))
            .map_err(|e| PipelineError::connectivity(&target, e))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| PipelineError::connectivity(&target, e))?;

        let mut latest: Option<NaiveDateTime> = None;
        while let Some(row) = rows.next().map_err(|e| PipelineError::connectivity(&target, e))? {
            let raw = row.get_ref(0).map_err(|e| PipelineError::connectivity(&target, e))?;
            let ts = Self::change_time(table, raw)?;
            if latest.map_or(true, |current| ts > current) {
                latest = Some(ts);
            }
        }

        Ok(latest)
    }

    fn rows_updated_after(&self, schema: &TableSchema, after: Watermark) -> Result<ChangedRows> {
        let target = format!("source table {}", schema.name);
        let columns = schema
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {}, \"{}\" FROM \"{}\"",
            columns, CHANGE_COLUMN, schema.name
        );

        // Coarse cut on the ISO date prefix, which orders the same with ' ' or 'T'
        // separators; the exact chronological comparison happens below
        let mut params = Vec::new();
        if let Watermark::At(ts) = after {
            sql.push_str(&format!(" WHERE substr(\"{}\", 1, 10) >= ?1", CHANGE_COLUMN));
            params.push(ts.date().format("%Y-%m-%d").to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| PipelineError::connectivity(&target, e))?;
        let mut rows = stmt
            .query(params_from_iter(params.iter()))
            .map_err(|e| PipelineError::connectivity(&target, e))?;

        let mut table = schema.empty_table();
        let mut latest: Option<NaiveDateTime> = None;
        let width = schema.columns.len();
        while let Some(row) = rows.next().map_err(|e| PipelineError::connectivity(&target, e))? {
            let raw = row.get_ref(width).map_err(|e| PipelineError::connectivity(&target, e))?;
            let changed = Self::change_time(&schema.name, raw)?;
            if !after.is_before(changed) {
                continue;
            }

            let mut values = Vec::with_capacity(width);
            for (idx, col) in schema.columns.iter().enumerate() {
                let raw = row.get_ref(idx).map_err(|e| PipelineError::connectivity(&target, e))?;
                values.push(value_from_sql(raw, col.data_type, &schema.name, &col.name)?);
            }
            table.push_row(values)?;
            if latest.map_or(true, |current| changed > current) {
                latest = Some(changed);
            }
        }

        Ok(ChangedRows { table, latest })
    }
}

/// Convert a raw SQLite value into the declared column type
pub fn value_from_sql(raw: ValueRef<'_>, data_type: DataType, table: &str, column: &str) -> Result<Value> {
    let mismatch = |what: String| PipelineError::schema(table, format!("{}: {}", column, what));

    match (raw, data_type) {
        (ValueRef::Null, _) => Ok(Value::Null),
        (ValueRef::Integer(i), DataType::Integer) => Ok(Value::Integer(i)),
        (ValueRef::Integer(i), DataType::Real) => Ok(Value::Real(i as f64)),
        (ValueRef::Integer(i), DataType::Boolean) => Ok(Value::Boolean(i != 0)),
        (ValueRef::Real(f), DataType::Real) => Ok(Value::Real(f)),
        (ValueRef::Text(bytes), _) => {
            let text = std::str::from_utf8(bytes).map_err(|e| mismatch(e.to_string()))?;
            Value::parse(text, data_type).map_err(mismatch)
        }
        (other, _) => Err(mismatch(format!(
            "{:?} cannot be read as {}",
            other.data_type(),
            data_type.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{source_schema, SchemaValidator};
    use crate::table::parse_timestamp;

    fn seeded_source() -> SqliteSource {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE currency (
                currency_id INTEGER PRIMARY KEY,
                currency_code TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL
            );
            INSERT INTO currency VALUES (1, 'GBP', '2022-11-03 14:20:49.962', '2022-11-03 14:20:49.962');
            INSERT INTO currency VALUES (2, 'USD', '2022-11-03 14:20:49.962', '2023-01-10 09:00:00.000');",
        )
        .unwrap();
        SqliteSource::from_connection(conn)
    }

    #[test]
    fn test_latest_update_is_chronological() {
        // 'T' sorts after ' ' as text, but 09:00 is earlier than 10:00
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE currency (currency_id INTEGER, currency_code TEXT, last_updated TEXT);
             INSERT INTO currency VALUES (1, 'GBP', '2023-01-10T09:00:00');
             INSERT INTO currency VALUES (2, 'USD', '2023-01-10 10:00:00');",
        )
        .unwrap();
        let source = SqliteSource::from_connection(conn);

        let latest = source.latest_update("currency").unwrap().unwrap();
        assert_eq!(latest.to_string(), "2023-01-10 10:00:00");
    }

    #[test]
    fn test_latest_update_of_empty_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE design (design_id INTEGER, last_updated TEXT);")
            .unwrap();
        let source = SqliteSource::from_connection(conn);
        assert_eq!(source.latest_update("design").unwrap(), None);
    }

    #[test]
    fn test_rows_updated_after_watermark() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE currency (currency_id INTEGER, currency_code TEXT, last_updated TEXT);
             INSERT INTO currency VALUES (1, 'GBP', '2022-11-03 14:20:49.962');
             INSERT INTO currency VALUES (2, 'USD', '2023-01-10 09:00:00');",
        )
        .unwrap();
        let source = SqliteSource::from_connection(conn);
        let schema = source_schema("currency").unwrap();

        let all = source.rows_updated_after(&schema, Watermark::Never).unwrap();
        assert_eq!(all.table.len(), 2);
        assert_eq!(all.table.column_names(), vec!["currency_id", "currency_code"]);
        assert_eq!(all.latest, parse_timestamp("2023-01-10 09:00:00"));

        let cutoff = parse_timestamp("2022-11-03 14:20:49.962").unwrap();
        let newer = source
            .rows_updated_after(&schema, Watermark::At(cutoff))
            .unwrap();
        assert_eq!(newer.table.len(), 1);
        assert_eq!(newer.table.rows()[0][1], Value::Text("USD".to_string()));

        let none = source
            .rows_updated_after(&schema, Watermark::At(parse_timestamp("2023-01-10 09:00:00").unwrap()))
            .unwrap();
        assert!(none.table.is_empty());
        assert_eq!(none.latest, None);
    }

    #[test]
    fn test_date_prefix_filter_keeps_same_day_rows_in_either_format() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE currency (currency_id INTEGER, currency_code TEXT, last_updated TEXT);
             INSERT INTO currency VALUES (1, 'GBP', '2023-01-09 23:00:00');
             INSERT INTO currency VALUES (2, 'USD', '2023-01-10T08:00:00');
             INSERT INTO currency VALUES (3, 'EUR', '2023-01-10 11:30:00');",
        )
        .unwrap();
        let source = SqliteSource::from_connection(conn);
        let schema = source_schema("currency").unwrap();

        let cutoff = parse_timestamp("2023-01-10 09:00:00").unwrap();
        let newer = source.rows_updated_after(&schema, Watermark::At(cutoff)).unwrap();
        assert_eq!(newer.table.len(), 1);
        assert_eq!(newer.table.rows()[0][1], Value::Text("EUR".to_string()));
        assert_eq!(newer.latest, parse_timestamp("2023-01-10 11:30:00"));
    }

    #[test]
    fn test_text_values_are_read_verbatim() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE currency (currency_id INTEGER, currency_code TEXT, last_updated TEXT);
             INSERT INTO currency VALUES (1, '', '2023-01-10 09:00:00');
             INSERT INTO currency VALUES (2, ' USD', '2023-01-10 09:00:00');",
        )
        .unwrap();
        let source = SqliteSource::from_connection(conn);
        let schema = source_schema("currency").unwrap();

        let rows = source.rows_updated_after(&schema, Watermark::Never).unwrap().table;
        assert_eq!(rows.rows()[0][1], Value::Text(String::new()));
        assert_eq!(rows.rows()[1][1], Value::Text(" USD".to_string()));
        assert!(SchemaValidator::ensure(&rows, &schema).is_ok());
    }

    #[test]
    fn test_missing_table_is_a_query_failure() {
        let source = seeded_source();
        let err = source.latest_update("staff").unwrap_err();
        assert!(matches!(err, PipelineError::Connectivity { .. }));
    }
}

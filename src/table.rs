// 🧮 Tables - typed in-memory row sets passed between stages
// Values, columns, and the relational operations the builders need

use crate::error::{PipelineError, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

const TIMESTAMP_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

// ============================================================================
// DATA TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Integer,
    Real,
    Text,
    Boolean,
    /// Calendar date without time of day
    Date,
    /// Time of day without date
    Time,
    /// Date and time of day, no timezone
    Timestamp,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Integer => "integer",
            DataType::Real => "real",
            DataType::Text => "text",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::Time => "time",
            DataType::Timestamp => "timestamp",
        }
    }
}

// ============================================================================
// VALUES
// ============================================================================

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
}

// Reals compare by bit pattern so values can serve as join and dedup keys
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Integer(v) => v.hash(state),
            Value::Real(v) => v.to_bits().hash(state),
            Value::Text(v) => v.hash(state),
            Value::Boolean(v) => v.hash(state),
            Value::Date(v) => v.hash(state),
            Value::Time(v) => v.hash(state),
            Value::Timestamp(v) => v.hash(state),
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Type of a non-null value
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Integer(_) => Some(DataType::Integer),
            Value::Real(_) => Some(DataType::Real),
            Value::Text(_) => Some(DataType::Text),
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Date(_) => Some(DataType::Date),
            Value::Time(_) => Some(DataType::Time),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Calendar date part of a date or timestamp
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
    }

    /// Time-of-day part of a time or timestamp
    pub fn as_time(&self) -> Option<NaiveTime> {
        match self {
            Value::Time(t) => Some(*t),
            Value::Timestamp(ts) => Some(ts.time()),
            _ => None,
        }
    }

    /// Parse the text form of a value.
    ///
    /// Text is kept verbatim, including empty and padded strings. Other types are
    /// trimmed first and empty input is null.
    pub fn parse(text: &str, data_type: DataType) -> std::result::Result<Value, String> {
        let raw = text;
        let text = text.trim();

        match data_type {
            DataType::Text => Ok(Value::Text(raw.to_string())),
            _ if text.is_empty() => Ok(Value::Null),
            DataType::Integer => text
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|e| format!("'{}' is not an integer: {}", text, e)),
            DataType::Real => text
                .parse::<f64>()
                .map(Value::Real)
                .map_err(|e| format!("'{}' is not a number: {}", text, e)),
            DataType::Boolean => match text.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Boolean(true)),
                "false" | "f" | "0" => Ok(Value::Boolean(false)),
                other => Err(format!("'{}' is not a boolean", other)),
            },
            DataType::Date => parse_timestamp(text)
                .map(|ts| ts.date())
                .or_else(|| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok())
                .map(Value::Date)
                .ok_or_else(|| format!("'{}' is not a date", text)),
            DataType::Time => NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
                .map(Value::Time)
                .map_err(|e| format!("'{}' is not a time of day: {}", text, e)),
            DataType::Timestamp => parse_timestamp(text)
                .map(Value::Timestamp)
                .ok_or_else(|| format!("'{}' is not a timestamp", text)),
        }
    }

    /// Text form used by SQL binding and the landing CSV. Null renders empty.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Text(v) => v.clone(),
            Value::Boolean(v) => v.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.format("%H:%M:%S%.f").to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        }
    }
}

/// Parse an ISO 8601-style timestamp with optional fractional seconds
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text.trim(), fmt).ok())
}

// ============================================================================
// COLUMNS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Column {
            name: name.to_string(),
            data_type,
            nullable: false,
        }
    }

    pub fn nullable(name: &str, data_type: DataType) -> Self {
        Column {
            name: name.to_string(),
            data_type,
            nullable: true,
        }
    }
}

// ============================================================================
// TABLE
// ============================================================================

/// Named, ordered columns plus rows in arrival order
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: &str, columns: Vec<Column>) -> Self {
        Table {
            name: name.to_string(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(name: &str, columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut table = Table::new(name, columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn renamed(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(PipelineError::schema(
                &self.name,
                format!(
                    "row has {} values, table has {} columns",
                    row.len(),
                    self.columns.len()
                ),
            ));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| PipelineError::schema(&self.name, format!("missing column {}", name)))
    }

    /// All values of one column, in row order
    pub fn column_values(&self, name: &str) -> Result<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Append a column; `values` must have one entry per row
    pub fn add_column(&mut self, column: Column, values: Vec<Value>) -> Result<()> {
        if self.column_index(&column.name).is_ok() {
            return Err(PipelineError::schema(
                &self.name,
                format!("column {} already exists", column.name),
            ));
        }
        if values.len() != self.rows.len() {
            return Err(PipelineError::schema(
                &self.name,
                format!(
                    "column {} has {} values for {} rows",
                    column.name,
                    values.len(),
                    self.rows.len()
                ),
            ));
        }
        self.columns.push(column);
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Concatenate tables sharing one column layout, preserving row order
    pub fn concat(name: &str, tables: Vec<Table>) -> Result<Table> {
        let mut iter = tables.into_iter();
        let mut out = match iter.next() {
            Some(first) => first.renamed(name),
            None => return Err(PipelineError::empty(name, "no tables to concatenate")),
        };

        for table in iter {
            if table.columns != out.columns {
                return Err(PipelineError::schema(
                    name,
                    format!(
                        "column layout of {} differs: [{}] vs [{}]",
                        table.name,
                        table.column_names().join(", "),
                        out.column_names().join(", ")
                    ),
                ));
            }
            out.rows.extend(table.rows);
        }

        Ok(out)
    }

    /// Keep the last row seen for each key value, at that row's position
    pub fn dedup_keep_last(&self, key: &str) -> Result<Table> {
        let idx = self.column_index(key)?;

        let mut last_seen: HashMap<&Value, usize> = HashMap::new();
        for (i, row) in self.rows.iter().enumerate() {
            last_seen.insert(&row[idx], i);
        }

        let rows = self
            .rows
            .iter()
            .enumerate()
            .filter(|(i, row)| last_seen.get(&row[idx]) == Some(i))
            .map(|(_, row)| row.clone())
            .collect();

        Ok(Table {
            name: self.name.clone(),
            columns: self.columns.clone(),
            rows,
        })
    }

    /// Drop rows identical to an earlier row, keeping first occurrences in order
    pub fn distinct(&self) -> Table {
        let mut seen: HashSet<&Vec<Value>> = HashSet::with_capacity(self.rows.len());
        let rows = self
            .rows
            .iter()
            .filter(|row| seen.insert(*row))
            .cloned()
            .collect();

        Table {
            name: self.name.clone(),
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Left-preserving equality join on named key columns.
    ///
    /// Every right column except `right_key` is appended, renamed through `renames`
    /// (right name, new name). Rows without a match get nulls. Null keys never match.
    pub fn left_join(
        &self,
        right: &Table,
        left_key: &str,
        right_key: &str,
        renames: &[(&str, &str)],
    ) -> Result<Table> {
        let left_idx = self.column_index(left_key)?;
        let right_idx = right.column_index(right_key)?;

        let mut columns = self.columns.clone();
        let mut right_positions = Vec::new();
        for (i, col) in right.columns.iter().enumerate() {
            if i == right_idx {
                continue;
            }
            let name = renames
                .iter()
                .find(|(from, _)| *from == col.name)
                .map(|(_, to)| to.to_string())
                .unwrap_or_else(|| col.name.clone());
            if columns.iter().any(|c| c.name == name) {
                return Err(PipelineError::schema(
                    &self.name,
                    format!("joined column {} from {} collides", name, right.name),
                ));
            }
            columns.push(Column {
                name,
                data_type: col.data_type,
                nullable: true,
            });
            right_positions.push(i);
        }

        let mut lookup: HashMap<&Value, &Vec<Value>> = HashMap::new();
        for row in &right.rows {
            if !row[right_idx].is_null() {
                lookup.insert(&row[right_idx], row);
            }
        }

        let rows = self
            .rows
            .iter()
            .map(|row| {
                let matched = lookup.get(&row[left_idx]);
                let mut out = row.clone();
                for &pos in &right_positions {
                    out.push(matched.map(|m| m[pos].clone()).unwrap_or(Value::Null));
                }
                out
            })
            .collect();

        Ok(Table {
            name: self.name.clone(),
            columns,
            rows,
        })
    }

    /// Project to `(source, target)` column pairs in the given order
    pub fn select(&self, name: &str, projection: &[(&str, &str)]) -> Result<Table> {
        let mut positions = Vec::with_capacity(projection.len());
        let mut columns = Vec::with_capacity(projection.len());
        for (source, target) in projection {
            let idx = self.column_index(source)?;
            positions.push(idx);
            columns.push(Column {
                name: target.to_string(),
                ..self.columns[idx].clone()
            });
        }

        let rows = self
            .rows
            .iter()
            .map(|row| positions.iter().map(|&i| row[i].clone()).collect())
            .collect();

        Ok(Table {
            name: name.to_string(),
            columns,
            rows,
        })
    }
}

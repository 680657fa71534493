// 🗃️ Processed Store - dimension and fact snapshots as Parquet
// One artifact per logical table, overwritten on every transform run

use crate::error::{PipelineError, Result};
use crate::schema::{output_schema, require_output_schema, SchemaValidator, SCHEMA_VERSION};
use crate::storage::ObjectStore;
use crate::table::{Column, DataType, Table, Value};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    Time64MicrosecondArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType as ArrowType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::io::Cursor;
use std::sync::Arc;

const EXTENSION: &str = ".parquet";

/// File metadata entry carrying the declared schema version
pub const SCHEMA_VERSION_KEY: &str = "warehouse_pipeline.schema_version";

/// Days from 0001-01-01 to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

// ============================================================================
// KEY NAMING
// ============================================================================

/// `dim_staff` -> `dim-staff.parquet`
pub fn artifact_key(table: &str) -> String {
    format!("{}{}", table.replace('_', "-"), EXTENSION)
}

/// Inverse of `artifact_key`; only known dimension and fact tables parse
pub fn table_for_key(key: &str) -> Result<String> {
    let file = key.rsplit('/').next().unwrap_or(key);
    let table = file
        .strip_suffix(EXTENSION)
        .map(|stem| stem.replace('-', "_"))
        .ok_or_else(|| PipelineError::InvalidArtifactKey(key.to_string()))?;

    if output_schema(&table).is_none() {
        return Err(PipelineError::InvalidArtifactKey(key.to_string()));
    }
    Ok(table)
}

// ============================================================================
// PARQUET CODEC
// ============================================================================

fn arrow_type(data_type: DataType) -> ArrowType {
    match data_type {
        DataType::Integer => ArrowType::Int64,
        DataType::Real => ArrowType::Float64,
        DataType::Text => ArrowType::Utf8,
        DataType::Boolean => ArrowType::Boolean,
        DataType::Date => ArrowType::Date32,
        DataType::Time => ArrowType::Time64(TimeUnit::Microsecond),
        DataType::Timestamp => ArrowType::Timestamp(TimeUnit::Microsecond, None),
    }
}

fn column_type(arrow: &ArrowType) -> Option<DataType> {
    match arrow {
        ArrowType::Int64 => Some(DataType::Integer),
        ArrowType::Float64 => Some(DataType::Real),
        ArrowType::Utf8 => Some(DataType::Text),
        ArrowType::Boolean => Some(DataType::Boolean),
        ArrowType::Date32 => Some(DataType::Date),
        ArrowType::Time64(TimeUnit::Microsecond) => Some(DataType::Time),
        ArrowType::Timestamp(TimeUnit::Microsecond, None) => Some(DataType::Timestamp),
        _ => None,
    }
}

fn time_micros(t: NaiveTime) -> i64 {
    t.num_seconds_from_midnight() as i64 * 1_000_000 + (t.nanosecond() / 1_000) as i64
}

/// One Arrow array from a table column
fn encode_column(table: &Table, idx: usize) -> Result<ArrayRef> {
    let column = &table.columns()[idx];
    let values = table.rows().iter().map(|row| &row[idx]);
    let mismatch = |v: &Value| {
        PipelineError::codec(
            "parquet",
            table.name(),
            format!("{} holds {:?}, declared {}", column.name, v, column.data_type.name()),
        )
    };

    macro_rules! collect {
        ($pattern:pat => $out:expr) => {
            values
                .map(|v| match v {
                    Value::Null => Ok(None),
                    $pattern => Ok(Some($out)),
                    other => Err(mismatch(other)),
                })
                .collect::<Result<Vec<_>>>()?
        };
    }

    let array: ArrayRef = match column.data_type {
        DataType::Integer => Arc::new(Int64Array::from(collect!(Value::Integer(i) => *i))),
        DataType::Real => Arc::new(Float64Array::from(collect!(Value::Real(f) => *f))),
        DataType::Text => Arc::new(StringArray::from(collect!(Value::Text(s) => s.clone()))),
        DataType::Boolean => Arc::new(BooleanArray::from(collect!(Value::Boolean(b) => *b))),
        DataType::Date => Arc::new(Date32Array::from(
            collect!(Value::Date(d) => d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE),
        )),
        DataType::Time => Arc::new(Time64MicrosecondArray::from(collect!(Value::Time(t) => time_micros(*t)))),
        DataType::Timestamp => Arc::new(TimestampMicrosecondArray::from(
            collect!(Value::Timestamp(ts) => ts.and_utc().timestamp_micros()),
        )),
    };
    Ok(array)
}

pub fn encode_parquet(table: &Table) -> Result<Vec<u8>> {
    let key = table.name().to_string();
    let fail = |e: &dyn std::fmt::Display| PipelineError::codec("parquet", &key, e);

    let fields: Vec<Field> = table
        .columns()
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.data_type), c.nullable))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let arrays = (0..table.columns().len())
        .map(|idx| encode_column(table, idx))
        .collect::<Result<Vec<_>>>()?;
    let batch = RecordBatch::try_new(schema.clone(), arrays).map_err(|e| fail(&e))?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![KeyValue {
            key: SCHEMA_VERSION_KEY.to_string(),
            value: Some(SCHEMA_VERSION.to_string()),
        }]))
        .build();

    let mut cursor = Cursor::new(Vec::<u8>::new());
    let mut writer = ArrowWriter::try_new(&mut cursor, schema, Some(props)).map_err(|e| fail(&e))?;
    if batch.num_rows() > 0 {
        writer.write(&batch).map_err(|e| fail(&e))?;
    }
    writer.close().map_err(|e| fail(&e))?;
    Ok(cursor.into_inner())
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, key: &str, name: &str) -> Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| PipelineError::codec("parquet", key, format!("column '{}' has an unexpected array type", name)))
}

/// Values of one Arrow column in row order
fn decode_column(array: &ArrayRef, data_type: DataType, key: &str, name: &str) -> Result<Vec<Value>> {
    let bad = |what: &str| PipelineError::codec("parquet", key, format!("column '{}': {}", name, what));

    macro_rules! read {
        ($array:ty, |$v:ident| $convert:expr) => {{
            let typed = downcast::<$array>(array, key, name)?;
            (0..typed.len())
                .map(|i| {
                    if typed.is_null(i) {
                        return Ok(Value::Null);
                    }
                    let $v = typed.value(i);
                    $convert
                })
                .collect::<Result<Vec<_>>>()
        }};
    }

    match data_type {
        DataType::Integer => read!(Int64Array, |v| Ok(Value::Integer(v))),
        DataType::Real => read!(Float64Array, |v| Ok(Value::Real(v))),
        DataType::Text => read!(StringArray, |v| Ok(Value::Text(v.to_string()))),
        DataType::Boolean => read!(BooleanArray, |v| Ok(Value::Boolean(v))),
        DataType::Date => read!(Date32Array, |v| NaiveDate::from_num_days_from_ce_opt(v + UNIX_EPOCH_DAYS_FROM_CE)
            .map(Value::Date)
            .ok_or_else(|| bad("date out of range"))),
        DataType::Time => read!(Time64MicrosecondArray, |v| NaiveTime::from_num_seconds_from_midnight_opt(
            (v / 1_000_000) as u32,
            ((v % 1_000_000) * 1_000) as u32,
        )
        .map(Value::Time)
        .ok_or_else(|| bad("time of day out of range"))),
        DataType::Timestamp => read!(TimestampMicrosecondArray, |v| DateTime::from_timestamp_micros(v)
            .map(|dt| Value::Timestamp(dt.naive_utc()))
            .ok_or_else(|| bad("timestamp out of range"))),
    }
}

/// Decode an artifact into table `name`, checking the stored schema version
pub fn decode_parquet(name: &str, key: &str, bytes: Vec<u8>) -> Result<Table> {
    let fail = |e: &dyn std::fmt::Display| PipelineError::codec("parquet", key, e);

    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes)).map_err(|e| fail(&e))?;

    let version = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|kvs| kvs.iter().find(|kv| kv.key == SCHEMA_VERSION_KEY))
        .and_then(|kv| kv.value.clone());
    if let Some(version) = version {
        if version != SCHEMA_VERSION.to_string() {
            return Err(PipelineError::schema(
                name,
                format!("{} was written with schema version {}, expected {}", key, version, SCHEMA_VERSION),
            ));
        }
    }

    let columns = builder
        .schema()
        .fields()
        .iter()
        .map(|field| {
            column_type(field.data_type())
                .map(|data_type| Column {
                    name: field.name().clone(),
                    data_type,
                    nullable: field.is_nullable(),
                })
                .ok_or_else(|| fail(&format!("unsupported column type {} for {}", field.data_type(), field.name())))
        })
        .collect::<Result<Vec<_>>>()?;

    let reader = builder.build().map_err(|e| fail(&e))?;
    let mut table = Table::new(name, columns.clone());
    for batch in reader {
        let batch = batch.map_err(|e| fail(&e))?;
        let decoded = columns
            .iter()
            .enumerate()
            .map(|(idx, col)| decode_column(batch.column(idx), col.data_type, key, &col.name))
            .collect::<Result<Vec<_>>>()?;

        for row in 0..batch.num_rows() {
            table.push_row(decoded.iter().map(|values| values[row].clone()).collect())?;
        }
    }

    Ok(table)
}

// ============================================================================
// PROCESSED STORE
// ============================================================================

pub struct ProcessedStore {
    store: Arc<dyn ObjectStore>,
}

impl ProcessedStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        ProcessedStore { store }
    }

    /// Overwrite the artifact for `table`, returning its key
    pub fn write(&self, table: &Table) -> Result<String> {
        let schema = require_output_schema(table.name())?;
        SchemaValidator::ensure(table, &schema)?;

        let key = artifact_key(table.name());
        self.store.put(&key, &encode_parquet(table)?)?;
        tracing::info!(table = table.name(), key = %key, rows = table.len(), "Wrote processed artifact");
        Ok(key)
    }

    /// Artifact at `key`; a missing object is an error
    pub fn read(&self, key: &str) -> Result<Table> {
        let name = table_for_key(key)?;
        let bytes = self
            .store
            .get(key)?
            .ok_or_else(|| PipelineError::storage(key, "no such processed artifact"))?;
        decode_parquet(&name, key, bytes)
    }

    /// Current snapshot of `table`, if one was ever written
    pub fn read_table(&self, table: &str) -> Result<Option<Table>> {
        let key = artifact_key(table);
        if !self.store.exists(&key)? {
            return Ok(None);
        }
        self.read(&key).map(Some)
    }

    /// Every artifact key in the store
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list("")?
            .into_iter()
            .filter(|k| k.ends_with(EXTENSION))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use crate::table::parse_timestamp;

    #[test]
    fn test_key_naming_is_reversible() {
        for table in crate::schema::OUTPUT_TABLES {
            assert_eq!(table_for_key(&artifact_key(table)).unwrap(), table);
        }
        assert_eq!(artifact_key("dim_staff"), "dim-staff.parquet");
        assert!(table_for_key("dim-staff.csv").is_err());
        assert!(table_for_key("dim-unknown.parquet").is_err());
    }

    #[test]
    fn test_round_trip_every_column_type() {
        let columns = vec![
            Column::new("id", DataType::Integer),
            Column::nullable("amount", DataType::Real),
            Column::nullable("note", DataType::Text),
            Column::new("paid", DataType::Boolean),
            Column::new("due", DataType::Date),
            Column::new("at_time", DataType::Time),
            Column::nullable("stamp", DataType::Timestamp),
        ];
        let ts = parse_timestamp("2022-11-03 14:20:52.187").unwrap();
        let table = Table::with_rows(
            "fact_payment",
            columns,
            vec![
                vec![
                    Value::Integer(1),
                    Value::Real(552548.62),
                    Value::Text("first".to_string()),
                    Value::Boolean(true),
                    Value::Date(ts.date()),
                    Value::Time(ts.time()),
                    Value::Timestamp(ts),
                ],
                vec![
                    Value::Integer(2),
                    Value::Null,
                    Value::Null,
                    Value::Boolean(false),
                    Value::Date(NaiveDate::from_ymd_opt(1969, 12, 31).unwrap()),
                    Value::Time(NaiveTime::from_hms_opt(0, 0, 0).unwrap()),
                    Value::Null,
                ],
            ],
        )
        .unwrap();

        let bytes = encode_parquet(&table).unwrap();
        let decoded = decode_parquet("fact_payment", "fact-payment.parquet", bytes).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn test_store_write_read_and_list() {
        let processed = ProcessedStore::new(Arc::new(MemoryObjectStore::new()));
        let schema = require_output_schema("dim_payment_type").unwrap();
        let table = Table::with_rows(
            "dim_payment_type",
            schema.columns.clone(),
            vec![vec![Value::Integer(1), Value::Text("SALES_RECEIPT".to_string())]],
        )
        .unwrap();

        let key = processed.write(&table).unwrap();
        assert_eq!(key, "dim-payment-type.parquet");
        assert_eq!(processed.read(&key).unwrap(), table);
        assert_eq!(processed.list().unwrap(), vec![key]);
        assert_eq!(processed.read_table("dim_date").unwrap(), None);
    }

    #[test]
    fn test_column_chunks_are_snappy_compressed() {
        use parquet::file::reader::{FileReader, SerializedFileReader};

        let schema = require_output_schema("dim_payment_type").unwrap();
        let table = Table::with_rows(
            "dim_payment_type",
            schema.columns.clone(),
            vec![vec![Value::Integer(1), Value::Text("SALES_RECEIPT".to_string())]],
        )
        .unwrap();

        let reader = SerializedFileReader::new(Bytes::from(encode_parquet(&table).unwrap())).unwrap();
        let row_group = reader.metadata().row_group(0);
        for column in row_group.columns() {
            assert_eq!(column.compression(), Compression::SNAPPY);
        }
    }

    #[test]
    fn test_empty_table_round_trips() {
        let table = require_output_schema("dim_design").unwrap().empty_table();
        let bytes = encode_parquet(&table).unwrap();
        let decoded = decode_parquet("dim_design", "dim-design.parquet", bytes).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.columns(), table.columns());
    }

    #[test]
    fn test_write_rejects_undeclared_shape() {
        let processed = ProcessedStore::new(Arc::new(MemoryObjectStore::new()));
        let table = Table::new("dim_design", vec![Column::new("design_id", DataType::Integer)]);
        assert!(matches!(processed.write(&table), Err(PipelineError::SchemaMismatch { .. })));
    }
}

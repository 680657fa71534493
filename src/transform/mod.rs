// 🔄 Transform Stage - rebuild the dimensions and facts affected by changed source tables
// Landing batches in, Parquet snapshots out

pub mod date_dim;
pub mod dimensions;
pub mod facts;

use crate::error::{PipelineError, Result, TableFailure};
use crate::landing::LandingArea;
use crate::processed::ProcessedStore;
use crate::schema::TRACKED_TABLES;
use crate::table::Table;
use date_dim::{build_date_dimension, DATE_COLUMNS};
use dimensions::DIMENSION_SOURCES;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `{"updates": [table, ...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    #[serde(default)]
    pub updates: Vec<String>,
}

impl TransformRequest {
    fn touches(&self, sources: &[&str]) -> bool {
        sources.iter().any(|s| self.updates.iter().any(|u| u == s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSkip {
    pub table: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransformReport {
    /// Processed artifact keys written this run
    pub produced: Vec<String>,
    pub skipped: Vec<TableSkip>,
    pub failed: Vec<TableFailure>,
}

impl TransformReport {
    fn record(&mut self, table: &str, outcome: Result<String>) {
        match outcome {
            Ok(key) => self.produced.push(key),
            Err(e) if e.is_recoverable() => {
                tracing::warn!(table, reason = %e, "Skipping table");
                self.skipped.push(TableSkip {
                    table: table.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                tracing::error!(table, error = %e, "Table build failed");
                self.failed.push(TableFailure::new(table, &e));
            }
        }
    }

    pub fn summary(&self) -> String {
        let mut summary = format!("produced {} artifact(s)", self.produced.len());
        if !self.skipped.is_empty() {
            let skipped: Vec<&str> = self.skipped.iter().map(|s| s.table.as_str()).collect();
            summary.push_str(&format!("; skipped: {}", skipped.join(", ")));
        }
        if !self.failed.is_empty() {
            let failed: Vec<&str> = self.failed.iter().map(|f| f.table.as_str()).collect();
            summary.push_str(&format!("; failed: {}", failed.join(", ")));
        }
        summary
    }
}

// ============================================================================
// RAW TABLE CACHE
// ============================================================================

/// Each source table is unified at most once per run
struct RawTables<'a> {
    landing: &'a LandingArea,
    tables: HashMap<String, Result<Table>>,
}

impl<'a> RawTables<'a> {
    fn new(landing: &'a LandingArea) -> Self {
        RawTables {
            landing,
            tables: HashMap::new(),
        }
    }

    /// Unify each table not yet cached. Failures are cached too and surface from `peek`.
    fn prime(&mut self, tables: &[&str]) {
        for table in tables {
            if !self.tables.contains_key(*table) {
                let unified = self.landing.unify(table);
                self.tables.insert(table.to_string(), unified);
            }
        }
    }

    fn peek(&self, table: &str) -> Result<&Table> {
        match self.tables.get(table) {
            Some(result) => result.as_ref().map_err(Clone::clone),
            None => Err(PipelineError::empty(table, "not unified in this run")),
        }
    }
}

// ============================================================================
// TRANSFORMER
// ============================================================================

pub struct Transformer<'a> {
    landing: &'a LandingArea,
    processed: &'a ProcessedStore,
}

impl<'a> Transformer<'a> {
    pub fn new(landing: &'a LandingArea, processed: &'a ProcessedStore) -> Self {
        Transformer { landing, processed }
    }

    /// Rebuild only the outputs whose sources appear in `request.updates`.
    ///
    /// A coverage violation aborts the whole stage; any other per-table error
    /// is reported and the remaining tables are still built.
    pub fn run(&self, request: &TransformRequest) -> Result<TransformReport> {
        for unknown in request.updates.iter().filter(|u| !TRACKED_TABLES.contains(&u.as_str())) {
            tracing::warn!(table = %unknown, "Ignoring update for an untracked table");
        }

        let mut raw = RawTables::new(self.landing);
        let mut report = TransformReport::default();

        for (dimension, sources) in DIMENSION_SOURCES {
            if !request.touches(sources) {
                continue;
            }
            raw.prime(sources);
            let outcome = self
                .build_dimension(dimension, &raw)
                .and_then(|table| self.processed.write(&table));
            report.record(dimension, outcome);
        }

        let requested_facts: Vec<(&str, &str)> = facts::fact_sources()
            .filter(|(_, source)| request.touches(&[*source]))
            .collect();
        if !requested_facts.is_empty() {
            self.build_facts(&requested_facts, &mut raw, &mut report)?;
        }

        tracing::info!(
            produced = report.produced.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "Transform complete"
        );
        Ok(report)
    }

    fn build_dimension(&self, dimension: &str, raw: &RawTables<'_>) -> Result<Table> {
        match dimension {
            "dim_counterparty" => dimensions::build_dim_counterparty(raw.peek("counterparty")?, raw.peek("address")?),
            "dim_currency" => dimensions::build_dim_currency(raw.peek("currency")?),
            "dim_design" => dimensions::build_dim_design(raw.peek("design")?),
            "dim_location" => dimensions::build_dim_location(raw.peek("address")?),
            "dim_payment_type" => dimensions::build_dim_payment_type(raw.peek("payment_type")?),
            "dim_staff" => dimensions::build_dim_staff(raw.peek("staff")?, raw.peek("department")?),
            "dim_transaction" => dimensions::build_dim_transaction(raw.peek("transaction")?),
            other => Err(PipelineError::schema(other, "no builder for this dimension")),
        }
    }

    /// dim_date first, from every fact source with landed data, then the requested facts
    fn build_facts(&self, requested: &[(&str, &str)], raw: &mut RawTables<'_>, report: &mut TransformReport) -> Result<()> {
        let fact_sources: Vec<&str> = DATE_COLUMNS.iter().map(|(source, _)| *source).collect();
        raw.prime(&fact_sources);

        let available: Vec<&Table> = fact_sources.iter().filter_map(|s| raw.peek(s).ok()).collect();
        if available.is_empty() {
            for (fact, source) in requested {
                report.record(fact, Err(PipelineError::empty(*source, "no landed fact source data")));
            }
            return Ok(());
        }

        let dates = match self
            .processed
            .read_table("dim_date")
            .and_then(|prior| build_date_dimension(prior.as_ref(), &available))
        {
            Ok(dates) => dates,
            Err(e) => {
                // Facts cannot be keyed without the date dimension
                report.record("dim_date", Err(e.clone()));
                for (fact, _) in requested {
                    report.record(fact, Err(e.clone()));
                }
                return Ok(());
            }
        };
        let written = dates.to_table().and_then(|table| self.processed.write(&table));
        report.record("dim_date", written);

        for (fact, source) in requested {
            let outcome = raw
                .peek(source)
                .and_then(|table| facts::build_fact(fact, table, &dates));
            match outcome {
                Err(e @ PipelineError::CoverageViolation { .. }) => return Err(e),
                outcome => report.record(fact, outcome.and_then(|table| self.processed.write(&table))),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::source_schema;
    use crate::storage::MemoryObjectStore;
    use crate::table::{parse_timestamp, DataType, Value};
    use std::sync::Arc;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn land(landing: &LandingArea, table: &str, rows: Vec<Vec<Value>>, at: &str) {
        let schema = source_schema(table).unwrap();
        let batch = Table::with_rows(table, schema.columns, rows).unwrap();
        landing.write_batch(&batch, parse_timestamp(at).unwrap()).unwrap();
    }

    fn payment_row(id: i64, created: &str, paid_on: &str) -> Vec<Value> {
        let ts = Value::parse(created, DataType::Timestamp).unwrap();
        vec![
            Value::Integer(id),
            ts.clone(),
            ts,
            Value::Integer(id),
            Value::Integer(15),
            Value::Real(100.0),
            Value::Integer(1),
            Value::Integer(3),
            Value::Boolean(false),
            Value::parse(paid_on, DataType::Date).unwrap(),
        ]
    }

    fn stores() -> (LandingArea, ProcessedStore) {
        (
            LandingArea::new(Arc::new(MemoryObjectStore::new())),
            ProcessedStore::new(Arc::new(MemoryObjectStore::new())),
        )
    }

    #[test]
    fn test_raw_tables_keep_the_first_outcome_for_the_run() {
        let landing = LandingArea::new(Arc::new(MemoryObjectStore::new()));
        let mut raw = RawTables::new(&landing);

        raw.prime(&["currency"]);
        assert!(raw.peek("currency").unwrap_err().is_recoverable());

        land(&landing, "currency", vec![vec![Value::Integer(1), text("GBP")]], "2024-01-01 00:00:00");
        raw.prime(&["currency"]);
        assert!(raw.peek("currency").is_err());
        assert!(raw.peek("staff").is_err());

        let mut fresh = RawTables::new(&landing);
        fresh.prime(&["currency"]);
        assert_eq!(fresh.peek("currency").unwrap().len(), 1);
    }

    #[test]
    fn test_request_payload_shape() {
        let request: TransformRequest = serde_json::from_str(r#"{"updates": ["currency", "staff"]}"#).unwrap();
        assert_eq!(request.updates, vec!["currency", "staff"]);
        let empty: TransformRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.updates.is_empty());
    }

    #[test]
    fn test_only_dependent_outputs_are_rebuilt() {
        let (landing, processed) = stores();
        land(&landing, "currency", vec![vec![Value::Integer(1), text("GBP")]], "2024-01-01 00:00:00");

        let report = Transformer::new(&landing, &processed)
            .run(&TransformRequest {
                updates: vec!["currency".to_string()],
            })
            .unwrap();

        assert_eq!(report.produced, vec!["dim-currency.parquet".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(processed.list().unwrap(), vec!["dim-currency.parquet".to_string()]);
    }

    #[test]
    fn test_missing_reference_table_fails_only_that_dimension() {
        let (landing, processed) = stores();
        land(
            &landing,
            "staff",
            vec![vec![
                Value::Integer(1),
                text("Jeremie"),
                text("Franey"),
                Value::Integer(2),
                text("jeremie.franey@terrifictotes.com"),
            ]],
            "2024-01-01 00:00:00",
        );
        land(&landing, "design", vec![vec![Value::Integer(8), text("Wooden"), text("/usr"), text("wooden-20220717-npgz.json")]], "2024-01-01 00:00:00");

        let report = Transformer::new(&landing, &processed)
            .run(&TransformRequest {
                updates: vec!["staff".to_string(), "design".to_string()],
            })
            .unwrap();

        // department never landed: dim_staff is skipped as empty input
        assert_eq!(report.produced, vec!["dim-design.parquet".to_string()]);
        assert_eq!(report.skipped[0].table, "dim_staff");
    }

    #[test]
    fn test_fact_update_rebuilds_date_dimension_first() {
        let (landing, processed) = stores();
        land(
            &landing,
            "payment",
            vec![
                payment_row(1, "2024-01-05 10:00:00", "2024-01-05"),
                payment_row(2, "2024-01-03 11:30:00", "2024-01-05"),
            ],
            "2024-01-06 00:00:00",
        );

        let report = Transformer::new(&landing, &processed)
            .run(&TransformRequest {
                updates: vec!["payment".to_string()],
            })
            .unwrap();

        assert_eq!(
            report.produced,
            vec!["dim-date.parquet".to_string(), "fact-payment.parquet".to_string()]
        );
        let dim_date = processed.read("dim-date.parquet").unwrap();
        assert_eq!(dim_date.len(), 2);
        let fact = processed.read("fact-payment.parquet").unwrap();
        assert_eq!(fact.rows()[1][2], Value::Integer(1));
    }

    #[test]
    fn test_date_ids_survive_later_runs() {
        let (landing, processed) = stores();
        let transformer = Transformer::new(&landing, &processed);
        let request = TransformRequest {
            updates: vec!["payment".to_string()],
        };

        land(&landing, "payment", vec![payment_row(1, "2024-01-05 10:00:00", "2024-01-05")], "2024-01-06 00:00:00");
        transformer.run(&request).unwrap();

        land(&landing, "payment", vec![payment_row(2, "2024-01-01 10:00:00", "2024-01-01")], "2024-01-07 00:00:00");
        transformer.run(&request).unwrap();

        let dim = date_dim::DateDimension::from_table(&processed.read("dim-date.parquet").unwrap()).unwrap();
        let day = |s: &str| chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        assert_eq!(dim.id_of(day("2024-01-05")), Some(1));
        assert_eq!(dim.id_of(day("2024-01-01")), Some(2));
    }
}

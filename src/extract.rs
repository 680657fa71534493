// 📤 Incremental Extractor - watermark-gated change capture
// Source -> landing batches, one table at a time, watermarks committed last

use crate::error::{Result, TableFailure};
use crate::landing::LandingArea;
use crate::schema::{require_source_schema, SchemaValidator, TRACKED_TABLES};
use crate::source::SourceDatabase;
use crate::transform::TransformRequest;
use crate::watermark::{StagedWatermark, Watermark, WatermarkStore};
use chrono::NaiveDateTime;
use serde::Serialize;
use uuid::Uuid;

/// Outcome of one extraction cycle
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub run_id: Uuid,
    pub run_at: NaiveDateTime,
    /// Tables that landed a batch and advanced their watermark
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<TableFailure>,
    pub batches: Vec<String>,
}

impl ExtractionReport {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Downstream signal listing the tables that changed
    pub fn transform_request(&self) -> TransformRequest {
        TransformRequest {
            updates: self.changed.clone(),
        }
    }

    pub fn summary(&self) -> String {
        let mut summary = if self.changed.is_empty() {
            "no new data".to_string()
        } else {
            format!("new data in {}", self.changed.join(", "))
        };
        if !self.failed.is_empty() {
            let failed: Vec<&str> = self.failed.iter().map(|f| f.table.as_str()).collect();
            summary.push_str(&format!("; failed: {}", failed.join(", ")));
        }
        summary
    }
}

pub struct Extractor<'a> {
    source: &'a dyn SourceDatabase,
    landing: &'a LandingArea,
    watermarks: &'a WatermarkStore,
    tables: Vec<String>,
    run_id: Uuid,
}

impl<'a> Extractor<'a> {
    pub fn new(source: &'a dyn SourceDatabase, landing: &'a LandingArea, watermarks: &'a WatermarkStore) -> Self {
        Extractor {
            source,
            landing,
            watermarks,
            tables: TRACKED_TABLES.iter().map(|t| t.to_string()).collect(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Restrict the cycle to a subset of tracked tables
    pub fn with_tables(mut self, tables: &[&str]) -> Self {
        self.tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn run(&self) -> Result<ExtractionReport> {
        self.run_at(chrono::Utc::now().naive_utc())
    }

    /// One cycle labelled `run_at`. Only an unusable watermark store fails the whole cycle.
    pub fn run_at(&self, run_at: NaiveDateTime) -> Result<ExtractionReport> {
        let marks = self.watermarks.load()?;

        let mut report = ExtractionReport {
            run_id: self.run_id,
            run_at,
            changed: Vec::new(),
            unchanged: Vec::new(),
            failed: Vec::new(),
            batches: Vec::new(),
        };
        let mut staged = Vec::new();

        for table in &self.tables {
            let watermark = marks.get(table).copied().unwrap_or(Watermark::Never);

            match self.extract_table(table, watermark, run_at) {
                Ok(Some((key, update))) => {
                    report.batches.push(key);
                    staged.push(update);
                }
                Ok(None) => {
                    tracing::info!(table = %table, watermark = %watermark, "No new rows");
                    report.unchanged.push(table.clone());
                }
                Err(e) => {
                    tracing::error!(table = %table, error = %e, "Extraction failed");
                    report.failed.push(TableFailure::new(table, &e));
                }
            }
        }

        let outcome = self.watermarks.commit(&staged)?;
        report.changed = outcome.advanced;
        for table in outcome.conflicts {
            report.failed.push(TableFailure {
                table,
                reason: "watermark changed during the run".to_string(),
            });
        }

        tracing::info!(
            changed = report.changed.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            "Extraction cycle complete"
        );
        Ok(report)
    }

    /// Land rows newer than `watermark`; None when the table has not moved
    fn extract_table(
        &self,
        table: &str,
        watermark: Watermark,
        run_at: NaiveDateTime,
    ) -> Result<Option<(String, StagedWatermark)>> {
        let schema = require_source_schema(table)?;

        match self.source.latest_update(table)? {
            Some(latest) if watermark.is_before(latest) => {}
            _ => return Ok(None),
        }

        // The new watermark is the newest row actually landed, never the earlier latest_update reading
        let changed = self.source.rows_updated_after(&schema, watermark)?;
        let Some(landed_up_to) = changed.latest else {
            return Ok(None);
        };
        SchemaValidator::ensure(&changed.table, &schema)?;
        let key = self.landing.write_batch(&changed.table, run_at)?;

        Ok(Some((
            key,
            StagedWatermark {
                table: table.to_string(),
                expected: watermark,
                new: Watermark::At(landed_up_to),
            },
        )))
    }
}

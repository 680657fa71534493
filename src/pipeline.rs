// 🚦 Pipeline - stage wiring, run spans and the status-code exit contract
// Each stage is callable alone; `run_chain` goes extract -> transform -> load

use crate::config::Config;
use crate::error::Result;
use crate::extract::{ExtractionReport, Extractor};
use crate::landing::LandingArea;
use crate::processed::ProcessedStore;
use crate::source::{SourceDatabase, SqliteSource};
use crate::storage::{LocalObjectStore, ObjectStore};
use crate::transform::{TransformReport, TransformRequest, Transformer};
use crate::warehouse::{LoadReport, LoadRequest, Loader, SqliteWarehouse, Warehouse};
use crate::watermark::WatermarkStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Span;
use uuid::Uuid;

// ============================================================================
// EXIT CONTRACT
// ============================================================================

/// `{"statusCode": 200|500, "body": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl StageResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        StageResponse {
            status_code: 200,
            body: body.into(),
        }
    }

    pub fn failure(body: impl Into<String>) -> Self {
        StageResponse {
            status_code: 500,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }

    /// Map a stage outcome onto the contract, logging failures at the boundary
    pub fn from_stage<R: StageOutcome>(stage: &str, result: &Result<R>) -> Self {
        match result {
            Ok(report) if report.succeeded() => Self::ok(format!("{}: {}", stage, report.summary())),
            Ok(report) => {
                tracing::warn!(stage, summary = %report.summary(), "Stage finished with failures");
                Self::failure(format!("{}: {}", stage, report.summary()))
            }
            Err(e) => {
                tracing::error!(stage, error = %e, "Stage failed");
                Self::failure(format!("{} failed: {}", stage, e))
            }
        }
    }
}

/// A stage report that can be judged and summarised
pub trait StageOutcome {
    fn succeeded(&self) -> bool;
    fn summary(&self) -> String;
}

impl StageOutcome for ExtractionReport {
    fn succeeded(&self) -> bool {
        !self.is_partial()
    }

    fn summary(&self) -> String {
        ExtractionReport::summary(self)
    }
}

impl StageOutcome for TransformReport {
    fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    fn summary(&self) -> String {
        TransformReport::summary(self)
    }
}

impl StageOutcome for LoadReport {
    fn succeeded(&self) -> bool {
        self.is_success()
    }

    fn summary(&self) -> String {
        LoadReport::summary(self)
    }
}

fn stage_span(stage: &'static str) -> (Uuid, Span) {
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("stage", stage, %run_id);
    (run_id, span)
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    config: Config,
    landing: LandingArea,
    processed: ProcessedStore,
    watermarks: WatermarkStore,
}

impl Pipeline {
    /// Local-directory storage areas as configured
    pub fn open(config: Config) -> Result<Self> {
        let landing = Arc::new(LocalObjectStore::open(&config.storage.landing_dir)?);
        let processed = Arc::new(LocalObjectStore::open(&config.storage.processed_dir)?);
        let state = Arc::new(LocalObjectStore::open(&config.storage.state_dir)?);
        Ok(Self::with_stores(config, landing, processed, state))
    }

    pub fn with_stores(
        config: Config,
        landing: Arc<dyn ObjectStore>,
        processed: Arc<dyn ObjectStore>,
        state: Arc<dyn ObjectStore>,
    ) -> Self {
        let watermarks = WatermarkStore::new(state, &config.storage.watermark_key);
        Pipeline {
            landing: LandingArea::new(landing),
            processed: ProcessedStore::new(processed),
            watermarks,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------------

    pub fn extract(&self) -> Result<ExtractionReport> {
        let (run_id, span) = stage_span("extract");
        let _enter = span.enter();

        let source = SqliteSource::open(&self.config.source.path, self.config.source.timeout())?;
        self.extract_with(&source, run_id)
    }

    /// Extraction against any source; `run_id` labels the report
    pub fn extract_with(&self, source: &dyn SourceDatabase, run_id: Uuid) -> Result<ExtractionReport> {
        let report = Extractor::new(source, &self.landing, &self.watermarks)
            .with_run_id(run_id)
            .run()?;
        if report.is_partial() {
            tracing::warn!(failed = report.failed.len(), "Extraction was partial");
        }
        Ok(report)
    }

    pub fn transform(&self, request: &TransformRequest) -> Result<TransformReport> {
        let (_, span) = stage_span("transform");
        let _enter = span.enter();

        Transformer::new(&self.landing, &self.processed).run(request)
    }

    pub fn load(&self, request: &LoadRequest) -> Result<LoadReport> {
        let (_, span) = stage_span("load");
        let _enter = span.enter();

        let mut warehouse =
            SqliteWarehouse::open(&self.config.warehouse.path, self.config.warehouse.timeout())?;
        warehouse.bootstrap()?;
        self.load_into(&mut warehouse, request)
    }

    pub fn load_into<W: Warehouse>(&self, warehouse: &mut W, request: &LoadRequest) -> Result<LoadReport> {
        Loader::new(&self.processed, warehouse)
            .with_strategies(self.config.load.strategies.clone())
            .run(request)
    }

    // ------------------------------------------------------------------------
    // Exit-contract entry points
    // ------------------------------------------------------------------------

    pub fn run_extract(&self) -> StageResponse {
        StageResponse::from_stage("extract", &self.extract())
    }

    pub fn run_transform(&self, request: &TransformRequest) -> StageResponse {
        StageResponse::from_stage("transform", &self.transform(request))
    }

    pub fn run_load(&self, request: &LoadRequest) -> StageResponse {
        StageResponse::from_stage("load", &self.load(request))
    }

    /// Extract, then transform the changed tables, then load what was produced
    pub fn run_chain(&self) -> StageResponse {
        self.chain(|| self.extract(), |request| self.load(request))
    }

    /// Chained run against explicit source and warehouse connections
    pub fn run_chain_with<W: Warehouse>(&self, source: &dyn SourceDatabase, warehouse: &mut W) -> StageResponse {
        self.chain(
            || {
                let (run_id, span) = stage_span("extract");
                let _enter = span.enter();
                self.extract_with(source, run_id)
            },
            |request| {
                let (_, span) = stage_span("load");
                let _enter = span.enter();
                self.load_into(warehouse, request)
            },
        )
    }

    fn chain(
        &self,
        extract: impl FnOnce() -> Result<ExtractionReport>,
        load: impl FnOnce(&LoadRequest) -> Result<LoadReport>,
    ) -> StageResponse {
        let extracted = extract();
        let mut responses = vec![StageResponse::from_stage("extract", &extracted)];

        // A partial extraction still carries the tables that did advance
        if let Ok(report) = &extracted {
            if report.has_changes() {
                let transformed = self.transform(&report.transform_request());
                responses.push(StageResponse::from_stage("transform", &transformed));

                if let Ok(report) = &transformed {
                    if !report.produced.is_empty() {
                        let loaded = load(&LoadRequest::for_keys(report.produced.clone()));
                        responses.push(StageResponse::from_stage("load", &loaded));
                    }
                }
            }
        }

        let body = responses
            .iter()
            .map(|r| r.body.as_str())
            .collect::<Vec<_>>()
            .join(" | ");
        if responses.iter().all(StageResponse::is_success) {
            StageResponse::ok(body)
        } else {
            StageResponse::failure(body)
        }
    }
}

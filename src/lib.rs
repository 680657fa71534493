// Warehouse Pipeline - Core Library
// Incremental extraction, dimensional transform and warehouse load, exposed for the CLI, API server and tests

pub mod config;
pub mod error;
pub mod extract;
pub mod landing;
pub mod pipeline;
pub mod processed;
pub mod schema;
pub mod source;
pub mod storage;
pub mod table;
pub mod transform;
pub mod warehouse;
pub mod watermark;

// Re-export commonly used types
pub use config::{Config, DatabaseConfig, LoadConfig, LoggingConfig, StorageConfig};
pub use error::{PipelineError, Result, TableFailure};
pub use extract::{ExtractionReport, Extractor};
pub use landing::LandingArea;
pub use pipeline::{Pipeline, StageOutcome, StageResponse};
pub use processed::ProcessedStore;
pub use schema::{LoadStrategy, SchemaValidator, TableSchema};
pub use source::{SourceDatabase, SqliteSource};
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore};
pub use table::{Column, DataType, Table, Value};
pub use transform::{TransformReport, TransformRequest, Transformer};
pub use warehouse::{LoadReport, LoadRequest, LoadState, Loader, SqliteWarehouse, Warehouse};
pub use watermark::{Watermark, WatermarkStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

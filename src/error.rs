// 🚨 Error Taxonomy - what can go wrong in a pipeline stage
// Recoverable conditions are skipped per table, everything else reaches the stage boundary

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// Source or warehouse unreachable, or a statement against it failed
    #[error("connectivity failure on {target}: {message}")]
    Connectivity { target: String, message: String },

    /// Expected column absent, extra column present, or a value of the wrong type
    #[error("schema mismatch in {table}: {message}")]
    SchemaMismatch { table: String, message: String },

    /// A fact date with no row in the date dimension
    #[error("date {date} in {table}.{column} is missing from dim_date")]
    CoverageViolation {
        table: String,
        column: String,
        date: String,
    },

    /// No landed data, or an empty artifact
    #[error("nothing to do for {table}: {reason}")]
    EmptyInput { table: String, reason: String },

    /// Watermark document unreadable or malformed
    #[error("watermark store unusable: {0}")]
    WatermarkStore(String),

    #[error("object storage failure for {key}: {message}")]
    Storage { key: String, message: String },

    /// CSV / Parquet / JSON encoding and decoding
    #[error("{format} codec failure for {key}: {message}")]
    Codec {
        format: &'static str,
        key: String,
        message: String,
    },

    #[error("invalid processed artifact key '{0}'")]
    InvalidArtifactKey(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A table that failed inside an otherwise completed stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableFailure {
    pub table: String,
    pub reason: String,
}

impl TableFailure {
    pub fn new(table: &str, err: &PipelineError) -> Self {
        TableFailure {
            table: table.to_string(),
            reason: err.to_string(),
        }
    }
}

impl PipelineError {
    pub fn connectivity(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::Connectivity {
            target: target.into(),
            message: err.to_string(),
        }
    }

    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn empty(table: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::EmptyInput {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::Storage {
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub fn codec(format: &'static str, key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        PipelineError::Codec {
            format,
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Absorbed with a logged per-table skip instead of failing the table
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::EmptyInput { .. })
    }
}

// 💧 Watermark Store - per-table high-water marks for incremental extraction
// One JSON object (table -> last seen change time) at a well-known key

use crate::error::{PipelineError, Result};
use crate::schema::TRACKED_TABLES;
use crate::storage::ObjectStore;
use crate::table::parse_timestamp;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stored value for a table that has never been extracted
pub const SENTINEL: &str = "0000-00-00 00:00:00.0";

// ============================================================================
// WATERMARK
// ============================================================================

/// `Never` orders before every timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Watermark {
    Never,
    At(NaiveDateTime),
}

impl Watermark {
    pub fn parse(text: &str) -> std::result::Result<Watermark, String> {
        if text.trim() == SENTINEL {
            return Ok(Watermark::Never);
        }
        parse_timestamp(text)
            .map(Watermark::At)
            .ok_or_else(|| format!("'{}' is neither a timestamp nor the sentinel", text))
    }

    pub fn render(&self) -> String {
        match self {
            Watermark::Never => SENTINEL.to_string(),
            Watermark::At(ts) => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        }
    }

    /// True when a row changed at `ts` has not been extracted yet
    pub fn is_before(&self, ts: NaiveDateTime) -> bool {
        match self {
            Watermark::Never => true,
            Watermark::At(mark) => *mark < ts,
        }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

// ============================================================================
// STAGED UPDATES
// ============================================================================

/// A watermark advance computed during extraction, applied at commit
#[derive(Debug, Clone, PartialEq)]
pub struct StagedWatermark {
    pub table: String,
    /// Value read at the start of the run
    pub expected: Watermark,
    pub new: Watermark,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOutcome {
    pub advanced: Vec<String>,
    /// Tables whose stored value no longer matched `expected`
    pub conflicts: Vec<String>,
}

// ============================================================================
// WATERMARK STORE
// ============================================================================

pub struct WatermarkStore {
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl WatermarkStore {
    pub fn new(store: Arc<dyn ObjectStore>, key: &str) -> Self {
        WatermarkStore {
            store,
            key: key.to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current document. An unreadable or malformed document is fatal, never reset.
    fn read_document(&self) -> Result<Option<BTreeMap<String, Watermark>>> {
        let bytes = self
            .store
            .get(&self.key)
            .map_err(|e| PipelineError::WatermarkStore(e.to_string()))?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let raw: BTreeMap<String, String> = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::WatermarkStore(format!("{}: {}", self.key, e)))?;

        raw.into_iter()
            .map(|(table, text)| {
                Watermark::parse(&text)
                    .map(|wm| (table.clone(), wm))
                    .map_err(|e| PipelineError::WatermarkStore(format!("{}: {}", table, e)))
            })
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Some)
    }

    fn write_document(&self, marks: &BTreeMap<String, Watermark>) -> Result<()> {
        let raw: BTreeMap<&str, String> = marks
            .iter()
            .map(|(table, wm)| (table.as_str(), wm.render()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&raw)
            .map_err(|e| PipelineError::codec("json", &self.key, e))?;
        self.store
            .put(&self.key, &bytes)
            .map_err(|e| PipelineError::WatermarkStore(e.to_string()))
    }

    /// All watermarks, creating an all-sentinel document on first use
    pub fn load(&self) -> Result<BTreeMap<String, Watermark>> {
        if let Some(marks) = self.read_document()? {
            return Ok(marks);
        }

        tracing::info!(key = %self.key, "Watermark document absent, creating one");
        let marks: BTreeMap<String, Watermark> = TRACKED_TABLES
            .iter()
            .map(|t| (t.to_string(), Watermark::Never))
            .collect();
        self.write_document(&marks)?;
        Ok(marks)
    }

    /// Watermark of one table; `Never` if unseen
    pub fn get(&self, table: &str) -> Result<Watermark> {
        Ok(self
            .load()?
            .get(table)
            .copied()
            .unwrap_or(Watermark::Never))
    }

    /// Overwrite one table's watermark, leaving the others untouched
    pub fn set(&self, table: &str, watermark: Watermark) -> Result<()> {
        let mut marks = self.load()?;
        marks.insert(table.to_string(), watermark);
        self.write_document(&marks)
    }

    /// Set only if the stored value still equals `expected`
    pub fn compare_and_set(&self, table: &str, expected: Watermark, new: Watermark) -> Result<bool> {
        let outcome = self.commit(&[StagedWatermark {
            table: table.to_string(),
            expected,
            new,
        }])?;
        Ok(outcome.conflicts.is_empty())
    }

    /// Apply staged advances as per-key compare-and-set within a single write.
    ///
    /// The document is re-read first, so keys not staged here keep whatever
    /// value is stored now.
    pub fn commit(&self, staged: &[StagedWatermark]) -> Result<CommitOutcome> {
        let mut marks = self.load()?;
        let mut outcome = CommitOutcome::default();

        for update in staged {
            let current = marks.get(&update.table).copied().unwrap_or(Watermark::Never);
            if current != update.expected {
                tracing::warn!(
                    table = %update.table,
                    expected = %update.expected,
                    found = %current,
                    "Watermark changed underneath this run, not advancing"
                );
                outcome.conflicts.push(update.table.clone());
                continue;
            }
            marks.insert(update.table.clone(), update.new);
            outcome.advanced.push(update.table.clone());
        }

        if !outcome.advanced.is_empty() {
            self.write_document(&marks)?;
        }
        Ok(outcome)
    }
}

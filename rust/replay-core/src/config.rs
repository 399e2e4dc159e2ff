// rust/replay-core/src/config.rs

//! Configuration for replay datasets.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{ReplayError, Result};
use crate::field::{DType, FieldSpec, SessionId};

/// Names of the planes every batch carries in addition to its fields.
pub const RESERVED_FIELD_NAMES: [&str; 2] = ["reset", "game_id"];

// Top-level replay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub dataset: DatasetConfig,
    pub batch: BatchConfig,
    pub performance: PerformanceConfig,
    pub fields: Vec<FieldSpec>,
    pub sources: Vec<SourceConfig>,
}

/// Where sessions live and how they are drawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    // Directory holding one sub-directory per session id.
    pub root: PathBuf,
    // Only files whose name starts with this prefix are parts.
    pub part_prefix: String,
    /// Restrict the pass to these sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ids: Option<Vec<SessionId>>,
    // Whether to shuffle session order at the start of each pass.
    pub shuffle: bool,
    // Optional seed for reproducible shuffling.
    pub seed: Option<u64>,
    // Wrap around the session list instead of ending the pass.
    pub loop_forever: bool,
}

// Batch shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub seq_length: usize,
    // Number of buffers in the prefetch ring.
    pub prefetch: usize,
}

// Performance tuning options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    // Lane worker threads. 0 fills lanes sequentially on the caller's thread.
    pub worker_threads: usize,
    // Rows of zeros substituted for a part that cannot be decoded.
    pub fallback_rows: usize,
}

/// Source file format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Parquet,
    Npy,
}

/// One file family read alongside every part.
///
/// The first configured source is the primary source: its row count decides
/// how far a lane advances. Other sources fill the same rows from files
/// derived from the part path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Field names served by this source.
    pub fields: Vec<String>,
    /// Sibling file name template with `{pid}`, `{epi}` and `{name}`
    /// placeholders. Absent reads the listed part itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Rows dropped from the end of each part (parquet only).
    pub trim_trailing_rows: usize,
    /// Decode a whole part on load instead of one row-group at a time.
    pub materialize: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        let fields = default_fields();
        let names = fields.iter().map(|f| f.name.clone()).collect();
        Self {
            dataset: DatasetConfig::default(),
            batch: BatchConfig::default(),
            performance: PerformanceConfig::default(),
            fields,
            sources: vec![SourceConfig {
                kind: SourceKind::Parquet,
                fields: names,
                file_name: Some("glyphs_pid_{pid}_epi_{epi}.parquet".to_string()),
                trim_trailing_rows: 1,
                materialize: false,
            }],
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            part_prefix: "rollout".to_string(),
            session_ids: None,
            shuffle: true,
            seed: None,
            loop_forever: false,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            seq_length: 32,
            prefetch: 2,
        }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            fallback_rows: 200_000,
        }
    }
}

/// Terminal trace fields.
fn default_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("tty_chars", DType::U8, &[24, 80]),
        FieldSpec::new("tty_colors", DType::I8, &[24, 80]),
        FieldSpec::new("tty_cursor", DType::I16, &[2]),
        FieldSpec::new("keypresses", DType::U8, &[]).from_column("actions"),
        FieldSpec::new("blstats", DType::I32, &[27]),
        FieldSpec::new("inv_glyphs", DType::I16, &[55]),
        FieldSpec::new("glyphs", DType::I16, &[21, 79]),
        FieldSpec::new("message", DType::U8, &[256]),
    ]
}

impl FromStr for ReplayConfig {
    type Err = ReplayError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ReplayError::config_with_source("failed to parse TOML config", e))
    }
}

impl ReplayConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ReplayError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `RPL_` and use underscores
    // to separate nested fields. For example:
    // - `RPL_DATASET_ROOT` overrides `dataset.root`
    // - `RPL_BATCH_SEQ_LENGTH` overrides `batch.seq_length`
    // - `RPL_PERFORMANCE_WORKER_THREADS` overrides `performance.worker_threads`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Dataset overrides
        if let Ok(val) = std::env::var("RPL_DATASET_ROOT") {
            self.dataset.root = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("RPL_DATASET_PART_PREFIX") {
            self.dataset.part_prefix = val;
        }
        if let Ok(val) = std::env::var("RPL_DATASET_SHUFFLE") {
            if let Ok(v) = val.parse() {
                self.dataset.shuffle = v;
            }
        }
        if let Ok(val) = std::env::var("RPL_DATASET_SEED") {
            if let Ok(v) = val.parse() {
                self.dataset.seed = Some(v);
            }
        }
        if let Ok(val) = std::env::var("RPL_DATASET_LOOP_FOREVER") {
            if let Ok(v) = val.parse() {
                self.dataset.loop_forever = v;
            }
        }

        // Batch overrides
        if let Ok(val) = std::env::var("RPL_BATCH_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.batch.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("RPL_BATCH_SEQ_LENGTH") {
            if let Ok(v) = val.parse() {
                self.batch.seq_length = v;
            }
        }
        if let Ok(val) = std::env::var("RPL_BATCH_PREFETCH") {
            if let Ok(v) = val.parse() {
                self.batch.prefetch = v;
            }
        }

        // Performance overrides
        if let Ok(val) = std::env::var("RPL_PERFORMANCE_WORKER_THREADS") {
            if let Ok(v) = val.parse() {
                self.performance.worker_threads = v;
            }
        }
        if let Ok(val) = std::env::var("RPL_PERFORMANCE_FALLBACK_ROWS") {
            if let Ok(v) = val.parse() {
                self.performance.fallback_rows = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Dataset validation
        if self.dataset.part_prefix.is_empty() {
            return Err(ReplayError::config("dataset.part_prefix must not be empty"));
        }
        if let Some(ids) = &self.dataset.session_ids {
            if ids.contains(&0) {
                return Err(ReplayError::config(
                    "dataset.session_ids must not contain the reserved id 0",
                ));
            }
        }

        // Batch validation
        if self.batch.batch_size == 0 {
            return Err(ReplayError::config("batch.batch_size must be greater than 0"));
        }
        if self.batch.seq_length == 0 {
            return Err(ReplayError::config("batch.seq_length must be greater than 0"));
        }
        if self.batch.prefetch == 0 {
            return Err(ReplayError::config("batch.prefetch must be greater than 0"));
        }

        // Performance validation
        if self.performance.fallback_rows == 0 {
            return Err(ReplayError::config(
                "performance.fallback_rows must be greater than 0",
            ));
        }

        // Field validation
        if self.fields.is_empty() {
            return Err(ReplayError::config("at least one field is required"));
        }
        let mut names = HashSet::new();
        for field in &self.fields {
            if RESERVED_FIELD_NAMES.contains(&field.name.as_str()) {
                return Err(ReplayError::config(format!(
                    "field name '{}' is reserved",
                    field.name
                )));
            }
            if !names.insert(field.name.as_str()) {
                return Err(ReplayError::config(format!(
                    "field '{}' is declared twice",
                    field.name
                )));
            }
            if field.shape.contains(&0) {
                return Err(ReplayError::config(format!(
                    "field '{}' has a zero-sized dimension",
                    field.name
                )));
            }
        }

        // Source validation
        if self.sources.is_empty() {
            return Err(ReplayError::config("at least one source is required"));
        }
        let mut served = HashSet::new();
        for (index, source) in self.sources.iter().enumerate() {
            if source.fields.is_empty() {
                return Err(ReplayError::config(format!(
                    "sources[{index}] serves no fields"
                )));
            }
            for name in &source.fields {
                if !names.contains(name.as_str()) {
                    return Err(ReplayError::config(format!(
                        "sources[{index}] serves unknown field '{name}'"
                    )));
                }
                if !served.insert(name.as_str()) {
                    return Err(ReplayError::config(format!(
                        "field '{name}' is served by more than one source"
                    )));
                }
            }
            if source.kind == SourceKind::Npy {
                if source.fields.len() != 1 {
                    return Err(ReplayError::config(format!(
                        "sources[{index}] is npy and must serve exactly one field"
                    )));
                }
                if source.trim_trailing_rows > 0 {
                    return Err(ReplayError::config(format!(
                        "sources[{index}].trim_trailing_rows is only supported for parquet"
                    )));
                }
            }
        }
        if let Some(field) = self.fields.iter().find(|f| !served.contains(f.name.as_str())) {
            return Err(ReplayError::config(format!(
                "field '{}' is not served by any source",
                field.name
            )));
        }

        Ok(())
    }

    /// Field specs served by `source`, in source order.
    pub fn source_fields(&self, source: &SourceConfig) -> Vec<FieldSpec> {
        source
            .fields
            .iter()
            .filter_map(|name| self.fields.iter().find(|f| &f.name == name).cloned())
            .collect()
    }

    /// Field specs in batch order: grouped by source, primary source first.
    pub fn batch_fields(&self) -> Vec<FieldSpec> {
        self.sources
            .iter()
            .flat_map(|source| self.source_fields(source))
            .collect()
    }
}

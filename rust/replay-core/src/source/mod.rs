// rust/replay-core/src/source/mod.rs

//! Decoding of part files into typed column chunks.
//!
//! A [`RowSource`] is one opened part. It reports its exact row count up
//! front (from file metadata) and then hands out successive
//! [`ColumnChunk`]s, one per row-group for columnar files or a single chunk
//! for flat arrays. A [`SourceDecoder`] opens parts for a given field list.

mod npy;
mod parquet;

use std::path::Path;

use crate::error::DecodeError;
use crate::field::FieldSpec;

pub use self::npy::{NpyDecoder, NpySource};
pub use self::parquet::{ParquetDecoder, ParquetSource};

/// A block of consecutive rows, one byte column per requested field.
#[derive(Debug, Clone, Default)]
pub struct ColumnChunk {
    rows: usize,
    columns: Vec<Vec<u8>>,
}

impl ColumnChunk {
    /// Builds a chunk from per-field byte columns.
    ///
    /// Every column must hold exactly `rows * row_bytes` bytes for its field.
    pub fn new(rows: usize, columns: Vec<Vec<u8>>) -> Self {
        Self { rows, columns }
    }

    /// An empty chunk with one column per field.
    pub fn empty(fields: usize) -> Self {
        Self {
            rows: 0,
            columns: vec![Vec::new(); fields],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn column(&self, index: usize) -> &[u8] {
        &self.columns[index]
    }

    /// Appends the rows of `other`, which must carry the same fields.
    pub fn append(&mut self, other: ColumnChunk) {
        for (column, extra) in self.columns.iter_mut().zip(other.columns) {
            column.extend_from_slice(&extra);
        }
        self.rows += other.rows;
    }

    /// Drops every row past `rows`.
    pub fn truncate(&mut self, rows: usize, fields: &[FieldSpec]) {
        if rows >= self.rows {
            return;
        }
        for (column, field) in self.columns.iter_mut().zip(fields) {
            column.truncate(rows * field.row_bytes());
        }
        self.rows = rows;
    }
}

/// One opened part file.
pub trait RowSource: Send {
    /// Total number of rows in the part, independent of how many have been
    /// decoded so far.
    fn num_rows(&self) -> usize;

    /// Decodes the next chunk of rows, or `None` once the part is exhausted.
    fn next_chunk(&mut self) -> Result<Option<ColumnChunk>, DecodeError>;
}

/// Opens part files for a list of fields (`decode_source`).
pub trait SourceDecoder: Send + Sync {
    fn open(&self, path: &Path, fields: &[FieldSpec]) -> Result<Box<dyn RowSource>, DecodeError>;

    /// Name of this decoder
    fn name(&self) -> &'static str;
}

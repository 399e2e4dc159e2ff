// rust/replay-core/src/lib.rs

//! Trace Replay - Core Library
//!
//! This crate streams recorded game-session traces, stored as columnar and
//! flat-array part files, into fixed-shape batch buffers for a training
//! loop. It provides error handling, configuration, source decoding, the
//! lane multiplexer and dataset orchestration.

pub mod config;
pub mod error;
pub mod field;

// Re-export commonly used types for convenience
pub use config::{ReplayConfig, SourceConfig, SourceKind};
pub use error::{DecodeError, ReplayError, Result};
pub use field::{BatchBuffers, DType, FieldBuffer, FieldSpec, SessionId};

pub mod source;
pub use source::{ColumnChunk, NpyDecoder, ParquetDecoder, RowSource, SourceDecoder};

pub mod dataset;
pub use dataset::{
    Batch, BatchMultiplexer, BatchStream, BatchSummary, ChunkedCursorReader, CursorReader,
    DirectoryCatalog, PathDerivation, Prefetcher, RowWindowReader, SessionAllocator,
    SessionCatalog,
};

pub mod runtime;
pub use runtime::{ReplayDataset, ReplayDatasetBuilder};

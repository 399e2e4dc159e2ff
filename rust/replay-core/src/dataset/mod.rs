// rust/replay-core/src/dataset/mod.rs

//! Session multiplexing into fixed-shape batches.
//!
//! A batch has `batch_size` lanes. Each lane plays back one session at a
//! time, part after part, and draws the next unclaimed session from a shared
//! allocator when its current one runs out. Rows from consecutive parts and
//! sessions are packed back to back; the `reset` plane marks the first row
//! of every newly started session and `game_id` tags each row with its
//! session (0 for padding).
//!
//! # Example
//!
//! ```ignore
//! use replay_core::dataset::{BatchStream, DirectoryCatalog};
//!
//! let mut mux = dataset.multiplexer()?;
//! let buffers = mux.allocate_buffers();
//! let mut stream = BatchStream::new(mux, buffers)?;
//!
//! while let Some(batch) = stream.next_batch()? {
//!     // batch.field("tty_chars"), batch.reset(), batch.game_id()
//! }
//! ```

mod allocator;
mod catalog;
mod iterator;
mod lane;
mod multiplexer;
mod prefetch;
mod reader;
mod traits;

#[cfg(test)]
mod test_support;

pub use allocator::SessionAllocator;
pub use catalog::{derivation_for, DirectoryCatalog, SamePath, SiblingTemplate};
pub use iterator::{Batch, BatchStream};
pub use lane::{BoundReader, Lane, LaneContext, LaneState, LaneStep, LaneView};
pub use multiplexer::{BatchMultiplexer, BatchSummary};
pub use prefetch::Prefetcher;
pub use reader::{ChunkedCursorReader, CursorReader, DEFAULT_FALLBACK_ROWS};
pub use traits::{zero_rows, PathDerivation, RowWindowReader, SessionCatalog};

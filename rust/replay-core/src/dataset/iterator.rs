// rust/replay-core/src/dataset/iterator.rs

use crate::error::Result;
use crate::field::BatchBuffers;

use super::multiplexer::{BatchMultiplexer, BatchSummary};

/// A filled batch handed out by value.
#[derive(Debug, Clone)]
pub struct Batch {
    pub buffers: BatchBuffers,
    pub summary: BatchSummary,
}

/// Pull-based iteration over one pass.
///
/// Owns one set of buffers and overwrites it on every call. A batch is
/// always yielded after it is filled; iteration ends after the first batch
/// in which no lane has a session id at its final row. With looping enabled
/// that batch never occurs.
pub struct BatchStream {
    mux: BatchMultiplexer,
    buffers: BatchBuffers,
    last: Option<BatchSummary>,
    finished: bool,
}

impl BatchStream {
    /// Creates a stream that writes into `buffers`.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `buffers` do not match the multiplexer.
    pub fn new(mux: BatchMultiplexer, buffers: BatchBuffers) -> Result<Self> {
        buffers.check_layout(mux.batch_size(), mux.seq_length(), mux.fields())?;
        Ok(Self {
            mux,
            buffers,
            last: None,
            finished: false,
        })
    }

    /// Fills and returns the next batch, or `None` once the pass is over.
    pub fn next_batch(&mut self) -> Result<Option<&BatchBuffers>> {
        if self.finished {
            return Ok(None);
        }

        let summary = match self.mux.fill(&mut self.buffers) {
            Ok(summary) => summary,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };

        if summary.active_lanes == 0 {
            tracing::debug!("Pass finished after {} batches", summary.batch_index + 1);
            self.finished = true;
        }
        self.last = Some(summary);
        Ok(Some(&self.buffers))
    }

    /// Summary of the most recent batch.
    pub fn last_summary(&self) -> Option<&BatchSummary> {
        self.last.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn multiplexer(&self) -> &BatchMultiplexer {
        &self.mux
    }

    /// Gives back the multiplexer and buffers.
    pub fn into_parts(self) -> (BatchMultiplexer, BatchBuffers) {
        (self.mux, self.buffers)
    }
}

impl Iterator for BatchStream {
    type Item = Result<Batch>;

    /// Clones every batch out of the stream's buffers.
    fn next(&mut self) -> Option<Self::Item> {
        let buffers = match self.next_batch() {
            Ok(Some(buffers)) => buffers.clone(),
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        let summary = self.last.unwrap_or_default();
        Some(Ok(Batch { buffers, summary }))
    }
}

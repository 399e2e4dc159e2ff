// rust/replay-core/src/dataset/multiplexer.rs

//! Cooperative filling of one batch by all lanes.
//!
//! The batch buffers are split into disjoint per-lane regions up front, so
//! lanes never share mutable state except the session allocator. With a
//! worker pool each lane's step is one unit of work; without one, lanes run
//! in index order on the caller's thread.

use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::error::{ReplayError, Result};
use crate::field::{BatchBuffers, FieldSpec, SessionId};

use super::allocator::SessionAllocator;
use super::lane::{Lane, LaneContext, LaneStep, LaneView};
use super::traits::SessionCatalog;

/// Statistics for one filled batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch_index: u64,
    /// Rows read from sources across all lanes.
    pub rows_read: usize,
    /// Rows padded because lanes ran out of sessions.
    pub padded_rows: usize,
    pub new_parts: usize,
    pub new_sessions: usize,
    pub exhausted_lanes: usize,
    /// Lanes whose final row carries a session id.
    pub active_lanes: usize,
}

impl BatchSummary {
    fn add(&mut self, step: &LaneStep) {
        self.rows_read += step.rows;
        self.padded_rows += step.padded;
        self.new_parts += step.new_parts;
        self.new_sessions += step.new_sessions;
    }
}

pub struct BatchMultiplexer {
    lanes: Vec<Lane>,
    allocator: Arc<SessionAllocator>,
    catalog: Arc<dyn SessionCatalog>,
    pool: Option<Arc<ThreadPool>>,
    fields: Vec<FieldSpec>,
    seq_length: usize,
    batches: u64,
}

impl BatchMultiplexer {
    /// Creates a multiplexer over `lanes`, one per batch row.
    ///
    /// Every lane must write exactly `fields`, in order.
    pub fn new(
        lanes: Vec<Lane>,
        allocator: Arc<SessionAllocator>,
        catalog: Arc<dyn SessionCatalog>,
        fields: Vec<FieldSpec>,
        seq_length: usize,
    ) -> Result<Self> {
        if lanes.is_empty() {
            return Err(ReplayError::config("batch_size must be greater than 0"));
        }
        if seq_length == 0 {
            return Err(ReplayError::config("seq_length must be greater than 0"));
        }
        if let Some(field) = fields.iter().find(|f| f.row_bytes() == 0) {
            return Err(ReplayError::config(format!(
                "field '{}' has zero-sized rows",
                field.name
            )));
        }
        if let Some(lane) = lanes.iter().find(|l| l.field_count() != fields.len()) {
            return Err(ReplayError::config(format!(
                "lane {} writes {} fields, batch has {}",
                lane.index(),
                lane.field_count(),
                fields.len()
            )));
        }

        Ok(Self {
            lanes,
            allocator,
            catalog,
            pool: None,
            fields,
            seq_length,
            batches: 0,
        })
    }

    /// Runs lane steps on `pool` instead of the caller's thread.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Draws every lane's first session, in lane order.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Config`] if a source lacks a requested field.
    pub fn prime(&mut self) -> Result<()> {
        let ctx = LaneContext {
            allocator: &self.allocator,
            catalog: &*self.catalog,
        };
        for lane in self.lanes.iter_mut() {
            lane.prime(&ctx)?;
        }
        Ok(())
    }

    pub fn batch_size(&self) -> usize {
        self.lanes.len()
    }

    pub fn seq_length(&self) -> usize {
        self.seq_length
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    pub fn allocator(&self) -> &SessionAllocator {
        &self.allocator
    }

    /// Batches filled so far.
    pub fn batches(&self) -> u64 {
        self.batches
    }

    /// True once no lane can produce another row.
    pub fn is_exhausted(&self) -> bool {
        self.lanes.iter().all(Lane::is_exhausted)
    }

    /// Current session of every lane.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.lanes.iter().map(Lane::session_id).collect()
    }

    /// Allocates buffers shaped for this multiplexer.
    pub fn allocate_buffers(&self) -> BatchBuffers {
        BatchBuffers::new(self.lanes.len(), self.seq_length, &self.fields)
    }

    /// Overwrites `batch` with the next step of every lane.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Shape`] if `batch` was not allocated for this
    /// multiplexer's batch size, sequence length and fields.
    pub fn fill(&mut self, batch: &mut BatchBuffers) -> Result<BatchSummary> {
        batch.check_layout(self.lanes.len(), self.seq_length, &self.fields)?;

        let seq_length = self.seq_length;
        let lane_count = self.lanes.len();
        let (buffers, reset, game_id) = batch.planes_mut();

        let mut lane_fields: Vec<Vec<&mut [u8]>> = (0..lane_count)
            .map(|_| Vec::with_capacity(buffers.len()))
            .collect();
        for buffer in buffers.iter_mut() {
            let width = buffer.spec().row_bytes() * seq_length;
            for (slot, region) in lane_fields
                .iter_mut()
                .zip(buffer.as_bytes_mut().chunks_mut(width))
            {
                slot.push(region);
            }
        }

        let views: Vec<LaneView<'_>> = lane_fields
            .into_iter()
            .zip(reset.chunks_mut(seq_length))
            .zip(game_id.chunks_mut(seq_length))
            .map(|((fields, reset), game_id)| LaneView {
                fields,
                reset,
                game_id,
            })
            .collect();

        let ctx = LaneContext {
            allocator: &self.allocator,
            catalog: &*self.catalog,
        };
        let lanes = &mut self.lanes;

        let steps: Vec<LaneStep> = match &self.pool {
            Some(pool) => pool.install(|| {
                lanes
                    .par_iter_mut()
                    .zip(views.into_par_iter())
                    .map(|(lane, view)| lane.fill(view, &ctx))
                    .collect()
            }),
            None => lanes
                .iter_mut()
                .zip(views)
                .map(|(lane, view)| lane.fill(view, &ctx))
                .collect(),
        };

        let mut summary = BatchSummary {
            batch_index: self.batches,
            ..Default::default()
        };
        for step in &steps {
            summary.add(step);
        }
        summary.exhausted_lanes = self.lanes.iter().filter(|l| l.is_exhausted()).count();
        summary.active_lanes = batch.last_game_ids().filter(|id| *id != 0).count();

        self.batches += 1;
        Ok(summary)
    }
}

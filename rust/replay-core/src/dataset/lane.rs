// rust/replay-core/src/dataset/lane.rs

//! One playback slot of a batch.
//!
//! A lane owns one reader per source and walks through the parts of one
//! session at a time. When the primary reader runs dry the lane advances to
//! the session's next part, or draws a new session from the shared
//! allocator. The first row written from a newly drawn session is flagged in
//! `reset`; rows from a following part of the same session are not, and
//! neither is the first session a lane starts a pass with.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{DecodeError, ReplayError, Result};
use crate::field::{FieldSpec, SessionId};

use super::allocator::SessionAllocator;
use super::traits::{zero_rows, PathDerivation, RowWindowReader, SessionCatalog};

/// A reader paired with the rule that finds its file for each part.
pub struct BoundReader {
    reader: Box<dyn RowWindowReader>,
    derivation: Arc<dyn PathDerivation>,
}

impl BoundReader {
    pub fn new(reader: Box<dyn RowWindowReader>, derivation: Arc<dyn PathDerivation>) -> Self {
        Self { reader, derivation }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        self.reader.fields()
    }

    fn load(&mut self, part: &Path) -> std::result::Result<(), DecodeError> {
        match self.derivation.derive(part) {
            Some(path) => self.reader.load(&path),
            None => {
                self.reader.clear();
                Err(DecodeError::malformed(part, "cannot derive source file name"))
            }
        }
    }
}

/// Shared collaborators handed to every lane of a pass.
#[derive(Clone, Copy)]
pub struct LaneContext<'a> {
    pub allocator: &'a SessionAllocator,
    pub catalog: &'a dyn SessionCatalog,
}

/// The region of one batch owned by one lane: `seq_length` rows of every
/// field, in the same order as the lane's readers, plus the lane's `reset`
/// and `game_id` rows.
pub struct LaneView<'a> {
    pub fields: Vec<&'a mut [u8]>,
    pub reset: &'a mut [u8],
    pub game_id: &'a mut [SessionId],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    /// No session drawn yet.
    Fresh,
    /// Draining parts of `session_id`.
    InSession,
    /// No more sessions for this pass.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rotation {
    Part,
    Session,
    Exhausted,
}

/// What one lane did during one batch step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneStep {
    /// Rows copied from sources (including zero-filled fallback rows).
    pub rows: usize,
    /// Rows padded with zeros because the lane is exhausted.
    pub padded: usize,
    pub new_parts: usize,
    pub new_sessions: usize,
}

pub struct Lane {
    index: usize,
    session_id: SessionId,
    parts: Vec<PathBuf>,
    part_index: usize,
    state: LaneState,
    pending_reset: bool,
    /// Rows written from the current session so far.
    session_rows: usize,
    readers: Vec<BoundReader>,
}

impl Lane {
    /// Creates a lane over `readers`. The first reader is the primary source.
    pub fn new(index: usize, readers: Vec<BoundReader>) -> Result<Self> {
        if readers.is_empty() {
            return Err(ReplayError::config("a lane needs at least one source"));
        }
        Ok(Self {
            index,
            session_id: 0,
            parts: Vec::new(),
            part_index: 0,
            state: LaneState::Fresh,
            pending_reset: false,
            session_rows: 0,
            readers,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn part_index(&self) -> usize {
        self.part_index
    }

    pub fn state(&self) -> LaneState {
        self.state
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == LaneState::Exhausted
    }

    /// Total number of fields written by this lane.
    pub fn field_count(&self) -> usize {
        self.readers.iter().map(|r| r.fields().len()).sum()
    }

    /// Draws the lane's first session and loads its first part.
    ///
    /// A source that lacks a requested field fails here with
    /// [`ReplayError::Config`]; any other decode failure falls back to zeros.
    pub fn prime(&mut self, ctx: &LaneContext<'_>) -> Result<()> {
        if self.state != LaneState::Fresh {
            return Ok(());
        }
        self.rotate(ctx, true).map(|_| ())
    }

    /// Fills `view` with the lane's next `seq_length` rows.
    pub fn fill(&mut self, view: LaneView<'_>, ctx: &LaneContext<'_>) -> LaneStep {
        let LaneView {
            mut fields,
            reset,
            game_id,
        } = view;
        let len = reset.len();
        let mut step = LaneStep::default();
        if len == 0 {
            return step;
        }

        reset[0] = 0;
        let mut filled = 0;

        loop {
            if self.state == LaneState::Exhausted {
                let pad = len - filled;
                for (buffer, field) in fields.iter_mut().zip(self.fields()) {
                    let width = field.row_bytes();
                    buffer[filled * width..].fill(0);
                }
                reset[filled..].fill(0);
                game_id[filled..].fill(0);
                step.padded = pad;
                break;
            }

            if self.state == LaneState::InSession {
                let copied = self.drain(&mut fields, filled, len - filled);
                if copied > 0 {
                    let end = filled + copied;
                    reset[filled..end].fill(0);
                    if self.pending_reset {
                        reset[filled] = 1;
                        self.pending_reset = false;
                    }
                    game_id[filled..end].fill(self.session_id);
                    filled = end;
                    step.rows += copied;
                    self.session_rows += copied;
                }
                if filled == len {
                    break;
                }
            }

            // Non-strict rotation never fails
            match self.rotate(ctx, false) {
                Ok(Rotation::Part) => step.new_parts += 1,
                Ok(Rotation::Session) => step.new_sessions += 1,
                Ok(Rotation::Exhausted) | Err(_) => {}
            }
        }

        step
    }

    fn fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.readers.iter().flat_map(|r| r.fields())
    }

    /// Drains the primary reader into rows `offset..offset + len`, then the
    /// same rows of every auxiliary reader. Returns the rows copied.
    fn drain(&mut self, fields: &mut [&mut [u8]], offset: usize, len: usize) -> usize {
        let Some((primary, auxiliary)) = self.readers.split_first_mut() else {
            return 0;
        };

        let (head, mut rest) = fields.split_at_mut(primary.fields().len());
        let copied = len - primary.reader.drain(head, offset, len);

        for bound in auxiliary {
            let (dst, tail) = std::mem::take(&mut rest).split_at_mut(bound.fields().len());
            let short = bound.reader.drain(dst, offset, copied);
            if short > 0 {
                zero_rows(dst, bound.fields(), offset + copied - short, short);
            }
            rest = tail;
        }

        copied
    }

    fn rotate(&mut self, ctx: &LaneContext<'_>, strict: bool) -> Result<Rotation> {
        if self.state == LaneState::InSession && self.part_index + 1 < self.parts.len() {
            self.part_index += 1;
            tracing::debug!(
                "Lane {} advancing to part {} of session {}",
                self.index,
                self.part_index,
                self.session_id
            );
            self.load_part(strict)?;
            return Ok(Rotation::Part);
        }

        if self.state == LaneState::InSession && self.session_rows == 0 {
            ctx.allocator.mark_barren(self.session_id);
        }
        // The session a lane opens a pass with is not a boundary
        let first_session = self.state == LaneState::Fresh;

        loop {
            if ctx.allocator.all_barren() {
                tracing::warn!("No session in the ordering yields any rows");
                self.exhaust();
                return Ok(Rotation::Exhausted);
            }

            let Some(id) = ctx.allocator.allocate_next() else {
                tracing::debug!("Lane {} exhausted the session ordering", self.index);
                self.exhaust();
                return Ok(Rotation::Exhausted);
            };

            let parts = match ctx.catalog.list_part_files(id) {
                Ok(parts) => parts,
                Err(e) => {
                    tracing::warn!("Failed to list parts of session {}: {}", id, e);
                    Vec::new()
                }
            };

            if parts.is_empty() {
                tracing::debug!("Lane {} skipping empty session {}", self.index, id);
                ctx.allocator.mark_barren(id);
                continue;
            }

            tracing::debug!("Lane {} starting session {}", self.index, id);
            self.session_id = id;
            self.parts = parts;
            self.part_index = 0;
            self.state = LaneState::InSession;
            self.session_rows = 0;
            self.pending_reset = !first_session;
            self.load_part(strict)?;
            return Ok(Rotation::Session);
        }
    }

    fn load_part(&mut self, strict: bool) -> Result<()> {
        let part = &self.parts[self.part_index];
        for bound in self.readers.iter_mut() {
            if let Err(e) = bound.load(part) {
                if strict && e.is_schema_mismatch() {
                    return Err(e.into());
                }
                tracing::warn!(
                    "Lane {}: failed to decode source for {} (session {}), substituting zeros: {}",
                    self.index,
                    part.display(),
                    self.session_id,
                    e
                );
                bound.reader.load_zeroed();
            }
        }
        Ok(())
    }

    fn exhaust(&mut self) {
        self.state = LaneState::Exhausted;
        self.session_id = 0;
        self.parts.clear();
        self.part_index = 0;
        self.pending_reset = false;
        self.session_rows = 0;
        for bound in self.readers.iter_mut() {
            bound.reader.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::catalog::{derivation_for, SamePath};
    use crate::dataset::reader::{ChunkedCursorReader, CursorReader};
    use crate::dataset::test_support::{obs_field, MemoryCatalog, MemoryDecoder, MemoryPart};
    use crate::field::DType;

    struct Harness {
        catalog: MemoryCatalog,
        allocator: SessionAllocator,
        lane: Lane,
    }

    impl Harness {
        fn new(decoder: MemoryDecoder, catalog: MemoryCatalog, loop_forever: bool) -> Self {
            let decoder = Arc::new(decoder);
            let reader = ChunkedCursorReader::new(decoder, vec![obs_field()]).with_fallback_rows(4);
            let lane = Lane::new(0, vec![BoundReader::new(Box::new(reader), Arc::new(SamePath))])
                .unwrap();
            let ids = catalog.list_session_ids().unwrap();
            Self {
                catalog,
                allocator: SessionAllocator::new(ids, loop_forever),
                lane,
            }
        }

        fn step(&mut self, seq_length: usize) -> (Vec<u8>, Vec<u8>, Vec<SessionId>, LaneStep) {
            let mut obs = vec![0xeeu8; seq_length];
            let mut reset = vec![0xeeu8; seq_length];
            let mut game_id = vec![0xee; seq_length];
            let ctx = LaneContext {
                allocator: &self.allocator,
                catalog: &self.catalog,
            };
            let view = LaneView {
                fields: vec![&mut obs[..]],
                reset: &mut reset,
                game_id: &mut game_id,
            };
            let step = self.lane.fill(view, &ctx);
            (obs, reset, game_id, step)
        }
    }

    #[test]
    fn test_part_crossing_keeps_session() {
        let decoder = MemoryDecoder::new();
        decoder.add("7/a", MemoryPart::rows(&[1, 2, 3]));
        decoder.add("7/b", MemoryPart::rows(&[4, 5, 6, 7]));
        let catalog = MemoryCatalog::new().session(7, &["7/a", "7/b"]);

        let mut h = Harness::new(decoder, catalog, false);
        let (obs, reset, game_id, step) = h.step(5);

        assert_eq!(obs, vec![1, 2, 3, 4, 5]);
        assert_eq!(reset, vec![0, 0, 0, 0, 0]);
        assert_eq!(game_id, vec![7; 5]);
        assert_eq!(step.new_sessions, 1);
        assert_eq!(step.new_parts, 1);
        assert_eq!(step.padded, 0);
        assert_eq!(h.lane.part_index(), 1);
    }

    #[test]
    fn test_new_session_sets_reset_mid_step() {
        let decoder = MemoryDecoder::new();
        decoder.add("1/a", MemoryPart::rows(&[1, 2]));
        decoder.add("2/a", MemoryPart::rows(&[3, 4, 5, 6]));
        let catalog = MemoryCatalog::new()
            .session(1, &["1/a"])
            .session(2, &["2/a"]);

        let mut h = Harness::new(decoder, catalog, false);
        let (obs, reset, game_id, _) = h.step(4);

        assert_eq!(obs, vec![1, 2, 3, 4]);
        assert_eq!(reset, vec![0, 0, 1, 0]);
        assert_eq!(game_id, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_rotation_at_step_boundary_flags_first_row() {
        let decoder = MemoryDecoder::new();
        decoder.add("1/a", MemoryPart::rows(&[1, 2]));
        decoder.add("2/a", MemoryPart::rows(&[3, 4]));
        let catalog = MemoryCatalog::new()
            .session(1, &["1/a"])
            .session(2, &["2/a"]);

        let mut h = Harness::new(decoder, catalog, false);
        let (_, reset, _, _) = h.step(2);
        assert_eq!(reset, vec![0, 0]);

        let (obs, reset, game_id, _) = h.step(2);
        assert_eq!(obs, vec![3, 4]);
        assert_eq!(reset, vec![1, 0]);
        assert_eq!(game_id, vec![2, 2]);
    }

    #[test]
    fn test_continuation_step_has_no_reset() {
        let decoder = MemoryDecoder::new();
        decoder.add("1/a", MemoryPart::rows(&[1, 2, 3, 4]));
        let catalog = MemoryCatalog::new().session(1, &["1/a"]);

        let mut h = Harness::new(decoder, catalog, true);
        h.step(2);
        let (obs, reset, _, _) = h.step(2);
        assert_eq!(obs, vec![3, 4]);
        assert_eq!(reset, vec![0, 0]);
    }

    #[test]
    fn test_empty_session_is_skipped() {
        let decoder = MemoryDecoder::new();
        decoder.add("3/a", MemoryPart::rows(&[9, 9, 9]));
        let catalog = MemoryCatalog::new()
            .session(2, &[])
            .session(3, &["3/a"]);

        let mut h = Harness::new(decoder, catalog, false);
        let (obs, _, game_id, step) = h.step(3);

        assert_eq!(obs, vec![9, 9, 9]);
        assert_eq!(game_id, vec![3, 3, 3]);
        assert_eq!(step.new_sessions, 1);
    }

    #[test]
    fn test_exhaustion_pads_with_zeros() {
        let decoder = MemoryDecoder::new();
        decoder.add("1/a", MemoryPart::rows(&[5, 6]));
        let catalog = MemoryCatalog::new().session(1, &["1/a"]);

        let mut h = Harness::new(decoder, catalog, false);
        let (obs, reset, game_id, step) = h.step(4);
        assert_eq!(obs, vec![5, 6, 0, 0]);
        assert_eq!(reset, vec![0, 0, 0, 0]);
        assert_eq!(game_id, vec![1, 1, 0, 0]);
        assert_eq!(step.padded, 2);
        assert!(h.lane.is_exhausted());

        // Every later step is all padding
        for _ in 0..3 {
            let (obs, reset, game_id, step) = h.step(4);
            assert_eq!(obs, vec![0; 4]);
            assert_eq!(reset, vec![0; 4]);
            assert_eq!(game_id, vec![0; 4]);
            assert_eq!(step.rows, 0);
        }
    }

    #[test]
    fn test_looping_wraps_session_order() {
        let decoder = MemoryDecoder::new();
        decoder.add("1/a", MemoryPart::rows(&[1]));
        decoder.add("2/a", MemoryPart::rows(&[2]));
        let catalog = MemoryCatalog::new()
            .session(1, &["1/a"])
            .session(2, &["2/a"]);

        let mut h = Harness::new(decoder, catalog, true);
        let (obs, reset, game_id, _) = h.step(5);

        assert_eq!(obs, vec![1, 2, 1, 2, 1]);
        assert_eq!(reset, vec![0, 1, 1, 1, 1]);
        assert_eq!(game_id, vec![1, 2, 1, 2, 1]);
        assert!(!h.lane.is_exhausted());
    }

    #[test]
    fn test_corrupt_part_is_zero_filled() {
        let decoder = MemoryDecoder::new();
        decoder.add("1/a", MemoryPart::rows(&[1, 2]));
        decoder.add("1/b", MemoryPart::broken());
        decoder.add("1/c", MemoryPart::rows(&[3]));
        let catalog = MemoryCatalog::new().session(1, &["1/a", "1/b", "1/c"]);

        let mut h = Harness::new(decoder, catalog, false);
        // Fallback holds 4 rows of zeros
        let (obs, reset, game_id, _) = h.step(7);

        assert_eq!(obs, vec![1, 2, 0, 0, 0, 0, 3]);
        assert_eq!(reset, vec![0; 7]);
        assert_eq!(game_id, vec![1; 7]);
    }

    #[test]
    fn test_looping_over_empty_sessions_terminates() {
        let catalog = MemoryCatalog::new().session(1, &[]).session(2, &[]);

        let mut h = Harness::new(MemoryDecoder::new(), catalog, true);
        let (obs, _, game_id, step) = h.step(3);

        assert_eq!(obs, vec![0; 3]);
        assert_eq!(game_id, vec![0; 3]);
        assert_eq!(step.padded, 3);
        assert!(h.lane.is_exhausted());
    }

    #[test]
    fn test_looping_over_rowless_parts_terminates() {
        let decoder = MemoryDecoder::new();
        decoder.add("1/a", MemoryPart::rows(&[]));
        let catalog = MemoryCatalog::new().session(1, &["1/a"]);

        let mut h = Harness::new(decoder, catalog, true);
        let (_, _, game_id, _) = h.step(3);

        assert_eq!(game_id, vec![0; 3]);
        assert!(h.lane.is_exhausted());
    }

    #[test]
    fn test_looping_past_barren_sessions_keeps_going() {
        let decoder = MemoryDecoder::new();
        decoder.add("2/a", MemoryPart::rows(&[]));
        decoder.add("3/a", MemoryPart::rows(&[5]));
        let catalog = MemoryCatalog::new()
            .session(1, &[])
            .session(2, &["2/a"])
            .session(3, &["3/a"]);

        let mut h = Harness::new(decoder, catalog, true);
        for _ in 0..6 {
            let (obs, _, game_id, step) = h.step(2);
            assert_eq!(obs, vec![5, 5]);
            assert_eq!(game_id, vec![3, 3]);
            assert_eq!(step.padded, 0);
        }
        assert!(!h.lane.is_exhausted());
        assert!(!h.allocator.all_barren());
    }

    #[test]
    fn test_prime_surfaces_missing_field() {
        let decoder = MemoryDecoder::new();
        decoder.add(
            "1/a",
            MemoryPart {
                missing_field: true,
                ..MemoryPart::rows(&[1])
            },
        );
        let catalog = MemoryCatalog::new().session(1, &["1/a"]);

        let mut h = Harness::new(decoder, catalog, false);
        let Harness {
            catalog,
            allocator,
            lane,
        } = &mut h;
        let ctx = LaneContext {
            allocator: &*allocator,
            catalog: &*catalog,
        };

        let err = lane.prime(&ctx).unwrap_err();
        assert!(matches!(err, ReplayError::Config { .. }));
    }

    #[test]
    fn test_missing_field_after_priming_zero_fills() {
        let decoder = MemoryDecoder::new();
        decoder.add("1/a", MemoryPart::rows(&[1]));
        decoder.add(
            "1/b",
            MemoryPart {
                missing_field: true,
                ..MemoryPart::rows(&[1])
            },
        );
        let catalog = MemoryCatalog::new().session(1, &["1/a", "1/b"]);

        let mut h = Harness::new(decoder, catalog, false);
        let (obs, _, game_id, _) = h.step(3);
        assert_eq!(obs, vec![1, 0, 0]);
        assert_eq!(game_id, vec![1, 1, 1]);
    }

    #[test]
    fn test_auxiliary_source_fills_same_rows() {
        let decoder = Arc::new(MemoryDecoder::new());
        decoder.add("1/rollout.5.0", MemoryPart::rows(&[1, 2, 3]));
        decoder.add("1/stats_5.npy", MemoryPart::rows(&[7, 8]));
        let catalog = MemoryCatalog::new().session(1, &["1/rollout.5.0"]);

        let stats = FieldSpec::new("stats", DType::I16, &[]);
        let primary = CursorReader::new(decoder.clone(), vec![obs_field()]);
        let auxiliary = CursorReader::new(decoder, vec![stats]);
        let mut lane = Lane::new(
            0,
            vec![
                BoundReader::new(Box::new(primary), derivation_for(None)),
                BoundReader::new(Box::new(auxiliary), derivation_for(Some("stats_{pid}.npy"))),
            ],
        )
        .unwrap();
        assert_eq!(lane.field_count(), 2);

        let allocator = SessionAllocator::new(vec![1], false);
        let ctx = LaneContext {
            allocator: &allocator,
            catalog: &catalog,
        };

        let mut obs = vec![0xeeu8; 4];
        let mut stats = vec![0xeeu8; 8];
        let mut reset = vec![0u8; 4];
        let mut game_id = vec![0; 4];
        let step = lane.fill(
            LaneView {
                fields: vec![&mut obs[..], &mut stats[..]],
                reset: &mut reset,
                game_id: &mut game_id,
            },
            &ctx,
        );

        assert_eq!(step.rows, 3);
        assert_eq!(obs, vec![1, 2, 3, 0]);
        // Auxiliary source is one row short: zero-filled
        assert_eq!(stats, vec![7, 7, 8, 8, 0, 0, 0, 0]);
        assert_eq!(game_id, vec![1, 1, 1, 0]);
    }
}

// rust/replay-core/src/dataset/traits.rs

use std::path::{Path, PathBuf};

use crate::error::{DecodeError, Result};
use crate::field::{FieldSpec, SessionId};

/// A cursor over the rows of one loaded part.
///
/// Every reader serves a fixed list of fields. `drain` writes into one
/// destination slice per field, each holding whole rows of that field.
pub trait RowWindowReader: Send {
    /// Fields written by `drain`, in destination order.
    fn fields(&self) -> &[FieldSpec];

    /// Opens `path` and resets the cursor to 0.
    ///
    /// On error the reader is left empty; callers decide whether to fall back
    /// to [`RowWindowReader::load_zeroed`].
    fn load(&mut self, path: &Path) -> std::result::Result<(), DecodeError>;

    /// Replaces the current part with a large block of zero rows.
    fn load_zeroed(&mut self);

    /// Drops the current part and any decoded rows.
    fn clear(&mut self);

    /// Total rows of the current part.
    fn row_count(&self) -> usize;

    /// Rows already drained from the current part.
    fn cursor(&self) -> usize;

    /// Copies up to `len` rows into rows `offset..offset + len` of `dst` and
    /// advances the cursor. Returns the number of rows still needed.
    fn drain(&mut self, dst: &mut [&mut [u8]], offset: usize, len: usize) -> usize;
}

/// Enumerates sessions and their parts (`list_session_ids`,
/// `list_part_files`).
pub trait SessionCatalog: Send + Sync {
    /// Every session id, in a stable order. Never contains 0.
    fn list_session_ids(&self) -> Result<Vec<SessionId>>;

    /// Parts of `session`, in playback order. Empty is valid.
    fn list_part_files(&self, session: SessionId) -> Result<Vec<PathBuf>>;
}

/// Maps a listed part path to the file a source reads for that part.
pub trait PathDerivation: Send + Sync {
    /// Returns `None` when no path can be derived from `part`.
    fn derive(&self, part: &Path) -> Option<PathBuf>;
}

/// Writes zeros into rows `offset..offset + len` of every destination.
pub fn zero_rows(dst: &mut [&mut [u8]], fields: &[FieldSpec], offset: usize, len: usize) {
    for (buffer, field) in dst.iter_mut().zip(fields) {
        let width = field.row_bytes();
        buffer[offset * width..(offset + len) * width].fill(0);
    }
}

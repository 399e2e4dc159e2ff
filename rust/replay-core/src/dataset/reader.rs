// rust/replay-core/src/dataset/reader.rs

//! Row-window readers.
//!
//! [`CursorReader`] decodes a whole part on load and drains from memory.
//! [`ChunkedCursorReader`] keeps only the current row-group decoded and pulls
//! the next one when a drain crosses its end. Both report the part's full row
//! count from metadata, so the remainder arithmetic is the same.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::DecodeError;
use crate::field::FieldSpec;
use crate::source::{ColumnChunk, RowSource, SourceDecoder};

use super::traits::{zero_rows, RowWindowReader};

/// Rows of zeros substituted for a part that cannot be decoded.
pub const DEFAULT_FALLBACK_ROWS: usize = 200_000;

/// Copies `rows` rows of `chunk` starting at `from` into `dst` at `offset`.
fn copy_rows(
    dst: &mut [&mut [u8]],
    fields: &[FieldSpec],
    chunk: &ColumnChunk,
    from: usize,
    offset: usize,
    rows: usize,
) {
    for (index, (buffer, field)) in dst.iter_mut().zip(fields).enumerate() {
        let width = field.row_bytes();
        buffer[offset * width..(offset + rows) * width]
            .copy_from_slice(&chunk.column(index)[from * width..(from + rows) * width]);
    }
}

#[derive(Debug, Default)]
enum Window {
    #[default]
    Empty,
    Rows(ColumnChunk),
    Zeroed(usize),
}

/// Reader that materializes the whole part on load.
pub struct CursorReader {
    decoder: Arc<dyn SourceDecoder>,
    fields: Vec<FieldSpec>,
    fallback_rows: usize,
    window: Window,
    cursor: usize,
}

impl CursorReader {
    pub fn new(decoder: Arc<dyn SourceDecoder>, fields: Vec<FieldSpec>) -> Self {
        Self {
            decoder,
            fields,
            fallback_rows: DEFAULT_FALLBACK_ROWS,
            window: Window::Empty,
            cursor: 0,
        }
    }

    #[must_use]
    pub fn with_fallback_rows(mut self, rows: usize) -> Self {
        self.fallback_rows = rows;
        self
    }

    fn decode_all(&self, path: &Path) -> Result<ColumnChunk, DecodeError> {
        let mut source = self.decoder.open(path, &self.fields)?;
        let total = source.num_rows();
        let mut data = ColumnChunk::empty(self.fields.len());
        while data.rows() < total {
            match source.next_chunk()? {
                Some(chunk) => data.append(chunk),
                None => break,
            }
        }
        data.truncate(total, &self.fields);
        Ok(data)
    }
}

impl RowWindowReader for CursorReader {
    fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn load(&mut self, path: &Path) -> Result<(), DecodeError> {
        self.clear();
        self.window = Window::Rows(self.decode_all(path)?);
        Ok(())
    }

    fn load_zeroed(&mut self) {
        self.cursor = 0;
        self.window = Window::Zeroed(self.fallback_rows);
    }

    fn clear(&mut self) {
        self.cursor = 0;
        self.window = Window::Empty;
    }

    fn row_count(&self) -> usize {
        match &self.window {
            Window::Empty => 0,
            Window::Rows(chunk) => chunk.rows(),
            Window::Zeroed(rows) => *rows,
        }
    }

    fn cursor(&self) -> usize {
        self.cursor
    }

    fn drain(&mut self, dst: &mut [&mut [u8]], offset: usize, len: usize) -> usize {
        let k = len.min(self.row_count() - self.cursor);
        match &self.window {
            Window::Empty => {}
            Window::Rows(chunk) => copy_rows(dst, &self.fields, chunk, self.cursor, offset, k),
            Window::Zeroed(_) => zero_rows(dst, &self.fields, offset, k),
        }
        self.cursor += k;
        len - k
    }
}

/// Reader that decodes one row-group at a time.
pub struct ChunkedCursorReader {
    decoder: Arc<dyn SourceDecoder>,
    fields: Vec<FieldSpec>,
    fallback_rows: usize,
    path: Option<PathBuf>,
    source: Option<Box<dyn RowSource>>,
    chunk: ColumnChunk,
    chunk_cursor: usize,
    // Rows past the cursor are served as zeros.
    zero_tail: bool,
    total: usize,
    cursor: usize,
}

impl ChunkedCursorReader {
    pub fn new(decoder: Arc<dyn SourceDecoder>, fields: Vec<FieldSpec>) -> Self {
        let chunk = ColumnChunk::empty(fields.len());
        Self {
            decoder,
            fields,
            fallback_rows: DEFAULT_FALLBACK_ROWS,
            path: None,
            source: None,
            chunk,
            chunk_cursor: 0,
            zero_tail: false,
            total: 0,
            cursor: 0,
        }
    }

    #[must_use]
    pub fn with_fallback_rows(mut self, rows: usize) -> Self {
        self.fallback_rows = rows;
        self
    }

    /// Rows decoded and not yet drained from the current row-group.
    pub fn buffered_rows(&self) -> usize {
        self.chunk.rows() - self.chunk_cursor
    }

    fn path_display(&self) -> std::path::Display<'_> {
        self.path.as_deref().unwrap_or(Path::new("")).display()
    }

    /// Pulls the next row-group. Returns false when nothing more can be read
    /// from the source.
    fn advance_chunk(&mut self) -> bool {
        let Some(source) = self.source.as_mut() else {
            return false;
        };
        match source.next_chunk() {
            Ok(Some(chunk)) => {
                self.chunk = chunk;
                self.chunk_cursor = 0;
                true
            }
            Ok(None) => {
                tracing::warn!(
                    "Source {} ended after {} of {} rows",
                    self.path_display(),
                    self.cursor,
                    self.total
                );
                self.total = self.cursor;
                self.source = None;
                false
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to decode row-group of {}, zero-filling {} rows: {}",
                    self.path_display(),
                    self.total - self.cursor,
                    e
                );
                self.source = None;
                self.zero_tail = true;
                false
            }
        }
    }
}

impl RowWindowReader for ChunkedCursorReader {
    fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    fn load(&mut self, path: &Path) -> Result<(), DecodeError> {
        self.clear();
        let mut source = self.decoder.open(path, &self.fields)?;
        let total = source.num_rows();
        if total > 0 {
            if let Some(chunk) = source.next_chunk()? {
                self.chunk = chunk;
            }
        }
        self.total = total;
        self.source = Some(source);
        self.path = Some(path.to_path_buf());
        Ok(())
    }

    fn load_zeroed(&mut self) {
        self.clear();
        self.total = self.fallback_rows;
        self.zero_tail = true;
    }

    fn clear(&mut self) {
        self.path = None;
        self.source = None;
        self.chunk = ColumnChunk::empty(self.fields.len());
        self.chunk_cursor = 0;
        self.zero_tail = false;
        self.total = 0;
        self.cursor = 0;
    }

    fn row_count(&self) -> usize {
        self.total
    }

    fn cursor(&self) -> usize {
        self.cursor
    }

    fn drain(&mut self, dst: &mut [&mut [u8]], offset: usize, len: usize) -> usize {
        let mut copied = 0;
        while copied < len && self.cursor < self.total {
            let wanted = (len - copied).min(self.total - self.cursor);

            if self.zero_tail {
                zero_rows(dst, &self.fields, offset + copied, wanted);
                copied += wanted;
                self.cursor += wanted;
                continue;
            }

            if self.buffered_rows() == 0 {
                if !self.advance_chunk() && !self.zero_tail {
                    break;
                }
                continue;
            }

            let k = wanted.min(self.buffered_rows());
            copy_rows(dst, &self.fields, &self.chunk, self.chunk_cursor, offset + copied, k);
            self.chunk_cursor += k;
            self.cursor += k;
            copied += k;
        }

        // Release the decoded part as soon as it is fully drained
        if self.cursor == self.total {
            self.source = None;
            self.chunk = ColumnChunk::empty(self.fields.len());
            self.chunk_cursor = 0;
        }
        len - copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::test_support::{obs_field, MemoryDecoder, MemoryPart};
    use crate::field::DType;

    fn drain_u8(reader: &mut dyn RowWindowReader, out: &mut [u8], offset: usize, len: usize) -> usize {
        let mut dst = vec![out];
        reader.drain(&mut dst, offset, len)
    }

    fn decoder() -> Arc<MemoryDecoder> {
        let decoder = MemoryDecoder::new();
        decoder.add("a", MemoryPart::chunked(&[&[1, 2, 3], &[4, 5], &[6, 7, 8, 9]]));
        decoder.add("bad", MemoryPart::broken());
        decoder.add(
            "torn",
            MemoryPart {
                fail_at: Some(1),
                ..MemoryPart::chunked(&[&[1, 2], &[3, 4]])
            },
        );
        decoder.add(
            "short",
            MemoryPart {
                claimed_rows: Some(6),
                ..MemoryPart::chunked(&[&[1, 2], &[3, 4]])
            },
        );
        Arc::new(decoder)
    }

    fn readers() -> Vec<Box<dyn RowWindowReader>> {
        let decoder = decoder();
        vec![
            Box::new(CursorReader::new(decoder.clone(), vec![obs_field()])),
            Box::new(ChunkedCursorReader::new(decoder, vec![obs_field()])),
        ]
    }

    #[test]
    fn test_drains_concatenate_to_source() {
        for mut reader in readers() {
            reader.load(Path::new("a")).unwrap();
            assert_eq!(reader.row_count(), 9);

            let mut out = [0u8; 9];
            assert_eq!(drain_u8(&mut *reader, &mut out, 0, 2), 0);
            assert_eq!(drain_u8(&mut *reader, &mut out, 2, 4), 0);
            assert_eq!(drain_u8(&mut *reader, &mut out, 6, 3), 0);
            assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 9]);
            assert_eq!(reader.cursor(), 9);

            // Fully drained: nothing more is copied
            assert_eq!(drain_u8(&mut *reader, &mut out, 0, 3), 3);
            assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 9]);
        }
    }

    #[test]
    fn test_remainder_when_source_runs_out() {
        for mut reader in readers() {
            reader.load(Path::new("a")).unwrap();

            let mut out = [0xffu8; 12];
            assert_eq!(drain_u8(&mut *reader, &mut out, 1, 11), 2);
            assert_eq!(&out[..10], &[0xff, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
            // Rows past the copied count are untouched
            assert_eq!(&out[10..], &[0xff, 0xff]);
        }
    }

    #[test]
    fn test_reload_resets_cursor() {
        for mut reader in readers() {
            reader.load(Path::new("a")).unwrap();
            let mut out = [0u8; 4];
            drain_u8(&mut *reader, &mut out, 0, 4);

            reader.load(Path::new("a")).unwrap();
            assert_eq!(reader.cursor(), 0);
            drain_u8(&mut *reader, &mut out, 0, 4);
            assert_eq!(out, [1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_failed_load_leaves_reader_empty() {
        for mut reader in readers() {
            reader.load(Path::new("a")).unwrap();
            assert!(reader.load(Path::new("bad")).is_err());
            assert_eq!(reader.row_count(), 0);

            let mut out = [0u8; 3];
            assert_eq!(drain_u8(&mut *reader, &mut out, 0, 3), 3);

            assert!(reader.load(Path::new("absent")).is_err());
        }
    }

    #[test]
    fn test_zero_fallback() {
        let decoder = decoder();
        let mut readers: Vec<Box<dyn RowWindowReader>> = vec![
            Box::new(CursorReader::new(decoder.clone(), vec![obs_field()]).with_fallback_rows(5)),
            Box::new(ChunkedCursorReader::new(decoder, vec![obs_field()]).with_fallback_rows(5)),
        ];

        for reader in readers.iter_mut() {
            reader.load_zeroed();
            assert_eq!(reader.row_count(), 5);

            let mut out = [7u8; 8];
            assert_eq!(drain_u8(&mut **reader, &mut out, 0, 8), 3);
            assert_eq!(out, [0, 0, 0, 0, 0, 7, 7, 7]);
        }
    }

    #[test]
    fn test_default_fallback_covers_a_drain() {
        let reader = ChunkedCursorReader::new(decoder(), vec![obs_field()]);
        let mut reader: Box<dyn RowWindowReader> = Box::new(reader);
        reader.load_zeroed();
        assert_eq!(reader.row_count(), DEFAULT_FALLBACK_ROWS);
    }

    #[test]
    fn test_chunked_pulls_row_groups_lazily() {
        let decoder = decoder();
        let mut reader = ChunkedCursorReader::new(decoder.clone(), vec![obs_field()]);
        reader.load(Path::new("a")).unwrap();
        assert_eq!(reader.buffered_rows(), 3);

        let mut out = [0u8; 4];
        drain_u8(&mut reader, &mut out, 0, 4);
        assert_eq!(out, [1, 2, 3, 4]);
        // Second row-group decoded, one row left in it
        assert_eq!(reader.buffered_rows(), 1);
    }

    #[test]
    fn test_chunked_mid_part_failure_zero_fills() {
        let mut reader = ChunkedCursorReader::new(decoder(), vec![obs_field()]);
        reader.load(Path::new("torn")).unwrap();
        assert_eq!(reader.row_count(), 4);

        let mut out = [9u8; 5];
        assert_eq!(drain_u8(&mut reader, &mut out, 0, 5), 1);
        assert_eq!(out, [1, 2, 0, 0, 9]);
    }

    #[test]
    fn test_chunked_short_source_shrinks_total() {
        let mut reader = ChunkedCursorReader::new(decoder(), vec![obs_field()]);
        reader.load(Path::new("short")).unwrap();
        assert_eq!(reader.row_count(), 6);

        let mut out = [0u8; 6];
        assert_eq!(drain_u8(&mut reader, &mut out, 0, 6), 2);
        assert_eq!(reader.row_count(), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_multi_field_rows() {
        let decoder = decoder();
        let fields = vec![obs_field(), FieldSpec::new("wide", DType::I16, &[2])];
        let mut reader = CursorReader::new(decoder, fields);
        reader.load(Path::new("a")).unwrap();

        let mut obs = [0u8; 2];
        let mut wide = [0u8; 8];
        {
            let mut dst = vec![&mut obs[..], &mut wide[..]];
            assert_eq!(reader.drain(&mut dst, 0, 2), 0);
        }
        assert_eq!(obs, [1, 2]);
        assert_eq!(wide, [1, 1, 1, 1, 2, 2, 2, 2]);
    }
}

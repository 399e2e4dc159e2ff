// rust/replay-core/src/source/npy.rs

//! Flat `.npy` array parts.
//!
//! Only C-ordered little-endian (or single-byte) arrays are accepted. The
//! leading dimension is the row axis; the remaining dimensions must match the
//! single requested field's shape.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::{ColumnChunk, RowSource, SourceDecoder};
use crate::error::DecodeError;
use crate::field::FieldSpec;

const MAGIC: &[u8] = b"\x93NUMPY";

/// Opens `.npy` parts. Each part carries exactly one field.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpyDecoder;

impl SourceDecoder for NpyDecoder {
    fn open(&self, path: &Path, fields: &[FieldSpec]) -> Result<Box<dyn RowSource>, DecodeError> {
        Ok(Box::new(NpySource::open(path, fields)?))
    }

    fn name(&self) -> &'static str {
        "npy"
    }
}

/// A memory-mapped `.npy` array emitted as a single chunk.
#[derive(Debug)]
pub struct NpySource {
    path: PathBuf,
    mmap: Option<Mmap>,
    data_offset: usize,
    row_bytes: usize,
    num_rows: usize,
}

#[derive(Debug, PartialEq)]
struct Header {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

impl NpySource {
    /// Maps `path` and validates its header against `fields`.
    pub fn open(path: &Path, fields: &[FieldSpec]) -> Result<Self, DecodeError> {
        let field = match fields {
            [field] => field,
            _ => {
                return Err(DecodeError::malformed(
                    path,
                    format!("npy parts hold one field, {} requested", fields.len()),
                ))
            }
        };

        let file = File::open(path).map_err(|e| DecodeError::io(path, e))?;
        // SAFETY: the part is treated as read-only for the lifetime of the map
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| DecodeError::io(path, e))?;

        let (header, data_offset) = parse_header(path, &mmap)?;

        if header.descr != field.dtype.npy_descr() {
            return Err(DecodeError::malformed(
                path,
                format!(
                    "dtype '{}' does not match field '{}' ({})",
                    header.descr,
                    field.name,
                    field.dtype.npy_descr()
                ),
            ));
        }
        if header.fortran_order && header.shape.len() > 1 {
            return Err(DecodeError::malformed(path, "fortran-ordered arrays are not supported"));
        }

        let (num_rows, row_shape) = match header.shape.split_first() {
            Some((rows, rest)) => (*rows, rest),
            None => return Err(DecodeError::malformed(path, "zero-dimensional array")),
        };
        let row_elements = row_shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim));
        if row_elements != Some(field.elements_per_row()) {
            return Err(DecodeError::malformed(
                path,
                format!(
                    "row shape {:?} does not match field '{}' shape {:?}",
                    row_shape, field.name, field.shape
                ),
            ));
        }

        let row_bytes = field.row_bytes();
        let needed = num_rows
            .checked_mul(row_bytes)
            .and_then(|data| data.checked_add(data_offset))
            .ok_or_else(|| DecodeError::malformed(path, "array size overflows"))?;
        if mmap.len() < needed {
            return Err(DecodeError::malformed(
                path,
                format!("file holds {} bytes, header describes {}", mmap.len(), needed),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap: Some(mmap),
            data_offset,
            row_bytes,
            num_rows,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RowSource for NpySource {
    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn next_chunk(&mut self) -> Result<Option<ColumnChunk>, DecodeError> {
        let Some(mmap) = self.mmap.take() else {
            return Ok(None);
        };
        let end = self.data_offset + self.num_rows * self.row_bytes;
        let data = mmap[self.data_offset..end].to_vec();
        Ok(Some(ColumnChunk::new(self.num_rows, vec![data])))
    }
}

/// Parses the magic, version and header dict. Returns the header and the
/// offset of the first data byte.
fn parse_header(path: &Path, bytes: &[u8]) -> Result<(Header, usize), DecodeError> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(DecodeError::malformed(path, "bad magic"));
    }

    let major = bytes[6];
    let (len, start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10usize),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(DecodeError::malformed(path, "truncated header"));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(DecodeError::malformed(path, format!("unsupported npy version {v}"))),
    };

    let end = start
        .checked_add(len)
        .ok_or_else(|| DecodeError::malformed(path, "truncated header"))?;
    let text = bytes
        .get(start..end)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .ok_or_else(|| DecodeError::malformed(path, "truncated header"))?;

    let descr = dict_value(text, "descr")
        .and_then(quoted)
        .ok_or_else(|| DecodeError::malformed(path, "header has no descr"))?;
    let fortran_order = match dict_value(text, "fortran_order") {
        Some(v) if v.starts_with("True") => true,
        Some(v) if v.starts_with("False") => false,
        _ => return Err(DecodeError::malformed(path, "header has no fortran_order")),
    };
    let shape = dict_value(text, "shape")
        .and_then(parse_shape)
        .ok_or_else(|| DecodeError::malformed(path, "header has no shape"))?;

    Ok((
        Header {
            descr: descr.to_string(),
            fortran_order,
            shape,
        },
        end,
    ))
}

/// Text following `'key':` in a python dict literal.
fn dict_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{key}':");
    let at = text.find(&needle)? + needle.len();
    Some(text[at..].trim_start())
}

fn quoted(value: &str) -> Option<&str> {
    let rest = value.strip_prefix('\'')?;
    let close = rest.find('\'')?;
    Some(&rest[..close])
}

fn parse_shape(value: &str) -> Option<Vec<usize>> {
    let rest = value.strip_prefix('(')?;
    let close = rest.find(')')?;
    rest[..close]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().ok())
        .collect()
}

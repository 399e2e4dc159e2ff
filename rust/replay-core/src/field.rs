// rust/replay-core/src/field.rs

//! Field descriptions and the caller-owned batch buffers they shape.
//!
//! Every field is stored as native-endian bytes with a fixed per-row width.
//! A batch buffer for a field has shape `[batch_size, seq_length, *shape]`
//! and is laid out lane-major, so lane `i` owns one contiguous slice of
//! `seq_length` rows.

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

use crate::error::{ReplayError, Result};

/// Session identifier. `0` is reserved as the padding sentinel.
pub type SessionId = u64;

/// Element type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    I8,
    I16,
    I32,
    I64,
    F32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::I16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 => 8,
        }
    }

    /// The Arrow type values are cast to before copying.
    pub fn arrow_type(self) -> DataType {
        match self {
            DType::U8 => DataType::UInt8,
            DType::I8 => DataType::Int8,
            DType::I16 => DataType::Int16,
            DType::I32 => DataType::Int32,
            DType::I64 => DataType::Int64,
            DType::F32 => DataType::Float32,
        }
    }

    /// The `.npy` type descriptor for this type (little-endian).
    pub fn npy_descr(self) -> &'static str {
        match self {
            DType::U8 => "|u1",
            DType::I8 => "|i1",
            DType::I16 => "<i2",
            DType::I32 => "<i4",
            DType::I64 => "<i8",
            DType::F32 => "<f4",
        }
    }
}

/// Rust element types that can be read back out of a [`FieldBuffer`].
pub trait Element: Copy + Default + Send + Sync + 'static {
    const DTYPE: DType;

    fn from_ne_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $dtype:expr) => {
        impl Element for $t {
            const DTYPE: DType = $dtype;

            fn from_ne_slice(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }
        }
    };
}

impl_element!(u8, DType::U8);
impl_element!(i8, DType::I8);
impl_element!(i16, DType::I16);
impl_element!(i32, DType::I32);
impl_element!(i64, DType::I64);
impl_element!(f32, DType::F32);

/// A named field with a fixed per-row shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Name of the field in produced batches.
    pub name: String,
    /// Column to read in the source. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    /// Element type.
    pub dtype: DType,
    /// Per-row shape. Empty for one scalar per row.
    #[serde(default)]
    pub shape: Vec<usize>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, dtype: DType, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            column: None,
            dtype,
            shape: shape.to_vec(),
        }
    }

    /// Reads the field from a differently named source column.
    #[must_use]
    pub fn from_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    /// Number of elements in one row.
    pub fn elements_per_row(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of bytes in one row.
    pub fn row_bytes(&self) -> usize {
        self.elements_per_row() * self.dtype.size()
    }
}

/// Storage for one field of a batch.
#[derive(Debug, Clone)]
pub struct FieldBuffer {
    spec: FieldSpec,
    data: Vec<u8>,
}

impl FieldBuffer {
    pub fn spec(&self) -> &FieldSpec {
        &self.spec
    }

    /// Raw native-endian bytes, lane-major.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Decodes the whole buffer as `T`.
    pub fn values<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.spec.dtype {
            return Err(ReplayError::shape(format!(
                "field '{}' holds {:?}, not {:?}",
                self.spec.name,
                self.spec.dtype,
                T::DTYPE
            )));
        }
        Ok(self
            .data
            .chunks_exact(self.spec.dtype.size())
            .map(T::from_ne_slice)
            .collect())
    }
}

/// One batch: a buffer per field plus the `reset` and `game_id` planes.
///
/// Allocated by the caller once per pass and overwritten in place on every
/// batch step.
#[derive(Debug, Clone)]
pub struct BatchBuffers {
    batch_size: usize,
    seq_length: usize,
    fields: Vec<FieldBuffer>,
    reset: Vec<u8>,
    game_id: Vec<SessionId>,
}

impl BatchBuffers {
    /// Allocates zeroed buffers of shape `[batch_size, seq_length, *shape]`.
    pub fn new(batch_size: usize, seq_length: usize, fields: &[FieldSpec]) -> Self {
        let rows = batch_size * seq_length;
        let fields = fields
            .iter()
            .map(|spec| FieldBuffer {
                data: vec![0u8; rows * spec.row_bytes()],
                spec: spec.clone(),
            })
            .collect();

        Self {
            batch_size,
            seq_length,
            fields,
            reset: vec![0u8; rows],
            game_id: vec![0; rows],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_length(&self) -> usize {
        self.seq_length
    }

    pub fn fields(&self) -> &[FieldBuffer] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldBuffer> {
        self.fields.iter().find(|f| f.spec.name == name)
    }

    /// `[batch_size, seq_length]`; 1 marks the first row of a new session.
    pub fn reset(&self) -> &[u8] {
        &self.reset
    }

    /// `[batch_size, seq_length]`; the session that produced each row.
    pub fn game_id(&self) -> &[SessionId] {
        &self.game_id
    }

    pub(crate) fn planes_mut(&mut self) -> (&mut [FieldBuffer], &mut [u8], &mut [SessionId]) {
        (&mut self.fields, &mut self.reset, &mut self.game_id)
    }

    /// Raw bytes of one row of a field.
    pub fn row(&self, field: usize, lane: usize, step: usize) -> Option<&[u8]> {
        let buffer = self.fields.get(field)?;
        if lane >= self.batch_size || step >= self.seq_length {
            return None;
        }
        let width = buffer.spec.row_bytes();
        let start = (lane * self.seq_length + step) * width;
        buffer.data.get(start..start + width)
    }

    /// Session id at the final sequence position of every lane.
    pub fn last_game_ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.game_id
            .chunks(self.seq_length.max(1))
            .filter_map(|lane| lane.last().copied())
    }

    /// Checks that these buffers were allocated for the given layout.
    pub fn check_layout(&self, batch_size: usize, seq_length: usize, fields: &[FieldSpec]) -> Result<()> {
        if self.batch_size != batch_size || self.seq_length != seq_length {
            return Err(ReplayError::shape(format!(
                "buffers are [{}, {}], expected [{}, {}]",
                self.batch_size, self.seq_length, batch_size, seq_length
            )));
        }
        if self.fields.len() != fields.len()
            || self.fields.iter().zip(fields).any(|(buffer, spec)| &buffer.spec != spec)
        {
            return Err(ReplayError::shape("buffer fields do not match the dataset fields"));
        }
        Ok(())
    }
}

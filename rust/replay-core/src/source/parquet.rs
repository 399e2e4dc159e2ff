// rust/replay-core/src/source/parquet.rs

//! Columnar part files.
//!
//! The footer is read once when the part is opened; after that each call to
//! [`RowSource::next_chunk`] decodes exactly one row-group of the projected
//! columns. Fields may be stored as plain primitive columns (one element per
//! row) or as list / fixed-size-list columns whose every row holds
//! `elements_per_row` values. Values are cast to the field's element type.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow_array::cast::AsArray;
use arrow_array::types::{
    Float32Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt8Type,
};
use arrow_array::{Array, ArrayRef, ArrowPrimitiveType, RecordBatch};
use arrow_buffer::ToByteSlice;
use arrow_schema::DataType;
use parquet::arrow::arrow_reader::{
    ArrowReaderMetadata, ArrowReaderOptions, ParquetRecordBatchReaderBuilder,
};
use parquet::arrow::ProjectionMask;

use super::{ColumnChunk, RowSource, SourceDecoder};
use crate::error::DecodeError;
use crate::field::{DType, FieldSpec};

/// Opens Parquet parts.
#[derive(Debug, Clone, Default)]
pub struct ParquetDecoder {
    /// Rows dropped from the end of every part.
    pub trim_trailing_rows: usize,
}

impl ParquetDecoder {
    pub fn new(trim_trailing_rows: usize) -> Self {
        Self { trim_trailing_rows }
    }
}

impl SourceDecoder for ParquetDecoder {
    fn open(&self, path: &Path, fields: &[FieldSpec]) -> Result<Box<dyn RowSource>, DecodeError> {
        Ok(Box::new(ParquetSource::open(path, fields, self.trim_trailing_rows)?))
    }

    fn name(&self) -> &'static str {
        "parquet"
    }
}

/// A Parquet part decoded one row-group at a time.
pub struct ParquetSource {
    path: PathBuf,
    file: File,
    metadata: ArrowReaderMetadata,
    projection: ProjectionMask,
    fields: Vec<FieldSpec>,
    next_row_group: usize,
    num_rows: usize,
    emitted: usize,
}

impl std::fmt::Debug for ParquetSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParquetSource")
            .field("path", &self.path)
            .field("num_rows", &self.num_rows)
            .field("next_row_group", &self.next_row_group)
            .finish()
    }
}

impl ParquetSource {
    /// Opens `path` and checks that every field's column exists.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` if a column is absent, or an I/O / Parquet error
    /// if the footer cannot be read.
    pub fn open(path: &Path, fields: &[FieldSpec], trim_trailing_rows: usize) -> Result<Self, DecodeError> {
        let file = File::open(path).map_err(|e| DecodeError::io(path, e))?;
        let metadata = ArrowReaderMetadata::load(&file, ArrowReaderOptions::new())
            .map_err(|e| DecodeError::parquet(path, e))?;

        let mut roots = Vec::with_capacity(fields.len());
        for field in fields {
            let index = metadata
                .schema()
                .index_of(field.column_name())
                .map_err(|_| DecodeError::missing_field(path, field.column_name()))?;
            roots.push(index);
        }
        let projection =
            ProjectionMask::roots(metadata.metadata().file_metadata().schema_descr(), roots);

        let total = metadata.metadata().file_metadata().num_rows().max(0) as usize;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            projection,
            fields: fields.to_vec(),
            next_row_group: 0,
            num_rows: total.saturating_sub(trim_trailing_rows),
            emitted: 0,
            metadata,
        })
    }

    /// Number of row-groups in the part.
    pub fn num_row_groups(&self) -> usize {
        self.metadata.metadata().num_row_groups()
    }

    fn decode_batch(&self, batch: &RecordBatch) -> Result<ColumnChunk, DecodeError> {
        let mut columns = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let array = batch
                .column_by_name(field.column_name())
                .ok_or_else(|| DecodeError::missing_field(&self.path, field.column_name()))?;
            columns.push(column_bytes(&self.path, array, field)?);
        }
        Ok(ColumnChunk::new(batch.num_rows(), columns))
    }
}

impl RowSource for ParquetSource {
    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn next_chunk(&mut self) -> Result<Option<ColumnChunk>, DecodeError> {
        if self.emitted >= self.num_rows || self.next_row_group >= self.num_row_groups() {
            return Ok(None);
        }

        let row_group = self.next_row_group;
        self.next_row_group += 1;
        let group_rows = self.metadata.metadata().row_group(row_group).num_rows().max(1) as usize;

        let file = self.file.try_clone().map_err(|e| DecodeError::io(&self.path, e))?;
        let reader = ParquetRecordBatchReaderBuilder::new_with_metadata(file, self.metadata.clone())
            .with_projection(self.projection.clone())
            .with_row_groups(vec![row_group])
            .with_batch_size(group_rows)
            .build()
            .map_err(|e| DecodeError::parquet(&self.path, e))?;

        let mut chunk = ColumnChunk::empty(self.fields.len());
        for batch in reader {
            let batch = batch.map_err(|e| DecodeError::arrow(&self.path, e))?;
            chunk.append(self.decode_batch(&batch)?);
        }

        chunk.truncate(self.num_rows - self.emitted, &self.fields);
        self.emitted += chunk.rows();
        Ok(Some(chunk))
    }
}

/// Flattens one column into native-endian bytes of `field.dtype`.
fn column_bytes(path: &Path, array: &ArrayRef, field: &FieldSpec) -> Result<Vec<u8>, DecodeError> {
    let rows = array.len();
    let width = field.elements_per_row();

    let values: ArrayRef = match array.data_type() {
        DataType::List(_) => {
            let list = array.as_list::<i32>();
            let offsets = list.value_offsets();
            if offsets.windows(2).any(|w| (w[1] - w[0]) as usize != width) {
                return Err(ragged(path, field));
            }
            let start = offsets[0] as usize;
            list.values().slice(start, rows * width)
        }
        DataType::LargeList(_) => {
            let list = array.as_list::<i64>();
            let offsets = list.value_offsets();
            if offsets.windows(2).any(|w| (w[1] - w[0]) as usize != width) {
                return Err(ragged(path, field));
            }
            let start = offsets[0] as usize;
            list.values().slice(start, rows * width)
        }
        DataType::FixedSizeList(_, length) => {
            if *length as usize != width {
                return Err(ragged(path, field));
            }
            let list = array.as_fixed_size_list();
            let start = if rows == 0 { 0 } else { list.value_offset(0) as usize };
            list.values().slice(start, rows * width)
        }
        _ if width == 1 => array.clone(),
        other => {
            return Err(DecodeError::malformed(
                path,
                format!(
                    "column '{}' is {other} but field '{}' expects {width} values per row",
                    field.column_name(),
                    field.name
                ),
            ));
        }
    };

    if values.null_count() > 0 {
        return Err(DecodeError::malformed(
            path,
            format!("column '{}' contains nulls", field.column_name()),
        ));
    }

    let values = arrow_cast::cast(values.as_ref(), &field.dtype.arrow_type())
        .map_err(|e| DecodeError::arrow(path, e))?;

    Ok(match field.dtype {
        DType::U8 => native_bytes::<UInt8Type>(&values),
        DType::I8 => native_bytes::<Int8Type>(&values),
        DType::I16 => native_bytes::<Int16Type>(&values),
        DType::I32 => native_bytes::<Int32Type>(&values),
        DType::I64 => native_bytes::<Int64Type>(&values),
        DType::F32 => native_bytes::<Float32Type>(&values),
    })
}

fn native_bytes<T: ArrowPrimitiveType>(array: &ArrayRef) -> Vec<u8> {
    array.as_primitive::<T>().values().to_byte_slice().to_vec()
}

fn ragged(path: &Path, field: &FieldSpec) -> DecodeError {
    DecodeError::malformed(
        path,
        format!(
            "column '{}' rows do not all hold {} values",
            field.column_name(),
            field.elements_per_row()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow_array::{Int64Array, ListArray, UInt8Array};
    use arrow_schema::{Field, Schema};
    use parquet::arrow::ArrowWriter;
    use parquet::file::properties::WriterProperties;
    use tempfile::TempDir;

    /// Writes `rows` rows with an `actions` scalar column and a 2-wide
    /// `blstats` list column, `group` rows per row-group.
    fn write_part(dir: &TempDir, rows: usize, group: usize) -> PathBuf {
        let actions = UInt8Array::from_iter_values((0..rows).map(|i| i as u8));
        let blstats = ListArray::from_iter_primitive::<Int64Type, _, _>(
            (0..rows).map(|i| Some(vec![Some(i as i64 * 10), Some(i as i64 * 10 + 1)])),
        );
        let schema = Arc::new(Schema::new(vec![
            Field::new("actions", actions.data_type().clone(), false),
            Field::new("blstats", blstats.data_type().clone(), true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(actions), Arc::new(blstats)],
        )
        .unwrap();

        let path = dir.path().join("part.parquet");
        let file = File::create(&path).unwrap();
        let props = WriterProperties::builder().set_max_row_group_size(group).build();
        let mut writer = ArrowWriter::try_new(file, schema, Some(props)).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
        path
    }

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("keypresses", DType::U8, &[]).from_column("actions"),
            FieldSpec::new("blstats", DType::I32, &[2]),
        ]
    }

    #[test]
    fn test_row_groups_decode_incrementally() {
        let dir = TempDir::new().unwrap();
        let path = write_part(&dir, 7, 3);

        let mut source = ParquetSource::open(&path, &fields(), 0).unwrap();
        assert_eq!(source.num_rows(), 7);
        assert_eq!(source.num_row_groups(), 3);

        let mut sizes = vec![];
        let mut actions = vec![];
        let mut blstats = vec![];
        while let Some(chunk) = source.next_chunk().unwrap() {
            sizes.push(chunk.rows());
            actions.extend_from_slice(chunk.column(0));
            blstats.extend(
                chunk
                    .column(1)
                    .chunks_exact(4)
                    .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
            );
        }

        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(actions, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(&blstats[..4], &[0, 1, 10, 11]);
        assert_eq!(blstats[13], 61);
    }

    #[test]
    fn test_trim_trailing_rows() {
        let dir = TempDir::new().unwrap();
        let path = write_part(&dir, 5, 3);

        let mut source = ParquetSource::open(&path, &fields(), 1).unwrap();
        assert_eq!(source.num_rows(), 4);

        let mut total = 0;
        while let Some(chunk) = source.next_chunk().unwrap() {
            total += chunk.rows();
        }
        assert_eq!(total, 4);
    }

    #[test]
    fn test_missing_column() {
        let dir = TempDir::new().unwrap();
        let path = write_part(&dir, 2, 2);

        let err = ParquetSource::open(&path, &[FieldSpec::new("glyphs", DType::I16, &[4])], 0)
            .unwrap_err();
        assert!(err.is_schema_mismatch());
    }

    #[test]
    fn test_wrong_width_is_malformed() {
        let dir = TempDir::new().unwrap();
        let path = write_part(&dir, 2, 2);

        let mut source =
            ParquetSource::open(&path, &[FieldSpec::new("blstats", DType::I32, &[3])], 0).unwrap();
        let err = source.next_chunk().unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn test_not_parquet() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.parquet");
        std::fs::write(&path, b"definitely not a parquet file").unwrap();

        let err = ParquetSource::open(&path, &fields(), 0).unwrap_err();
        assert!(matches!(err, DecodeError::Parquet { .. }));

        let err = ParquetSource::open(&dir.path().join("absent.parquet"), &fields(), 0).unwrap_err();
        assert!(matches!(err, DecodeError::Io { .. }));
    }

    #[test]
    fn test_decoder_trait() {
        let dir = TempDir::new().unwrap();
        let path = write_part(&dir, 4, 4);
        let decoder = ParquetDecoder::new(1);

        let source = decoder.open(&path, &fields()).unwrap();
        assert_eq!(source.num_rows(), 3);
        assert_eq!(decoder.name(), "parquet");
    }

    #[test]
    fn test_scalar_cast() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scores.parquet");
        let scores = Int64Array::from(vec![5, -2, 9]);
        let schema = Arc::new(Schema::new(vec![Field::new("score", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(scores)]).unwrap();
        let mut writer = ArrowWriter::try_new(File::create(&path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let mut source =
            ParquetSource::open(&path, &[FieldSpec::new("score", DType::I16, &[])], 0).unwrap();
        let chunk = source.next_chunk().unwrap().unwrap();
        let values: Vec<i16> = chunk
            .column(0)
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(values, vec![5, -2, 9]);
        assert!(source.next_chunk().unwrap().is_none());
    }
}

// rust/replay-core/src/dataset/test_support.rs

//! In-memory sources and catalogs shared by the dataset tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{DecodeError, ReplayError, Result};
use crate::field::{DType, FieldSpec, SessionId};
use crate::source::{ColumnChunk, RowSource, SourceDecoder};

use super::traits::SessionCatalog;

pub fn obs_field() -> FieldSpec {
    FieldSpec::new("obs", DType::U8, &[])
}

/// One part: row values split into chunks, every byte of a row set to the
/// row's value.
#[derive(Debug, Clone, Default)]
pub struct MemoryPart {
    pub chunks: Vec<Vec<u8>>,
    /// Chunk index whose decode fails.
    pub fail_at: Option<usize>,
    /// Report more rows than the chunks hold.
    pub claimed_rows: Option<usize>,
    pub broken: bool,
    pub missing_field: bool,
}

impl MemoryPart {
    pub fn rows(values: &[u8]) -> Self {
        Self {
            chunks: vec![values.to_vec()],
            ..Default::default()
        }
    }

    pub fn chunked(chunks: &[&[u8]]) -> Self {
        Self {
            chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            ..Default::default()
        }
    }

    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct MemoryDecoder {
    parts: Mutex<HashMap<PathBuf, MemoryPart>>,
    opened: AtomicUsize,
}

impl MemoryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, path: impl Into<PathBuf>, part: MemoryPart) {
        self.parts.lock().unwrap().insert(path.into(), part);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl SourceDecoder for MemoryDecoder {
    fn open(
        &self,
        path: &Path,
        fields: &[FieldSpec],
    ) -> std::result::Result<Box<dyn RowSource>, DecodeError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let part = self.parts.lock().unwrap().get(path).cloned().ok_or_else(|| {
            DecodeError::io(path, std::io::Error::from(std::io::ErrorKind::NotFound))
        })?;
        if part.broken {
            return Err(DecodeError::malformed(path, "bad magic"));
        }
        if part.missing_field {
            return Err(DecodeError::missing_field(path, fields[0].column_name()));
        }

        let held: usize = part.chunks.iter().map(Vec::len).sum();
        Ok(Box::new(MemorySource {
            path: path.to_path_buf(),
            fields: fields.to_vec(),
            num_rows: part.claimed_rows.unwrap_or(held),
            chunks: part.chunks.into_iter().collect(),
            fail_at: part.fail_at,
            index: 0,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySource {
    path: PathBuf,
    fields: Vec<FieldSpec>,
    num_rows: usize,
    chunks: VecDeque<Vec<u8>>,
    fail_at: Option<usize>,
    index: usize,
}

impl RowSource for MemorySource {
    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn next_chunk(&mut self) -> std::result::Result<Option<ColumnChunk>, DecodeError> {
        if self.fail_at == Some(self.index) {
            return Err(DecodeError::malformed(&self.path, "corrupt row-group"));
        }
        self.index += 1;
        let Some(values) = self.chunks.pop_front() else {
            return Ok(None);
        };
        let columns = self
            .fields
            .iter()
            .map(|field| {
                values
                    .iter()
                    .flat_map(|v| std::iter::repeat(*v).take(field.row_bytes()))
                    .collect()
            })
            .collect();
        Ok(Some(ColumnChunk::new(values.len(), columns)))
    }
}

/// Sessions with fixed part lists. Unknown ids fail to list.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    sessions: Vec<(SessionId, Vec<PathBuf>)>,
    delays: HashMap<SessionId, Duration>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(mut self, id: SessionId, parts: &[&str]) -> Self {
        self.sessions
            .push((id, parts.iter().map(PathBuf::from).collect()));
        self
    }

    /// Like [`MemoryCatalog::session`], but listing the parts takes `delay`.
    pub fn slow_session(mut self, id: SessionId, parts: &[&str], delay: Duration) -> Self {
        self.delays.insert(id, delay);
        self.session(id, parts)
    }
}

impl SessionCatalog for MemoryCatalog {
    fn list_session_ids(&self) -> Result<Vec<SessionId>> {
        Ok(self.sessions.iter().map(|(id, _)| *id).collect())
    }

    fn list_part_files(&self, session: SessionId) -> Result<Vec<PathBuf>> {
        if let Some(delay) = self.delays.get(&session) {
            std::thread::sleep(*delay);
        }
        self.sessions
            .iter()
            .find(|(id, _)| *id == session)
            .map(|(_, parts)| parts.clone())
            .ok_or_else(|| ReplayError::dataset("memory", format!("unknown session {session}")))
    }
}

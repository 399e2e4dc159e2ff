// rust/replay-core/src/dataset/catalog.rs

//! Directory layout of a replay dataset.
//!
//! Sessions live in one sub-directory per id under the dataset root. Parts
//! are the files in that directory whose name starts with the part prefix,
//! played back in lexicographic order. Source files for a part are found by
//! a [`PathDerivation`], by default a sibling file whose name encodes the
//! process id and episode id split out of the part's own name.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ReplayError, Result};
use crate::field::SessionId;

use super::traits::{PathDerivation, SessionCatalog};

/// Sessions stored as `<root>/<session id>/<prefix>*`.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
    part_prefix: String,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>, part_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            part_prefix: part_prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_names(&self, dir: &Path) -> Result<Vec<(String, bool)>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(dir).map_err(|e| {
            ReplayError::storage_with_source(dir, "failed to read directory", e)
        })? {
            let entry = entry.map_err(|e| {
                ReplayError::storage_with_source(dir, "failed to read directory entry", e)
            })?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

            if let Some(name) = entry.file_name().to_str() {
                entries.push((name.to_string(), is_dir));
            }
        }

        Ok(entries)
    }
}

impl SessionCatalog for DirectoryCatalog {
    fn list_session_ids(&self) -> Result<Vec<SessionId>> {
        if !self.root.is_dir() {
            return Err(ReplayError::storage(&self.root, "dataset root is not a directory"));
        }

        let mut ids: Vec<SessionId> = self
            .read_names(&self.root)?
            .into_iter()
            .filter(|(_, is_dir)| *is_dir)
            .filter_map(|(name, _)| name.parse().ok())
            .filter(|id| *id != 0)
            .collect();

        ids.sort_unstable();
        Ok(ids)
    }

    fn list_part_files(&self, session: SessionId) -> Result<Vec<PathBuf>> {
        if session == 0 {
            return Ok(Vec::new());
        }

        let dir = self.root.join(session.to_string());
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = self
            .read_names(&dir)?
            .into_iter()
            .filter(|(name, is_dir)| !is_dir && name.starts_with(&self.part_prefix))
            .map(|(name, _)| name)
            .collect();

        names.sort();
        Ok(names.into_iter().map(|name| dir.join(name)).collect())
    }
}

/// Reads the listed part itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamePath;

impl PathDerivation for SamePath {
    fn derive(&self, part: &Path) -> Option<PathBuf> {
        Some(part.to_path_buf())
    }
}

/// Replaces the part's file name with a rendered template.
///
/// `{name}` is the part's file name. `{pid}` and `{epi}` are the second and
/// third `.`-separated components of it, so `rollout.4711.3.ttyrec` gives
/// pid `4711` and episode `3`.
#[derive(Debug, Clone)]
pub struct SiblingTemplate {
    template: String,
}

impl SiblingTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl PathDerivation for SiblingTemplate {
    fn derive(&self, part: &Path) -> Option<PathBuf> {
        let name = part.file_name()?.to_str()?;
        let pieces: Vec<&str> = name.split('.').collect();

        let mut rendered = self.template.replace("{name}", name);
        if rendered.contains("{pid}") {
            rendered = rendered.replace("{pid}", pieces.get(1)?);
        }
        if rendered.contains("{epi}") {
            rendered = rendered.replace("{epi}", pieces.get(2)?);
        }

        Some(part.with_file_name(rendered))
    }
}

/// Derivation for an optional file name template.
pub fn derivation_for(file_name: Option<&str>) -> Arc<dyn PathDerivation> {
    match file_name {
        Some(template) => Arc::new(SiblingTemplate::new(template)),
        None => Arc::new(SamePath),
    }
}

// rust/replay-core/src/runtime.rs

//! Dataset orchestration.
//!
//! [`ReplayDataset`] ties configuration, the session catalog, source decoders
//! and the lane worker pool together. Each call to
//! [`ReplayDataset::multiplexer`] starts a new pass: the session order is
//! resolved (and shuffled if configured), fresh lanes are built and every
//! lane draws its first session.
//!
//! # Example
//!
//! ```no_run
//! use replay_core::ReplayDataset;
//!
//! let dataset = ReplayDataset::from_config_file("replay.toml").unwrap();
//!
//! let mut stream = dataset.stream().unwrap();
//! while let Some(batch) = stream.next_batch().unwrap() {
//!     let chars = batch.field("tty_chars").unwrap();
//!     let _ = (chars.as_bytes(), batch.reset(), batch.game_id());
//! }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::config::{ReplayConfig, SourceKind};
use crate::dataset::{
    derivation_for, BatchMultiplexer, BatchStream, BoundReader, ChunkedCursorReader,
    CursorReader, DirectoryCatalog, Lane, PathDerivation, Prefetcher, RowWindowReader,
    SessionAllocator, SessionCatalog,
};
use crate::error::{ReplayError, Result};
use crate::field::{BatchBuffers, FieldSpec, SessionId};
use crate::source::{NpyDecoder, ParquetDecoder, SourceDecoder};

/// One configured source with its decoder and file rule.
struct SourceBinding {
    fields: Vec<FieldSpec>,
    decoder: Arc<dyn SourceDecoder>,
    derivation: Arc<dyn PathDerivation>,
    materialize: bool,
}

/// A replay dataset ready to start passes.
pub struct ReplayDataset {
    config: ReplayConfig,
    catalog: Arc<dyn SessionCatalog>,
    sources: Vec<SourceBinding>,
    fields: Vec<FieldSpec>,
    session_ids: Vec<SessionId>,
    pool: Option<Arc<ThreadPool>>,
    passes: AtomicU64,
}

impl ReplayDataset {
    /// Opens the dataset described by a configuration file.
    ///
    /// Environment variable overrides are applied after loading the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid, or
    /// if the dataset root cannot be listed.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = ReplayConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config)
    }

    /// Opens the dataset described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the dataset root
    /// cannot be listed.
    pub fn from_config(config: ReplayConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Starts a builder for datasets with custom collaborators.
    pub fn builder(config: ReplayConfig) -> ReplayDatasetBuilder {
        ReplayDatasetBuilder::new(config)
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Field specs in batch order.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Sessions taking part in every pass, before shuffling.
    pub fn session_ids(&self) -> &[SessionId] {
        &self.session_ids
    }

    pub fn num_sessions(&self) -> usize {
        self.session_ids.len()
    }

    /// Number of passes started so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Allocates one set of buffers shaped for this dataset.
    pub fn allocate_buffers(&self) -> BatchBuffers {
        BatchBuffers::new(
            self.config.batch.batch_size,
            self.config.batch.seq_length,
            &self.fields,
        )
    }

    /// Session order for pass number `pass`.
    ///
    /// With a seed, every pass gets its own reproducible order.
    fn pass_order(&self, pass: u64) -> Vec<SessionId> {
        let mut ids = self.session_ids.clone();
        if self.config.dataset.shuffle {
            match self.config.dataset.seed {
                Some(seed) => ids.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(pass))),
                None => ids.shuffle(&mut rand::thread_rng()),
            }
        }
        ids
    }

    fn lane_readers(&self) -> Vec<BoundReader> {
        let fallback_rows = self.config.performance.fallback_rows;

        self.sources
            .iter()
            .map(|source| {
                let reader: Box<dyn RowWindowReader> = if source.materialize {
                    Box::new(
                        CursorReader::new(source.decoder.clone(), source.fields.clone())
                            .with_fallback_rows(fallback_rows),
                    )
                } else {
                    Box::new(
                        ChunkedCursorReader::new(source.decoder.clone(), source.fields.clone())
                            .with_fallback_rows(fallback_rows),
                    )
                };
                BoundReader::new(reader, source.derivation.clone())
            })
            .collect()
    }

    /// Starts a new pass and returns its primed multiplexer.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Config`] if a source lacks a configured field.
    pub fn multiplexer(&self) -> Result<BatchMultiplexer> {
        let pass = self.passes.fetch_add(1, Ordering::Relaxed);
        let order = self.pass_order(pass);
        let allocator = Arc::new(SessionAllocator::new(order, self.config.dataset.loop_forever));

        let lanes = (0..self.config.batch.batch_size)
            .map(|index| Lane::new(index, self.lane_readers()))
            .collect::<Result<Vec<_>>>()?;

        let mut mux = BatchMultiplexer::new(
            lanes,
            allocator,
            self.catalog.clone(),
            self.fields.clone(),
            self.config.batch.seq_length,
        )?;
        if let Some(pool) = &self.pool {
            mux = mux.with_pool(pool.clone());
        }

        mux.prime()?;
        tracing::debug!(
            "Started pass {} over {} sessions",
            pass,
            mux.allocator().len()
        );
        Ok(mux)
    }

    /// Starts a new pass filled on the caller's thread.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Config`] if a source lacks a configured field.
    pub fn stream(&self) -> Result<BatchStream> {
        let mux = self.multiplexer()?;
        let buffers = mux.allocate_buffers();
        BatchStream::new(mux, buffers)
    }

    /// Starts a new pass filled on a background thread, with a ring of
    /// `batch.prefetch` buffers.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError::Config`] if a source lacks a configured field.
    pub fn prefetch(&self) -> Result<Prefetcher> {
        let mux = self.multiplexer()?;
        let ring = (0..self.config.batch.prefetch)
            .map(|_| mux.allocate_buffers())
            .collect();
        Prefetcher::spawn(mux, ring)
    }
}

impl std::fmt::Debug for ReplayDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayDataset")
            .field("root", &self.config.dataset.root)
            .field("num_sessions", &self.session_ids.len())
            .field("batch_size", &self.config.batch.batch_size)
            .field("seq_length", &self.config.batch.seq_length)
            .field("sources", &self.sources.len())
            .finish()
    }
}

/// Builder for datasets whose catalog, decoders or file rules differ from
/// what the configuration describes.
pub struct ReplayDatasetBuilder {
    config: ReplayConfig,
    catalog: Option<Arc<dyn SessionCatalog>>,
    decoders: Vec<Option<Arc<dyn SourceDecoder>>>,
    derivations: Vec<Option<Arc<dyn PathDerivation>>>,
    pool: Option<Arc<ThreadPool>>,
}

impl ReplayDatasetBuilder {
    pub fn new(config: ReplayConfig) -> Self {
        let sources = config.sources.len();
        Self {
            config,
            catalog: None,
            decoders: vec![None; sources],
            derivations: vec![None; sources],
            pool: None,
        }
    }

    /// Sets the session catalog. Defaults to a [`DirectoryCatalog`] over
    /// `dataset.root`.
    pub fn catalog(mut self, catalog: Arc<dyn SessionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replaces the decoder of source `index`.
    pub fn decoder(mut self, index: usize, decoder: Arc<dyn SourceDecoder>) -> Self {
        if let Some(slot) = self.decoders.get_mut(index) {
            *slot = Some(decoder);
        }
        self
    }

    /// Replaces the file rule of source `index`.
    pub fn derivation(mut self, index: usize, derivation: Arc<dyn PathDerivation>) -> Self {
        if let Some(slot) = self.derivations.get_mut(index) {
            *slot = Some(derivation);
        }
        self
    }

    /// Shares an existing worker pool instead of building one from
    /// `performance.worker_threads`.
    pub fn pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Validates the configuration and resolves the session list.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the worker pool
    /// cannot be built, or sessions cannot be listed.
    pub fn build(self) -> Result<ReplayDataset> {
        let config = self.config;
        config.validate()?;

        let catalog: Arc<dyn SessionCatalog> = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(DirectoryCatalog::new(
                config.dataset.root.clone(),
                config.dataset.part_prefix.clone(),
            )),
        };

        let session_ids = match &config.dataset.session_ids {
            Some(selected) => {
                let mut ids = Vec::with_capacity(selected.len());
                for id in selected {
                    if !ids.contains(id) {
                        ids.push(*id);
                    }
                }
                ids
            }
            None => catalog.list_session_ids()?,
        };

        let sources = config
            .sources
            .iter()
            .zip(self.decoders)
            .zip(self.derivations)
            .map(|((source, decoder), derivation)| {
                let decoder: Arc<dyn SourceDecoder> = match (decoder, source.kind) {
                    (Some(decoder), _) => decoder,
                    (None, SourceKind::Parquet) => {
                        Arc::new(ParquetDecoder::new(source.trim_trailing_rows))
                    }
                    (None, SourceKind::Npy) => Arc::new(NpyDecoder),
                };
                SourceBinding {
                    fields: config.source_fields(source),
                    decoder,
                    derivation: derivation
                        .unwrap_or_else(|| derivation_for(source.file_name.as_deref())),
                    materialize: source.materialize,
                }
            })
            .collect();

        let pool = match self.pool {
            Some(pool) => Some(pool),
            None if config.performance.worker_threads > 0 => Some(Arc::new(
                ThreadPoolBuilder::new()
                    .num_threads(config.performance.worker_threads)
                    .thread_name(|i| format!("replay-lane-{i}"))
                    .build()
                    .map_err(|e| ReplayError::config_with_source("failed to build worker pool", e))?,
            )),
            None => None,
        };

        tracing::info!(
            "Opened replay dataset at {:?}: {} sessions, batch {}x{}, {} worker threads",
            config.dataset.root,
            session_ids.len(),
            config.batch.batch_size,
            config.batch.seq_length,
            pool.as_ref().map_or(0, |p| p.current_num_threads())
        );

        Ok(ReplayDataset {
            fields: config.batch_fields(),
            config,
            catalog,
            sources,
            session_ids,
            pool,
            passes: AtomicU64::new(0),
        })
    }
}

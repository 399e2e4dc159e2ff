// rust/replay-core/src/dataset/prefetch.rs

//! Background batch filling.
//!
//! The prefetcher moves a multiplexer onto its own thread together with a
//! ring of caller-allocated buffers. Filled buffers arrive over a bounded
//! channel; the consumer hands each one back with [`Prefetcher::recycle`]
//! once it is done with it. The thread waits for a free buffer before
//! filling the next batch, so at most `buffers.len()` batches are in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use super::iterator::Batch;
use super::multiplexer::BatchMultiplexer;
use crate::error::{ReplayError, Result};
use crate::field::BatchBuffers;

/// Result type for prefetched items.
type PrefetchItem = Result<Batch>;

/// Batches filled on a background thread.
///
/// Every batch taken out with [`Prefetcher::next_batch`] holds one buffer of
/// the ring until it is passed to [`Prefetcher::recycle`]. Once the consumer
/// holds all of them, the next call blocks. The [`Iterator`] impl copies each
/// batch out and recycles its buffer right away, so it never holds ring slots.
pub struct Prefetcher {
    /// Filled batches.
    ready: Option<Receiver<PrefetchItem>>,
    /// Buffers handed back by the consumer.
    free: Option<Sender<BatchBuffers>>,
    /// Flag to signal the prefetch thread to stop.
    stop_flag: Arc<AtomicBool>,
    /// Handle to the prefetch thread.
    prefetch_thread: Option<JoinHandle<()>>,
    exhausted: bool,
}

impl Prefetcher {
    /// Starts filling `buffers` from `mux` on a new thread.
    ///
    /// # Errors
    ///
    /// Returns an error if no buffers are given, a buffer does not match the
    /// multiplexer, or the thread cannot be spawned.
    pub fn spawn(mut mux: BatchMultiplexer, buffers: Vec<BatchBuffers>) -> Result<Self> {
        if buffers.is_empty() {
            return Err(ReplayError::config("prefetch needs at least one buffer"));
        }
        for buffer in &buffers {
            buffer.check_layout(mux.batch_size(), mux.seq_length(), mux.fields())?;
        }

        let (ready_tx, ready_rx) = channel::bounded(buffers.len());
        let (free_tx, free_rx) = channel::unbounded();
        for buffer in buffers {
            // The receiver is alive, so this cannot fail
            let _ = free_tx.send(buffer);
        }

        let stop_flag = Arc::new(AtomicBool::new(false));
        let stop_flag_clone = stop_flag.clone();

        let prefetch_thread = thread::Builder::new()
            .name("replay-prefetch".to_string())
            .spawn(move || {
                prefetch_loop(&mut mux, &free_rx, &ready_tx, &stop_flag_clone);
            })
            .map_err(|e| {
                ReplayError::dataset("prefetch", format!("failed to spawn thread: {e}"))
            })?;

        Ok(Self {
            ready: Some(ready_rx),
            free: Some(free_tx),
            stop_flag,
            prefetch_thread: Some(prefetch_thread),
            exhausted: false,
        })
    }

    /// Gets the next filled batch, blocking until one is ready.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.exhausted {
            return Ok(None);
        }
        let Some(ready) = self.ready.as_ref() else {
            return Ok(None);
        };

        match ready.recv() {
            Ok(Ok(batch)) => Ok(Some(batch)),
            Ok(Err(e)) => {
                self.exhausted = true;
                Err(e)
            }
            // Thread finished and the queue is drained
            Err(_) => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    /// Returns a consumed batch's buffers to the ring.
    pub fn recycle(&self, buffers: BatchBuffers) {
        if let Some(free) = self.free.as_ref() {
            let _ = free.send(buffers);
        }
    }

    /// Number of filled batches waiting to be consumed.
    pub fn queue_len(&self) -> usize {
        self.ready.as_ref().map_or(0, Receiver::len)
    }

    /// Stops the prefetch thread and cleans up resources.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);

        // Closing both channels wakes the thread wherever it is blocked
        self.free.take();
        self.ready.take();

        if let Some(thread) = self.prefetch_thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Prefetch thread panicked");
            }
        }
        self.exhausted = true;
    }
}

fn prefetch_loop(
    mux: &mut BatchMultiplexer,
    free: &Receiver<BatchBuffers>,
    ready: &Sender<PrefetchItem>,
    stop_flag: &AtomicBool,
) {
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        let Ok(mut buffers) = free.recv() else {
            break;
        };
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }

        match mux.fill(&mut buffers) {
            Ok(summary) => {
                let finished = summary.active_lanes == 0;
                if ready.send(Ok(Batch { buffers, summary })).is_err() {
                    break;
                }
                if finished {
                    break;
                }
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                break;
            }
        }
    }
}

impl Iterator for Prefetcher {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) => {
                let owned = batch.clone();
                self.recycle(batch.buffers);
                Some(Ok(owned))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

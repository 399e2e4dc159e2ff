// rust/replay-core/src/dataset/allocator.rs

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::field::SessionId;

/// Hands out session ids from one pass's ordering.
///
/// Shared by every lane of a pass. Each call claims a distinct index, so two
/// lanes never receive the same id unless the ordering wraps.
///
/// Lanes also report sessions that turned out to yield no rows. Once every
/// id of the ordering has been reported, no lane can make progress anymore.
#[derive(Debug)]
pub struct SessionAllocator {
    ids: Vec<SessionId>,
    cursor: AtomicUsize,
    loop_forever: bool,
    barren: Mutex<HashSet<SessionId>>,
}

impl SessionAllocator {
    pub fn new(ids: Vec<SessionId>, loop_forever: bool) -> Self {
        Self {
            ids,
            cursor: AtomicUsize::new(0),
            loop_forever,
            barren: Mutex::new(HashSet::new()),
        }
    }

    /// Claims the next id, or `None` once the ordering is used up and looping
    /// is disabled.
    pub fn allocate_next(&self) -> Option<SessionId> {
        if self.ids.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        if self.loop_forever {
            Some(self.ids[index % self.ids.len()])
        } else {
            self.ids.get(index).copied()
        }
    }

    /// Records that `id` produced no rows: it has no parts, or every part
    /// is empty.
    pub fn mark_barren(&self, id: SessionId) {
        let mut barren = self.barren.lock().unwrap_or_else(|e| e.into_inner());
        barren.insert(id);
    }

    /// True once every id of the ordering is known to produce no rows.
    pub fn all_barren(&self) -> bool {
        let barren = self.barren.lock().unwrap_or_else(|e| e.into_inner());
        !self.ids.is_empty() && self.ids.iter().all(|id| barren.contains(id))
    }

    /// Number of ids claimed so far.
    pub fn allocated(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn loops(&self) -> bool {
        self.loop_forever
    }

    pub fn ids(&self) -> &[SessionId] {
        &self.ids
    }
}

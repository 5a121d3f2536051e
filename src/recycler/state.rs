//! In-memory priority structure of pending recycle work.
//!
//! Entries are ordered by depth ascending, then by enqueue slot ascending.
//! Inserts at a given depth always carry increasing slot offsets, so one
//! FIFO per depth preserves the order.

use std::collections::{HashMap, VecDeque};

use smallvec::{smallvec, SmallVec};

use crate::metrics::RecyclerMetrics;
use crate::recycler::event::PageToRecycle;
use crate::slot::slot_min;
use crate::types::{MareaError, PageId, Result, SlotOffset, MAX_PAGE_REF_DEPTH};

#[derive(Default)]
pub struct RecyclerState {
    depths: Vec<VecDeque<PageToRecycle>>,
    pending: HashMap<PageId, u32>,
}

impl RecyclerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a new pending entry, returning the entries the caller must
    /// append to the WAL. Empty when the page is already pending.
    pub fn insert(&mut self, item: PageToRecycle) -> Result<SmallVec<[PageToRecycle; 2]>> {
        if item.depth >= MAX_PAGE_REF_DEPTH {
            return Err(MareaError::RecursionDepthExceeded(item.depth));
        }
        if self.pending.contains_key(&item.page_id) {
            return Ok(SmallVec::new());
        }
        let depth = item.depth as usize;
        if self.depths.len() <= depth {
            self.depths.resize_with(depth + 1, VecDeque::new);
        }
        self.depths[depth].push_back(item);
        self.pending.insert(item.page_id, item.depth);
        Ok(smallvec![item])
    }

    /// Drains up to `batch_size` entries from the smallest non-empty depth,
    /// oldest enqueue first.
    pub fn collect_batch(
        &mut self,
        batch_size: usize,
        metrics: &RecyclerMetrics,
    ) -> Vec<PageToRecycle> {
        let Some(queue) = self.depths.iter_mut().find(|queue| !queue.is_empty()) else {
            return Vec::new();
        };
        let take = batch_size.min(queue.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            let item = queue.pop_front().expect("queue length checked");
            self.pending.remove(&item.page_id);
            batch.push(item);
        }
        metrics.remove_count.add(batch.len() as u64);
        batch
    }

    /// Smallest slot offset of any still-pending entry; bounds log trimming.
    pub fn get_lru_slot(&self) -> Option<SlotOffset> {
        self.depths
            .iter()
            .filter_map(|queue| queue.front())
            .map(|item| item.slot_offset)
            .reduce(slot_min)
    }

    /// Recovery path: replays entries in log order.
    pub fn bulk_load(&mut self, items: &[PageToRecycle]) {
        for item in items {
            // Depth-capped and duplicate entries were rejected before they
            // ever reached the log.
            let _ = self.insert(*item);
        }
    }

    pub fn pending_count(&self) -> u64 {
        self.pending.len() as u64
    }
}

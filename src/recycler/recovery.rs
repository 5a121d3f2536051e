//! Fold over a recycler WAL scan.

use std::collections::HashMap;

use uuid::Uuid;

use crate::recycler::event::{PageToRecycle, RecycleEvent};
use crate::recycler::options::PageRecyclerOptions;
use crate::recycler::Batch;
use crate::slot::SlotRange;
use crate::types::{MareaError, PageId, Result, SlotOffset};

/// Accumulates options, identity, the latest info slot, pending pages, and
/// the latest in-flight batch (if any) from a log scan.
pub struct RecyclerRecoveryVisitor {
    options: PageRecyclerOptions,
    uuid: Option<Uuid>,
    latest_info: Option<SlotRange>,
    pending: Vec<Option<PageToRecycle>>,
    pending_index: HashMap<PageId, usize>,
    open_batches: Vec<(SlotOffset, Vec<PageId>)>,
}

impl RecyclerRecoveryVisitor {
    pub fn new(default_options: PageRecyclerOptions) -> Self {
        Self {
            options: default_options,
            uuid: None,
            latest_info: None,
            pending: Vec::new(),
            pending_index: HashMap::new(),
            open_batches: Vec::new(),
        }
    }

    pub fn visit(&mut self, range: SlotRange, event: RecycleEvent) -> Result<()> {
        match event {
            RecycleEvent::Info(info) => {
                self.uuid = Some(info.uuid);
                self.options = info.to_options();
                self.latest_info = Some(range);
            }
            RecycleEvent::PageToRecycle(item) => {
                if !self.pending_index.contains_key(&item.page_id) {
                    self.pending_index.insert(item.page_id, self.pending.len());
                    self.pending.push(Some(item));
                }
            }
            RecycleEvent::BatchPrepare {
                page_id,
                batch_slot,
            } => {
                match self
                    .open_batches
                    .iter_mut()
                    .find(|(slot, _)| *slot == batch_slot)
                {
                    Some((_, pages)) => pages.push(page_id),
                    None => self.open_batches.push((batch_slot, vec![page_id])),
                }
            }
            RecycleEvent::BatchCommit { batch_slot } => {
                let index = self
                    .open_batches
                    .iter()
                    .position(|(slot, _)| *slot == batch_slot)
                    .ok_or(MareaError::Corruption(
                        "recycler batch commit without prepares",
                    ))?;
                let (_, pages) = self.open_batches.remove(index);
                for page_id in pages {
                    if let Some(slot) = self.pending_index.remove(&page_id) {
                        self.pending[slot] = None;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn options(&self) -> &PageRecyclerOptions {
        &self.options
    }

    pub fn recycler_uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    pub fn latest_info_refresh_slot(&self) -> Option<SlotRange> {
        self.latest_info
    }

    /// Removes and returns the single prepared-but-uncommitted batch; its
    /// members are taken out of the pending set. More than one open batch is
    /// a broken log.
    pub fn consume_latest_batch(&mut self) -> Result<Option<Batch>> {
        if self.open_batches.len() > 1 {
            return Err(MareaError::Corruption(
                "multiple uncommitted recycle batches in log",
            ));
        }
        let Some((batch_slot, pages)) = self.open_batches.pop() else {
            return Ok(None);
        };
        let mut to_recycle = Vec::with_capacity(pages.len());
        for page_id in pages {
            let index = self
                .pending_index
                .remove(&page_id)
                .ok_or(MareaError::Corruption("prepared page missing from log"))?;
            let item = self.pending[index]
                .take()
                .ok_or(MareaError::Corruption("prepared page missing from log"))?;
            to_recycle.push(item);
        }
        Ok(Some(Batch {
            to_recycle,
            slot_offset: batch_slot,
        }))
    }

    /// Remaining pending entries in log order; call after
    /// [`Self::consume_latest_batch`].
    pub fn take_recovered_pages(&mut self) -> Vec<PageToRecycle> {
        self.pending_index.clear();
        self.pending.drain(..).flatten().collect()
    }
}

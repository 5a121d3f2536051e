//! Sizing and policy knobs for a page recycler.

use crate::recycler::event::{
    batch_commit_slot_size, batch_prepare_slot_size, info_slot_size, page_to_recycle_slot_size,
};
use crate::types::SlotOffset;

#[derive(Clone, Debug)]
pub struct PageRecyclerOptions {
    /// Maximum pages dropped per batch; each batch drains a single depth.
    pub batch_size: usize,
    /// Slot-axis distance after which the info slot is rewritten.
    pub info_refresh_interval: u64,
    /// Upper bound on a page's outgoing reference fan-out; sizes the WAL
    /// grant needed to absorb the drops cascading from one deleted page.
    pub max_refs_per_page: u32,
}

impl Default for PageRecyclerOptions {
    fn default() -> Self {
        Self {
            batch_size: 16,
            info_refresh_interval: 8192,
            max_refs_per_page: 32,
        }
    }
}

impl PageRecyclerOptions {
    /// WAL bytes one external insert may consume.
    pub fn insert_grant_size(&self) -> u64 {
        page_to_recycle_slot_size()
    }

    pub fn info_slot_size(&self) -> u64 {
        info_slot_size()
    }

    /// Reserved WAL bytes the recycle task needs to always make progress:
    /// a full batch of prepares with their cascaded re-inserts, the commit
    /// slot, and headroom for info refreshes.
    pub fn recycle_task_target(&self) -> u64 {
        let per_page =
            batch_prepare_slot_size() + self.max_refs_per_page as u64 * page_to_recycle_slot_size();
        self.batch_size as u64 * per_page + batch_commit_slot_size() + 2 * self.info_slot_size()
    }

    /// Minimum log capacity for this configuration.
    pub fn calculate_log_size(&self, max_buffered_page_count: Option<u64>) -> u64 {
        let buffered = max_buffered_page_count.unwrap_or(self.max_refs_per_page as u64);
        page_to_recycle_slot_size() * (1 + buffered)
            + self.recycle_task_target()
            + 2 * self.info_slot_size()
            + 1024
    }

    /// True when the info slot at `info_lower` is old enough (or far enough
    /// behind `current_upper`) that a fresh copy must be appended.
    pub fn info_needs_refresh(&self, info_lower: SlotOffset, current_upper: SlotOffset) -> bool {
        current_upper.wrapping_sub(info_lower) >= self.info_refresh_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_target_fits_in_calculated_log_size() {
        let options = PageRecyclerOptions::default();
        assert!(
            options.calculate_log_size(None)
                >= options.recycle_task_target() + options.insert_grant_size()
        );
    }

    #[test]
    fn info_refresh_uses_slot_distance() {
        let options = PageRecyclerOptions {
            info_refresh_interval: 100,
            ..PageRecyclerOptions::default()
        };
        assert!(!options.info_needs_refresh(50, 149));
        assert!(options.info_needs_refresh(50, 150));
    }
}

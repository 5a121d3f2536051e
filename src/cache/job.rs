//! Page-cache jobs: the unit of work committed by a volume append.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::cache::PageCache;
use crate::recycler::RecyclerCore;
use crate::slot::writer::Grant;
use crate::types::{MareaError, PageId, Result, SlotOffset};

/// A page written by a job, with its outgoing references.
#[derive(Clone, Debug)]
pub struct NewPage {
    pub id: PageId,
    pub refs: Vec<PageId>,
}

/// A batch of new pages plus reference-count changes, applied atomically
/// with respect to crash recovery.
#[derive(Clone, Debug, Default)]
pub struct PageCacheJob {
    pub new_pages: Vec<NewPage>,
    /// Pages anchored by the log itself; released when the job's slots are
    /// trimmed.
    pub root_refs: Vec<PageId>,
    pub refcount_deltas: Vec<(PageId, i64)>,
}

impl PageCacheJob {
    pub fn new_page_ids(&self) -> Vec<PageId> {
        self.new_pages.iter().map(|page| page.id).collect()
    }
}

/// Exactly-once keying and recycle routing for a job commit.
pub struct JobCommitParams<'a> {
    pub caller_uuid: Uuid,
    pub caller_slot: SlotOffset,
    pub recycler: &'a RecyclerCore,
    pub recycle_grant: Option<&'a Grant>,
    pub recycle_depth: u32,
}

/// Sums duplicate page entries into a single delta list.
pub(crate) fn merge_deltas(deltas: impl IntoIterator<Item = (PageId, i64)>) -> Vec<(PageId, i64)> {
    let mut merged: BTreeMap<PageId, i64> = BTreeMap::new();
    for (page_id, delta) in deltas {
        *merged.entry(page_id).or_insert(0) += delta;
    }
    merged
        .into_iter()
        .filter(|(_, delta)| *delta != 0)
        .collect()
}

/// Applies a job's refcount effects (explicit deltas plus root anchors) and
/// routes newly dead pages into the recycler. Idempotent under the caller's
/// `(uuid, slot)` key; shared by live appends and crash recovery.
pub(crate) fn apply_job_effects(
    cache: &PageCache,
    root_refs: &[PageId],
    refcount_deltas: &[(PageId, i64)],
    params: &JobCommitParams<'_>,
) -> Result<()> {
    let deltas = merge_deltas(
        refcount_deltas
            .iter()
            .copied()
            .chain(root_refs.iter().map(|&page| (page, 1i64))),
    );
    let dead = cache.apply_refcount_deltas(params.caller_uuid, params.caller_slot, &deltas)?;
    if !dead.is_empty() {
        let upper =
            params
                .recycler
                .recycle_pages(&dead, params.recycle_grant, params.recycle_depth)?;
        params.recycler.await_flush(Some(upper))?;
    }
    Ok(())
}

/// Commits `job`: persists its new pages, applies refcount deltas exactly
/// once, and hands dropped pages to the recycler.
///
/// A job that names a page neither present in the cache nor written by the
/// job itself is rejected as not committable; the caller rolls back.
pub fn commit(cache: &PageCache, job: &PageCacheJob, params: &JobCommitParams<'_>) -> Result<()> {
    for &(page_id, _) in &job.refcount_deltas {
        if !cache.page_is_valid(page_id) && !job.new_pages.iter().any(|page| page.id == page_id) {
            return Err(MareaError::JobNotCommittable(
                "refcount delta targets an unknown page",
            ));
        }
    }
    for &page_id in &job.root_refs {
        if !cache.page_is_valid(page_id) && !job.new_pages.iter().any(|page| page.id == page_id) {
            return Err(MareaError::JobNotCommittable(
                "root ref targets an unknown page",
            ));
        }
    }

    for page in &job.new_pages {
        cache.put_page(page.id, page.refs.clone())?;
    }

    apply_job_effects(cache, &job.root_refs, &job.refcount_deltas, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_deltas_sums_and_drops_zeroes() {
        let merged = merge_deltas(vec![
            (PageId(1), 1),
            (PageId(2), 1),
            (PageId(1), 1),
            (PageId(2), -1),
        ]);
        assert_eq!(merged, vec![(PageId(1), 2)]);
    }
}

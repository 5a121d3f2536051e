//! Shared page cache: arenas, allocators, and the page deleter.
//!
//! Pages live in per-device arenas; each arena's allocator tracks client
//! attachments and page reference counts, applying refcount updates exactly
//! once per `(caller_uuid, caller_slot)` key so crash replay is harmless.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::recycler::event::PageToRecycle;
use crate::recycler::RecyclerCore;
use crate::slot::clamp_min_slot;
use crate::slot::writer::Grant;
use crate::types::{MareaError, PageId, Result, SlotOffset, MAX_PAGE_REF_DEPTH};

pub mod job;

const MAX_REF_COUNT: i64 = u32::MAX as i64;

/// Physically drops pages on behalf of a recycler batch.
pub trait PageDeleter: Send + Sync {
    fn delete_pages(
        &self,
        pages: &[PageToRecycle],
        recycler: &RecyclerCore,
        batch_slot: SlotOffset,
        grant: &Grant,
    ) -> Result<()>;

    /// The recycler drained its queue up to `upper`.
    fn notify_caught_up(&self, recycler: &RecyclerCore, upper: SlotOffset);

    /// The recycle task exited with `err` without a shutdown request.
    fn notify_failure(&self, recycler: &RecyclerCore, err: &MareaError);
}

struct PageRecord {
    refs: Vec<PageId>,
}

/// Backing store for the pages of one device.
pub struct PageDevice {
    id: u64,
    pages: Mutex<HashMap<PageId, PageRecord>>,
}

impl PageDevice {
    pub fn get_id(&self) -> u64 {
        self.id
    }
}

struct AllocatorState {
    attachments: HashMap<Uuid, SlotOffset>,
    applied: HashSet<(Uuid, SlotOffset)>,
    refcounts: HashMap<PageId, i64>,
    attach_log_upper: SlotOffset,
}

/// Refcount and attachment bookkeeping for one device.
pub struct PageAllocator {
    state: Mutex<AllocatorState>,
}

impl PageAllocator {
    fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                attachments: HashMap::new(),
                applied: HashSet::new(),
                refcounts: HashMap::new(),
                attach_log_upper: 0,
            }),
        }
    }

    /// Registers `uuid` as a client of this device; idempotent. Returns the
    /// allocator-log offset to sync before recording the attachment in the
    /// volume WAL.
    pub fn attach_user(&self, uuid: Uuid, user_slot: SlotOffset) -> Result<SlotOffset> {
        let mut state = self.state.lock();
        state.attachments.entry(uuid).or_insert(user_slot);
        state.attach_log_upper += 1;
        Ok(state.attach_log_upper)
    }

    pub fn is_attached(&self, uuid: Uuid) -> bool {
        self.state.lock().attachments.contains_key(&uuid)
    }

    pub fn sync(&self, _slot_offset: SlotOffset) -> Result<()> {
        Ok(())
    }

    pub fn ref_count(&self, page_id: PageId) -> i64 {
        self.state
            .lock()
            .refcounts
            .get(&page_id)
            .copied()
            .unwrap_or(0)
    }

    /// Applies `deltas` exactly once for `(caller_uuid, caller_slot)`,
    /// returning the pages whose count transitioned to zero.
    fn update_refcounts(
        &self,
        caller_uuid: Uuid,
        caller_slot: SlotOffset,
        deltas: &[(PageId, i64)],
    ) -> Result<Vec<PageId>> {
        let mut state = self.state.lock();
        if !state.applied.insert((caller_uuid, caller_slot)) {
            debug!(%caller_uuid, caller_slot, "allocator.refcounts.already_applied");
            return Ok(Vec::new());
        }
        let mut dead = Vec::new();
        for &(page_id, delta) in deltas {
            let count = state.refcounts.entry(page_id).or_insert(0);
            let updated = *count + delta;
            if updated < 0 {
                return Err(MareaError::Corruption("page refcount went negative"));
            }
            if updated > MAX_REF_COUNT {
                return Err(MareaError::RefcountOverflow(page_id));
            }
            if *count > 0 && updated == 0 {
                dead.push(page_id);
            }
            *count = updated;
        }
        Ok(dead)
    }
}

/// One device's pages plus its allocator.
pub struct PageArena {
    device: Arc<PageDevice>,
    allocator: Arc<PageAllocator>,
}

impl PageArena {
    pub fn device(&self) -> &PageDevice {
        &self.device
    }

    pub fn allocator(&self) -> &PageAllocator {
        &self.allocator
    }
}

/// The shared page store; weak-shared across volumes.
pub struct PageCache {
    arenas: Vec<PageArena>,
}

impl PageCache {
    pub fn new(device_count: usize) -> Arc<Self> {
        let device_count = device_count.max(1);
        let arenas = (0..device_count as u64)
            .map(|id| PageArena {
                device: Arc::new(PageDevice {
                    id,
                    pages: Mutex::new(HashMap::new()),
                }),
                allocator: Arc::new(PageAllocator::new()),
            })
            .collect();
        Arc::new(Self { arenas })
    }

    pub fn all_arenas(&self) -> &[PageArena] {
        &self.arenas
    }

    fn arena_for(&self, page_id: PageId) -> &PageArena {
        &self.arenas[(page_id.0 % self.arenas.len() as u64) as usize]
    }

    /// Persists a page's content (its outgoing reference list).
    pub fn put_page(&self, page_id: PageId, refs: Vec<PageId>) -> Result<()> {
        let arena = self.arena_for(page_id);
        arena
            .device
            .pages
            .lock()
            .insert(page_id, PageRecord { refs });
        Ok(())
    }

    pub fn page_is_valid(&self, page_id: PageId) -> bool {
        self.arena_for(page_id)
            .device
            .pages
            .lock()
            .contains_key(&page_id)
    }

    pub fn page_refs(&self, page_id: PageId) -> Option<Vec<PageId>> {
        self.arena_for(page_id)
            .device
            .pages
            .lock()
            .get(&page_id)
            .map(|record| record.refs.clone())
    }

    /// Removes a page's content; `None` when it was already dropped.
    pub fn drop_page(&self, page_id: PageId) -> Option<Vec<PageId>> {
        self.arena_for(page_id)
            .device
            .pages
            .lock()
            .remove(&page_id)
            .map(|record| record.refs)
    }

    pub fn ref_count(&self, page_id: PageId) -> i64 {
        self.arena_for(page_id).allocator.ref_count(page_id)
    }

    /// Routes `deltas` to their owning arenas, applying each group exactly
    /// once per `(caller_uuid, caller_slot)`. Returns all newly dead pages.
    pub fn apply_refcount_deltas(
        &self,
        caller_uuid: Uuid,
        caller_slot: SlotOffset,
        deltas: &[(PageId, i64)],
    ) -> Result<Vec<PageId>> {
        let mut per_arena: Vec<Vec<(PageId, i64)>> = vec![Vec::new(); self.arenas.len()];
        for &(page_id, delta) in deltas {
            per_arena[(page_id.0 % self.arenas.len() as u64) as usize].push((page_id, delta));
        }
        let mut dead = Vec::new();
        for (arena, group) in self.arenas.iter().zip(per_arena) {
            if group.is_empty() {
                continue;
            }
            dead.extend(
                arena
                    .allocator
                    .update_refcounts(caller_uuid, caller_slot, &group)?,
            );
        }
        Ok(dead)
    }
}

/// [`PageDeleter`] over the shared page cache.
///
/// Dropping a page decrements the refcounts of everything it referenced;
/// pages falling to zero are fed back into the recycler one level deeper,
/// reusing the recycle task's grant.
pub struct CachePageDeleter {
    cache: Arc<PageCache>,
    caught_up: Mutex<Option<SlotOffset>>,
    failure: Mutex<Option<String>>,
}

impl CachePageDeleter {
    pub fn new(cache: Arc<PageCache>) -> Self {
        Self {
            cache,
            caught_up: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub fn last_caught_up(&self) -> Option<SlotOffset> {
        *self.caught_up.lock()
    }

    pub fn last_failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

impl PageDeleter for CachePageDeleter {
    fn delete_pages(
        &self,
        pages: &[PageToRecycle],
        recycler: &RecyclerCore,
        batch_slot: SlotOffset,
        grant: &Grant,
    ) -> Result<()> {
        let mut sync_point = None;
        for page in pages {
            // Refcount release happens before the physical drop so a crash
            // replay of this batch still sees the page's reference list.
            let Some(refs) = self.cache.page_refs(page.page_id) else {
                debug!(page = %page.page_id, "deleter.page_already_dropped");
                continue;
            };
            let deltas = job::merge_deltas(refs.iter().map(|&target| (target, -1i64)));
            let dead =
                self.cache
                    .apply_refcount_deltas(recycler.uuid(), page.slot_offset, &deltas)?;
            self.cache.drop_page(page.page_id);

            if !dead.is_empty() {
                let next_depth = page.depth + 1;
                if next_depth >= MAX_PAGE_REF_DEPTH {
                    return Err(MareaError::RecursionDepthExceeded(next_depth));
                }
                debug!(
                    page = %page.page_id,
                    released = dead.len(),
                    next_depth,
                    batch_slot,
                    "deleter.cascade"
                );
                let upper = recycler.recycle_pages(&dead, Some(grant), next_depth)?;
                clamp_min_slot(&mut sync_point, upper);
            }
        }
        if sync_point.is_some() {
            recycler.await_flush(sync_point)?;
        }
        Ok(())
    }

    fn notify_caught_up(&self, _recycler: &RecyclerCore, upper: SlotOffset) {
        *self.caught_up.lock() = Some(upper);
    }

    fn notify_failure(&self, _recycler: &RecyclerCore, err: &MareaError) {
        warn!(error = %err, "deleter.recycler_failed");
        *self.failure.lock() = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_updates_are_exactly_once() {
        let cache = PageCache::new(2);
        let caller = Uuid::new_v4();
        let deltas = vec![(PageId(1), 2), (PageId(2), 1)];
        cache.apply_refcount_deltas(caller, 10, &deltas).unwrap();
        cache.apply_refcount_deltas(caller, 10, &deltas).unwrap();
        assert_eq!(cache.ref_count(PageId(1)), 2);
        assert_eq!(cache.ref_count(PageId(2)), 1);
    }

    #[test]
    fn zero_transition_reports_dead_pages() {
        let cache = PageCache::new(1);
        let caller = Uuid::new_v4();
        cache
            .apply_refcount_deltas(caller, 1, &[(PageId(7), 1)])
            .unwrap();
        let dead = cache
            .apply_refcount_deltas(caller, 2, &[(PageId(7), -1)])
            .unwrap();
        assert_eq!(dead, vec![PageId(7)]);
    }

    #[test]
    fn negative_refcount_is_corruption() {
        let cache = PageCache::new(1);
        assert!(matches!(
            cache.apply_refcount_deltas(Uuid::new_v4(), 1, &[(PageId(3), -1)]),
            Err(MareaError::Corruption(_))
        ));
    }

    #[test]
    fn attachments_are_idempotent() {
        let cache = PageCache::new(1);
        let arena = &cache.all_arenas()[0];
        let uuid = Uuid::new_v4();
        let slot = arena.allocator().attach_user(uuid, 0).unwrap();
        arena.allocator().sync(slot).unwrap();
        assert!(arena.allocator().is_attached(uuid));
        arena.allocator().attach_user(uuid, 0).unwrap();
        assert!(arena.allocator().is_attached(uuid));
    }
}

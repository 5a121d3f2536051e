//! Read-locks over slot ranges, consulted by trimming.
//!
//! The manager keeps a table of live locked ranges; the minimum locked lower
//! bound is the ceiling for any trim. Locks reference the table through a
//! shared handle, so the manager's state outlives every outstanding lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::slot::{slot_lt, slot_max, slot_min, SlotRange};
use crate::types::{MareaError, Result, SlotOffset};

struct LockEntry {
    range: SlotRange,
    tag: &'static str,
}

struct TableState {
    locks: HashMap<u64, LockEntry>,
    next_handle: u64,
    halted: bool,
}

struct LockTable {
    state: Mutex<TableState>,
    cv: Condvar,
}

impl LockTable {
    fn lower_bound_locked(state: &TableState) -> Option<SlotOffset> {
        state
            .locks
            .values()
            .map(|entry| entry.range.lower)
            .reduce(slot_min)
    }
}

/// Coordinates read-locks over half-open slot ranges.
pub struct SlotLockManager {
    table: Arc<LockTable>,
}

impl Default for SlotLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotLockManager {
    pub fn new() -> Self {
        Self {
            table: Arc::new(LockTable {
                state: Mutex::new(TableState {
                    locks: HashMap::new(),
                    next_handle: 1,
                    halted: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Acquires a read lock over `range`; never blocks an append.
    pub fn lock_slots(&self, range: SlotRange, tag: &'static str) -> Result<SlotReadLock> {
        let mut state = self.table.state.lock();
        if state.halted {
            return Err(MareaError::Shutdown("slot lock manager halted"));
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.locks.insert(handle, LockEntry { range, tag });
        self.table.cv.notify_all();
        Ok(SlotReadLock {
            table: Arc::clone(&self.table),
            handle: Some(handle),
            range,
        })
    }

    /// Atomically replaces `lock` with a lock over `new_range`. The covered
    /// region is never released in between.
    pub fn update_lock(
        &self,
        mut lock: SlotReadLock,
        new_range: SlotRange,
        tag: &'static str,
    ) -> Result<SlotReadLock> {
        let handle = lock
            .handle
            .take()
            .ok_or(MareaError::Invalid("lock already consumed"))?;
        let mut state = self.table.state.lock();
        match state.locks.get_mut(&handle) {
            Some(entry) => {
                entry.range = new_range;
                entry.tag = tag;
            }
            None => return Err(MareaError::Invalid("lock not held by this manager")),
        }
        self.table.cv.notify_all();
        Ok(SlotReadLock {
            table: Arc::clone(&self.table),
            handle: Some(handle),
            range: new_range,
        })
    }

    /// Aggregate `[min lower, max upper)` over all live locks.
    pub fn locked_range(&self) -> Option<SlotRange> {
        let state = self.table.state.lock();
        let mut iter = state.locks.values().map(|entry| entry.range);
        let first = iter.next()?;
        let combined = iter.fold(first, |acc, range| {
            SlotRange::new(
                slot_min(acc.lower, range.lower),
                slot_max(acc.upper, range.upper),
            )
        });
        Some(combined)
    }

    /// Minimum locked lower bound, if any lock is live.
    pub fn lower_bound(&self) -> Option<SlotOffset> {
        let state = self.table.state.lock();
        LockTable::lower_bound_locked(&state)
    }

    /// Blocks until the minimum locked lower bound rises strictly above
    /// `current`, returning the new bound (`None` means no lock is live, so
    /// nothing constrains the caller).
    pub fn await_lower_bound_above(&self, current: SlotOffset) -> Result<Option<SlotOffset>> {
        let mut state = self.table.state.lock();
        loop {
            if state.halted {
                return Err(MareaError::Shutdown("slot lock manager halted"));
            }
            match LockTable::lower_bound_locked(&state) {
                None => return Ok(None),
                Some(lower) if slot_lt(current, lower) => return Ok(Some(lower)),
                Some(_) => {}
            }
            self.table.cv.wait(&mut state);
        }
    }

    /// Wakes all waiters; later lock acquisitions fail with `Shutdown`.
    pub fn halt(&self) {
        let mut state = self.table.state.lock();
        state.halted = true;
        self.table.cv.notify_all();
    }

    #[cfg(test)]
    fn live_lock_count(&self) -> usize {
        self.table.state.lock().locks.len()
    }
}

/// A held read lock; dropping it releases the covered range.
pub struct SlotReadLock {
    table: Arc<LockTable>,
    handle: Option<u64>,
    range: SlotRange,
}

impl SlotReadLock {
    pub fn slot_range(&self) -> SlotRange {
        self.range
    }
}

impl Drop for SlotReadLock {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let mut state = self.table.state.lock();
            state.locks.remove(&handle);
            self.table.cv.notify_all();
        }
    }
}

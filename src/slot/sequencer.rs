//! One-shot handoff between consecutive appends to the same volume.
//!
//! Each append awaits the previous append's prepare-slot publication before
//! writing its own prepare slot, and publishes its result (success or error)
//! exactly once for the next append in the chain.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::slot::SlotRange;
use crate::types::{MareaError, Result};

struct CellState {
    resolved: bool,
    value: Option<Result<SlotRange>>,
}

struct Cell {
    state: Mutex<CellState>,
    cv: Condvar,
}

impl Cell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState {
                resolved: false,
                value: None,
            }),
            cv: Condvar::new(),
        })
    }

    fn set(&self, value: Result<SlotRange>) -> bool {
        let mut state = self.state.lock();
        if state.resolved {
            return false;
        }
        state.resolved = true;
        state.value = Some(value);
        self.cv.notify_all();
        true
    }

    /// Takes the resolved value; each cell has a single consumer.
    fn await_value(&self) -> Result<SlotRange> {
        let mut state = self.state.lock();
        loop {
            if state.resolved {
                return state
                    .value
                    .take()
                    .unwrap_or(Err(MareaError::Invalid("sequencer slot consumed twice")));
            }
            self.cv.wait(&mut state);
        }
    }
}

/// A link in an append-ordering chain.
pub struct SlotSequencer {
    prev: Option<Arc<Cell>>,
    current: Arc<Cell>,
}

impl Default for SlotSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotSequencer {
    /// First link of a chain; `await_prev` returns immediately.
    pub fn new() -> Self {
        Self {
            prev: None,
            current: Cell::new(),
        }
    }

    /// The link that follows this one in the chain.
    pub fn next_in_chain(&self) -> SlotSequencer {
        Self {
            prev: Some(Arc::clone(&self.current)),
            current: Cell::new(),
        }
    }

    pub fn has_prev(&self) -> bool {
        self.prev.is_some()
    }

    /// Blocks until the predecessor publishes its prepare slot.
    ///
    /// `Ok(None)` when this is the head of the chain; the predecessor's
    /// error otherwise propagates to this caller.
    pub fn await_prev(&self) -> Result<Option<SlotRange>> {
        match &self.prev {
            None => Ok(None),
            Some(cell) => cell.await_value().map(Some),
        }
    }

    /// Publishes this append's prepare slot; false if already resolved.
    pub fn set_current(&self, range: SlotRange) -> bool {
        self.current.set(Ok(range))
    }

    /// Publishes a failure to every downstream waiter; false if resolved.
    pub fn set_error(&self, err: MareaError) -> bool {
        self.current.set(Err(err))
    }

    pub fn is_resolved(&self) -> bool {
        self.current.state.lock().resolved
    }
}

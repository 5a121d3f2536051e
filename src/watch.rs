//! A small observable cell used for cross-task signalling.

use parking_lot::{Condvar, Mutex};

use crate::types::{MareaError, Result};

/// Mutex-guarded value with change notification and close semantics.
///
/// Closing wakes every waiter with `Shutdown`; later waits fail immediately.
pub struct Watch<T> {
    state: Mutex<WatchState<T>>,
    cv: Condvar,
}

struct WatchState<T> {
    value: T,
    closed: bool,
}

impl<T: Copy + PartialEq> Watch<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(WatchState {
                value,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn get(&self) -> T {
        self.state.lock().value
    }

    pub fn set(&self, value: T) {
        let mut state = self.state.lock();
        if state.value != value {
            state.value = value;
            self.cv.notify_all();
        }
    }

    pub fn modify(&self, f: impl FnOnce(T) -> T) -> T {
        let mut state = self.state.lock();
        let next = f(state.value);
        if state.value != next {
            state.value = next;
            self.cv.notify_all();
        }
        next
    }

    /// Blocks until the value differs from `current` or the watch is closed.
    pub fn await_not_equal(&self, current: T) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(MareaError::Shutdown("watch closed"));
            }
            if state.value != current {
                return Ok(state.value);
            }
            self.cv.wait(&mut state);
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cv.notify_all();
    }
}

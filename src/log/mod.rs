//! Byte-log device abstraction consumed by the slot reader/writer layer.

use std::sync::Arc;

use crate::slot::{LogReadMode, SlotRange};
use crate::types::{Result, SlotOffset};

pub mod config;
pub mod memory;

/// Sync target: every slot with `upper <= offset` must be visible in the
/// requested mode once the call returns.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SlotUpperBoundAt {
    pub offset: SlotOffset,
}

/// A bounded, trimmable byte log with speculative and durable visibility.
pub trait LogDevice: Send + Sync {
    fn capacity(&self) -> u64;

    fn slot_range(&self, mode: LogReadMode) -> SlotRange;

    /// Appends `bytes` at the speculative upper bound.
    fn append_bytes(&self, bytes: &[u8]) -> Result<SlotRange>;

    /// Discards all bytes below `new_lower`.
    fn trim(&self, new_lower: SlotOffset) -> Result<()>;

    fn sync(&self, mode: LogReadMode, target: SlotUpperBoundAt) -> Result<()>;

    /// Makes everything appended so far durable.
    fn flush(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn new_reader(&self, lower: Option<SlotOffset>, mode: LogReadMode) -> Box<dyn LogReader>;
}

/// Sequential cursor over the visible portion of a log.
pub trait LogReader: Send {
    /// Current read position on the slot-offset axis.
    fn slot_offset(&self) -> SlotOffset;

    /// Visible upper bound for this reader's mode, sampled now.
    fn upper_bound(&self) -> SlotOffset;

    /// Fills `buf` completely, or returns `Ok(false)` without consuming
    /// anything when fewer than `buf.len()` visible bytes remain.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<bool>;

    /// Repositions the cursor; used to un-read a partially visible slot.
    fn set_slot_offset(&mut self, offset: SlotOffset);
}

impl<T: LogReader + ?Sized> LogReader for &mut T {
    fn slot_offset(&self) -> SlotOffset {
        (**self).slot_offset()
    }
    fn upper_bound(&self) -> SlotOffset {
        (**self).upper_bound()
    }
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<bool> {
        (**self).read_exact(buf)
    }
    fn set_slot_offset(&mut self, offset: SlotOffset) {
        (**self).set_slot_offset(offset)
    }
}

impl<T: LogReader + ?Sized> LogReader for Box<T> {
    fn slot_offset(&self) -> SlotOffset {
        (**self).slot_offset()
    }
    fn upper_bound(&self) -> SlotOffset {
        (**self).upper_bound()
    }
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<bool> {
        (**self).read_exact(buf)
    }
    fn set_slot_offset(&mut self, offset: SlotOffset) {
        (**self).set_slot_offset(offset)
    }
}

/// Opens a log device, replaying its contents exactly once through `scan`.
///
/// `scan` receives a reader positioned at the log's lower bound and returns
/// the offset one past the last well-formed slot; anything beyond it is
/// discarded as a torn tail.
pub trait LogDeviceFactory: Send + Sync {
    fn open_log_device(
        &self,
        scan: &mut dyn FnMut(&mut dyn LogReader) -> Result<SlotOffset>,
    ) -> Result<Arc<dyn LogDevice>>;
}

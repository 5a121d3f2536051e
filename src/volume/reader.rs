//! Locked reads over a volume's committed event stream.

use crate::log::LogReader;
use crate::slot::lock::SlotReadLock;
use crate::slot::reader::TypedSlotReader;
use crate::slot::{slot_le, LogReadMode, SlotRange};
use crate::types::Result;
use crate::volume::event::VolumeEvent;

/// A totally-ordered view of a volume's WAL, protected by a slot read lock:
/// trim cannot advance past the locked range while the reader is alive.
pub struct VolumeReader {
    read_lock: SlotReadLock,
    mode: LogReadMode,
    slots: TypedSlotReader<Box<dyn LogReader>, VolumeEvent>,
}

impl VolumeReader {
    pub(crate) fn new(
        read_lock: SlotReadLock,
        mode: LogReadMode,
        reader: Box<dyn LogReader>,
    ) -> Self {
        Self {
            read_lock,
            mode,
            slots: TypedSlotReader::new(reader),
        }
    }

    /// The locked slot range this reader may observe.
    pub fn slot_range(&self) -> SlotRange {
        self.read_lock.slot_range()
    }

    pub fn mode(&self) -> LogReadMode {
        self.mode
    }

    /// Visits the next event within the locked range; `Ok(false)` when the
    /// range (or the visible log) is exhausted.
    pub fn visit_next(
        &mut self,
        mut visit: impl FnMut(SlotRange, VolumeEvent) -> Result<()>,
    ) -> Result<bool> {
        let lock_upper = self.read_lock.slot_range().upper;
        if slot_le(lock_upper, self.slots.slot_offset()) {
            return Ok(false);
        }
        match self.slots.next_slot()? {
            None => Ok(false),
            Some((range, event)) => {
                if slot_le(lock_upper, range.lower) {
                    return Ok(false);
                }
                visit(range, event)?;
                Ok(true)
            }
        }
    }

    /// Visits every event currently visible in the locked range.
    pub fn visit_all(
        &mut self,
        mut visit: impl FnMut(SlotRange, VolumeEvent) -> Result<()>,
    ) -> Result<usize> {
        let mut count = 0;
        while self.visit_next(&mut visit)? {
            count += 1;
        }
        Ok(count)
    }
}

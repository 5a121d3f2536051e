//! In-memory log device.
//!
//! Backs the WALs in tests and embedded configurations. The factory retains
//! the backing store across open calls, so a crash/reopen cycle can be
//! simulated: everything above the durable upper bound is discarded when the
//! log is opened (or explicitly crashed).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::log::{LogDevice, LogDeviceFactory, LogReader, SlotUpperBoundAt};
use crate::slot::{slot_le, slot_max, slot_min, LogReadMode, SlotRange};
use crate::types::{MareaError, Result, SlotOffset};

struct LogState {
    /// Bytes for offsets `[origin, origin + data.len())`.
    data: Vec<u8>,
    origin: SlotOffset,
    durable_upper: SlotOffset,
    closed: bool,
}

impl LogState {
    fn speculative_upper(&self) -> SlotOffset {
        self.origin.wrapping_add(self.data.len() as u64)
    }

    fn visible_upper(&self, mode: LogReadMode) -> SlotOffset {
        match mode {
            LogReadMode::Speculative => self.speculative_upper(),
            LogReadMode::Durable => self.durable_upper,
        }
    }

    fn truncate_to(&mut self, upper: SlotOffset) {
        let keep = upper.wrapping_sub(self.origin) as usize;
        self.data.truncate(keep);
        self.durable_upper = slot_min(self.durable_upper, upper);
    }
}

struct Shared {
    state: Mutex<LogState>,
}

pub struct MemoryLogDevice {
    capacity: u64,
    shared: Arc<Shared>,
}

impl LogDevice for MemoryLogDevice {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn slot_range(&self, mode: LogReadMode) -> SlotRange {
        let state = self.shared.state.lock();
        SlotRange::new(state.origin, state.visible_upper(mode))
    }

    fn append_bytes(&self, bytes: &[u8]) -> Result<SlotRange> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(MareaError::Shutdown("log device closed"));
        }
        let in_use = state.data.len() as u64;
        if in_use + bytes.len() as u64 > self.capacity {
            return Err(MareaError::LogFull("log device capacity exceeded"));
        }
        let lower = state.speculative_upper();
        state.data.extend_from_slice(bytes);
        Ok(SlotRange::new(lower, state.speculative_upper()))
    }

    fn trim(&self, new_lower: SlotOffset) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !slot_le(state.origin, new_lower) || !slot_le(new_lower, state.durable_upper) {
            return Err(MareaError::Invalid("trim target outside durable range"));
        }
        let drop_len = new_lower.wrapping_sub(state.origin) as usize;
        state.data.drain(..drop_len);
        state.origin = new_lower;
        Ok(())
    }

    fn sync(&self, mode: LogReadMode, target: SlotUpperBoundAt) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(MareaError::Shutdown("log device closed"));
        }
        if let LogReadMode::Durable = mode {
            let bounded = slot_min(target.offset, state.speculative_upper());
            state.durable_upper = slot_max(state.durable_upper, bounded);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(MareaError::Shutdown("log device closed"));
        }
        state.durable_upper = state.speculative_upper();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.state.lock().closed = true;
        Ok(())
    }

    fn new_reader(&self, lower: Option<SlotOffset>, mode: LogReadMode) -> Box<dyn LogReader> {
        let pos = {
            let state = self.shared.state.lock();
            lower.unwrap_or(state.origin)
        };
        Box::new(MemoryLogReader {
            shared: Arc::clone(&self.shared),
            pos,
            mode,
        })
    }
}

struct MemoryLogReader {
    shared: Arc<Shared>,
    pos: SlotOffset,
    mode: LogReadMode,
}

impl LogReader for MemoryLogReader {
    fn slot_offset(&self) -> SlotOffset {
        self.pos
    }

    fn upper_bound(&self) -> SlotOffset {
        self.shared.state.lock().visible_upper(self.mode)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<bool> {
        let state = self.shared.state.lock();
        if !slot_le(state.origin, self.pos) {
            return Err(MareaError::Corruption("log read below trim point"));
        }
        let visible = state.visible_upper(self.mode);
        let remaining = visible.wrapping_sub(self.pos);
        if remaining < buf.len() as u64 {
            return Ok(false);
        }
        let start = self.pos.wrapping_sub(state.origin) as usize;
        buf.copy_from_slice(&state.data[start..start + buf.len()]);
        self.pos = self.pos.wrapping_add(buf.len() as u64);
        Ok(true)
    }

    fn set_slot_offset(&mut self, offset: SlotOffset) {
        self.pos = offset;
    }
}

/// Factory that owns the backing store; reopening discards the non-durable
/// suffix, the same way a crash would.
pub struct MemoryLogFactory {
    capacity: u64,
    shared: Arc<Shared>,
}

impl MemoryLogFactory {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            shared: Arc::new(Shared {
                state: Mutex::new(LogState {
                    data: Vec::new(),
                    origin: 0,
                    durable_upper: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Simulates a crash: the speculative suffix is lost, the log reopens.
    pub fn crash(&self) {
        let mut state = self.shared.state.lock();
        let durable = state.durable_upper;
        state.truncate_to(durable);
        state.closed = false;
    }

    pub fn durable_upper(&self) -> SlotOffset {
        self.shared.state.lock().durable_upper
    }
}

impl LogDeviceFactory for MemoryLogFactory {
    fn open_log_device(
        &self,
        scan: &mut dyn FnMut(&mut dyn LogReader) -> Result<SlotOffset>,
    ) -> Result<Arc<dyn LogDevice>> {
        let origin = {
            let mut state = self.shared.state.lock();
            let durable = state.durable_upper;
            state.truncate_to(durable);
            state.closed = false;
            state.origin
        };
        let mut reader = MemoryLogReader {
            shared: Arc::clone(&self.shared),
            pos: origin,
            mode: LogReadMode::Durable,
        };
        let last_offset = scan(&mut reader)?;
        {
            let mut state = self.shared.state.lock();
            state.truncate_to(last_offset);
        }
        Ok(Arc::new(MemoryLogDevice {
            capacity: self.capacity,
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(factory: &MemoryLogFactory) -> Arc<dyn LogDevice> {
        factory
            .open_log_device(&mut |reader| Ok(reader.upper_bound()))
            .expect("open log")
    }

    #[test]
    fn append_sync_read_roundtrip() {
        let factory = MemoryLogFactory::new(1024);
        let device = open(&factory);
        let range = device.append_bytes(b"hello").unwrap();
        assert_eq!(range, SlotRange::new(0, 5));
        assert_eq!(
            device.slot_range(LogReadMode::Durable),
            SlotRange::new(0, 0)
        );
        device
            .sync(LogReadMode::Durable, SlotUpperBoundAt { offset: 5 })
            .unwrap();
        assert_eq!(
            device.slot_range(LogReadMode::Durable),
            SlotRange::new(0, 5)
        );

        let mut reader = device.new_reader(None, LogReadMode::Durable);
        let mut buf = [0u8; 5];
        assert!(reader.read_exact(&mut buf).unwrap());
        assert_eq!(&buf, b"hello");
        assert!(!reader.read_exact(&mut buf).unwrap());
    }

    #[test]
    fn crash_discards_speculative_suffix() {
        let factory = MemoryLogFactory::new(1024);
        let device = open(&factory);
        device.append_bytes(b"durable").unwrap();
        device
            .sync(LogReadMode::Durable, SlotUpperBoundAt { offset: 7 })
            .unwrap();
        device.append_bytes(b"lost").unwrap();
        drop(device);

        factory.crash();
        let device = open(&factory);
        assert_eq!(
            device.slot_range(LogReadMode::Speculative),
            SlotRange::new(0, 7)
        );
    }

    #[test]
    fn trim_advances_lower_bound() {
        let factory = MemoryLogFactory::new(1024);
        let device = open(&factory);
        device.append_bytes(&[1, 2, 3, 4, 5, 6]).unwrap();
        device.flush().unwrap();
        device.trim(4).unwrap();
        assert_eq!(
            device.slot_range(LogReadMode::Durable),
            SlotRange::new(4, 6)
        );
        assert!(device.trim(2).is_err());
    }
}

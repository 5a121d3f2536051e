//! Typed sequential scan over the framed slots of a log.

use std::convert::TryInto;
use std::marker::PhantomData;

use crate::log::LogReader;
use crate::slot::writer::{WalEvent, SLOT_HEADER_SIZE};
use crate::slot::SlotRange;
use crate::types::{MareaError, Result, SlotOffset};

/// Largest accepted slot body; anything bigger is treated as corruption.
const MAX_SLOT_BODY: u32 = 1 << 24;

/// Decodes one typed event per framed slot, verifying each checksum.
///
/// A partially visible slot at the end of the readable region is left
/// unconsumed, so the scan can resume once more of the log becomes visible.
pub struct TypedSlotReader<R, E> {
    reader: R,
    _marker: PhantomData<E>,
}

impl<R: LogReader, E: WalEvent> TypedSlotReader<R, E> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            _marker: PhantomData,
        }
    }

    pub fn slot_offset(&self) -> SlotOffset {
        self.reader.slot_offset()
    }

    /// Reads the next slot, or `Ok(None)` when no complete slot is visible.
    pub fn next_slot(&mut self) -> Result<Option<(SlotRange, E)>> {
        let lower = self.reader.slot_offset();

        let mut header = [0u8; SLOT_HEADER_SIZE];
        if !self.reader.read_exact(&mut header)? {
            return Ok(None);
        }
        let body_len = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let expected_crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if body_len == 0 || body_len > MAX_SLOT_BODY {
            return Err(MareaError::Decode("slot length out of range"));
        }

        let mut body = vec![0u8; body_len as usize];
        if !self.reader.read_exact(&mut body)? {
            self.reader.set_slot_offset(lower);
            return Ok(None);
        }
        if crc32fast::hash(&body) != expected_crc {
            return Err(MareaError::Decode("slot checksum mismatch"));
        }

        let event = E::decode(body[0], &body[1..])?;
        let upper = self.reader.slot_offset();
        Ok(Some((SlotRange::new(lower, upper), event)))
    }

    /// Scans every visible slot through `visit`; returns the slot count.
    pub fn visit_all(
        &mut self,
        mut visit: impl FnMut(SlotRange, E) -> Result<()>,
    ) -> Result<usize> {
        let mut count = 0;
        while let Some((range, event)) = self.next_slot()? {
            visit(range, event)?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::log::memory::MemoryLogFactory;
    use crate::log::{LogDeviceFactory, SlotUpperBoundAt};
    use crate::slot::writer::SlotWriter;
    use crate::slot::{LogReadMode, WaitForResource};

    #[derive(Debug, PartialEq)]
    struct TestEvent(u64);

    impl WalEvent for TestEvent {
        fn tag(&self) -> u8 {
            1
        }
        fn payload_size(&self) -> usize {
            8
        }
        fn encode_payload(&self, out: &mut Vec<u8>) {
            out.extend_from_slice(&self.0.to_le_bytes());
        }
        fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
            if tag != 1 || payload.len() != 8 {
                return Err(MareaError::Decode("bad test event"));
            }
            Ok(TestEvent(u64::from_le_bytes(payload.try_into().unwrap())))
        }
    }

    #[test]
    fn scan_reads_back_appended_events() {
        let factory = MemoryLogFactory::new(1024);
        let device = factory
            .open_log_device(&mut |reader| Ok(reader.upper_bound()))
            .unwrap();
        let writer = SlotWriter::new(Arc::clone(&device));
        let grant = writer.reserve(256, WaitForResource::NoWait).unwrap();
        let mut expected = Vec::new();
        for value in [3u64, 5, 8] {
            let range = writer.append(&grant, &TestEvent(value)).unwrap();
            expected.push((range, value));
        }
        writer
            .sync(
                LogReadMode::Durable,
                SlotUpperBoundAt {
                    offset: expected.last().unwrap().0.upper,
                },
            )
            .unwrap();

        let mut typed =
            TypedSlotReader::<_, TestEvent>::new(device.new_reader(None, LogReadMode::Durable));
        let mut seen = Vec::new();
        typed
            .visit_all(|range, event| {
                seen.push((range, event.0));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, expected);
    }

    #[test]
    fn scan_stops_before_non_durable_slot() {
        let factory = MemoryLogFactory::new(1024);
        let device = factory
            .open_log_device(&mut |reader| Ok(reader.upper_bound()))
            .unwrap();
        let writer = SlotWriter::new(Arc::clone(&device));
        let grant = writer.reserve(128, WaitForResource::NoWait).unwrap();
        let first = writer.append(&grant, &TestEvent(1)).unwrap();
        writer
            .sync(
                LogReadMode::Durable,
                SlotUpperBoundAt {
                    offset: first.upper,
                },
            )
            .unwrap();
        writer.append(&grant, &TestEvent(2)).unwrap();

        let mut typed =
            TypedSlotReader::<_, TestEvent>::new(device.new_reader(None, LogReadMode::Durable));
        assert!(typed.next_slot().unwrap().is_some());
        assert!(typed.next_slot().unwrap().is_none());
        assert_eq!(typed.slot_offset(), first.upper);
    }
}

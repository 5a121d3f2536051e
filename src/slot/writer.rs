//! Slot framing, grant accounting, and the append path of a WAL.
//!
//! Every slot is framed as `[len: u32][crc32: u32][tag: u8][payload]`, all
//! little-endian, with the checksum covering tag and payload. Space in the
//! log is handed out as [`Grant`]s drawn from a single pool per log; grants
//! are consumed by appends and replenished by trims.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::log::{LogDevice, SlotUpperBoundAt};
use crate::slot::{slot_le, LogReadMode, SlotRange, WaitForResource};
use crate::types::{MareaError, Result, SlotOffset};

/// Frame header: length (u32) + crc32 (u32).
pub const SLOT_HEADER_SIZE: usize = 8;

/// Framed size of a slot whose payload (excluding tag) is `payload_size`.
pub const fn packed_slot_size(payload_size: usize) -> u64 {
    (SLOT_HEADER_SIZE + 1 + payload_size) as u64
}

/// A typed event that can be written to and read back from a WAL.
pub trait WalEvent: Sized {
    fn tag(&self) -> u8;
    fn payload_size(&self) -> usize;
    fn encode_payload(&self, out: &mut Vec<u8>);
    fn decode(tag: u8, payload: &[u8]) -> Result<Self>;

    fn packed_size(&self) -> u64 {
        packed_slot_size(self.payload_size())
    }
}

pub fn encode_frame<E: WalEvent>(event: &E) -> Vec<u8> {
    let payload_size = event.payload_size();
    let mut frame = Vec::with_capacity(SLOT_HEADER_SIZE + 1 + payload_size);
    frame.extend_from_slice(&[0u8; SLOT_HEADER_SIZE]);
    frame.push(event.tag());
    event.encode_payload(&mut frame);
    let body_len = (frame.len() - SLOT_HEADER_SIZE) as u32;
    let crc = crc32fast::hash(&frame[SLOT_HEADER_SIZE..]);
    frame[0..4].copy_from_slice(&body_len.to_le_bytes());
    frame[4..8].copy_from_slice(&crc.to_le_bytes());
    frame
}

struct PoolState {
    available: u64,
    reserved: u64,
    next_slot: SlotOffset,
    trim_lower: SlotOffset,
    halted: bool,
}

struct WriterShared {
    capacity: u64,
    pool: Mutex<PoolState>,
    cv: Condvar,
}

/// Append half of a WAL: grant reservation, typed appends, trim, sync.
///
/// Cheap to clone; all clones share one grant pool.
#[derive(Clone)]
pub struct SlotWriter {
    device: Arc<dyn LogDevice>,
    shared: Arc<WriterShared>,
}

impl SlotWriter {
    pub fn new(device: Arc<dyn LogDevice>) -> Self {
        let range = device.slot_range(LogReadMode::Speculative);
        let capacity = device.capacity();
        let shared = Arc::new(WriterShared {
            capacity,
            pool: Mutex::new(PoolState {
                available: capacity - range.len(),
                reserved: 0,
                next_slot: range.upper,
                trim_lower: range.lower,
                halted: false,
            }),
            cv: Condvar::new(),
        });
        Self { device, shared }
    }

    pub fn log_capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Unreserved bytes currently available for new grants.
    pub fn pool_size(&self) -> u64 {
        self.shared.pool.lock().available
    }

    /// Bytes currently occupied by appended, untrimmed slots.
    pub fn in_use_size(&self) -> u64 {
        let pool = self.shared.pool.lock();
        pool.next_slot.wrapping_sub(pool.trim_lower)
    }

    /// Offset at which the next slot will be appended.
    pub fn slot_offset(&self) -> SlotOffset {
        self.shared.pool.lock().next_slot
    }

    pub fn reserve(&self, size: u64, wait: WaitForResource) -> Result<Grant> {
        let mut pool = self.shared.pool.lock();
        loop {
            if pool.halted {
                return Err(MareaError::Shutdown("slot writer halted"));
            }
            if pool.available >= size {
                pool.available -= size;
                pool.reserved += size;
                return Ok(Grant::new(Arc::clone(&self.shared), size));
            }
            if wait == WaitForResource::NoWait {
                return Err(MareaError::LogFull("insufficient log space for grant"));
            }
            self.shared.cv.wait(&mut pool);
        }
    }

    /// Appends one typed slot, consuming its framed size from `grant`.
    pub fn append<E: WalEvent>(&self, grant: &Grant, event: &E) -> Result<SlotRange> {
        let frame = encode_frame(event);
        let frame_len = frame.len() as u64;
        grant.take(frame_len)?;

        let result = {
            let mut pool = self.shared.pool.lock();
            if pool.halted {
                Err(MareaError::Shutdown("slot writer halted"))
            } else {
                self.device.append_bytes(&frame).map(|range| {
                    pool.reserved -= frame_len;
                    pool.next_slot = range.upper;
                    range
                })
            }
        };
        if result.is_err() {
            grant.put_back(frame_len);
        }
        result
    }

    pub fn sync(&self, mode: LogReadMode, target: SlotUpperBoundAt) -> Result<()> {
        self.device.sync(mode, target)
    }

    /// Advances the log's lower bound, returning freed bytes to the pool.
    pub fn trim(&self, new_lower: SlotOffset) -> Result<()> {
        let mut pool = self.shared.pool.lock();
        if !slot_le(pool.trim_lower, new_lower) {
            return Err(MareaError::Invalid("trim target below current lower bound"));
        }
        self.device.trim(new_lower)?;
        let freed = new_lower.wrapping_sub(pool.trim_lower);
        pool.trim_lower = new_lower;
        pool.available += freed;
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Fails all current and future reservations; wakes waiters.
    pub fn halt(&self) {
        let mut pool = self.shared.pool.lock();
        pool.halted = true;
        self.shared.cv.notify_all();
    }
}

/// A reservation of bytes in a WAL's pool.
///
/// Dropping a grant returns its unused bytes to the pool. Grants from
/// different logs can never be merged.
pub struct Grant {
    issuer: Arc<WriterShared>,
    held: Mutex<u64>,
    cv: Condvar,
    revoked: AtomicBool,
}

impl Grant {
    fn new(issuer: Arc<WriterShared>, size: u64) -> Self {
        Self {
            issuer,
            held: Mutex::new(size),
            cv: Condvar::new(),
            revoked: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> u64 {
        *self.held.lock()
    }

    /// Splits `size` bytes off into a new grant, optionally blocking until
    /// this grant is topped up (via [`Grant::subsume`]) to cover the request.
    pub fn spend(&self, size: u64, wait: WaitForResource) -> Result<Grant> {
        let mut held = self.held.lock();
        loop {
            if self.revoked.load(Ordering::Acquire) {
                return Err(MareaError::Shutdown("grant revoked"));
            }
            if *held >= size {
                *held -= size;
                return Ok(Grant::new(Arc::clone(&self.issuer), size));
            }
            if wait == WaitForResource::NoWait {
                return Err(MareaError::LogFull("grant too small"));
            }
            self.cv.wait(&mut held);
        }
    }

    /// Absorbs `other` into this grant; both must come from the same log.
    pub fn subsume(&self, other: Grant) -> Result<()> {
        if !Arc::ptr_eq(&self.issuer, &other.issuer) {
            return Err(MareaError::Invalid("grants from different logs"));
        }
        let transferred = other.take_all();
        let mut held = self.held.lock();
        *held += transferred;
        self.cv.notify_all();
        Ok(())
    }

    /// Returns all held bytes to the pool and fails any blocked spenders.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
        let released = self.take_all();
        self.release_to_pool(released);
        self.cv.notify_all();
    }

    fn take(&self, size: u64) -> Result<()> {
        if self.revoked.load(Ordering::Acquire) {
            return Err(MareaError::Shutdown("grant revoked"));
        }
        let mut held = self.held.lock();
        if *held < size {
            return Err(MareaError::LogFull("grant too small"));
        }
        *held -= size;
        Ok(())
    }

    fn put_back(&self, size: u64) {
        let mut held = self.held.lock();
        *held += size;
        self.cv.notify_all();
    }

    fn take_all(&self) -> u64 {
        let mut held = self.held.lock();
        std::mem::take(&mut *held)
    }

    fn release_to_pool(&self, size: u64) {
        if size == 0 {
            return;
        }
        let mut pool = self.issuer.pool.lock();
        pool.reserved -= size;
        pool.available += size;
        self.issuer.cv.notify_all();
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        let remaining = self.take_all();
        self.release_to_pool(remaining);
    }
}

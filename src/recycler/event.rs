//! Typed events of the page recycler WAL and their packed wire forms.

use std::convert::TryInto;
use std::fmt;

use uuid::Uuid;

use crate::recycler::options::PageRecyclerOptions;
use crate::slot::writer::{packed_slot_size, WalEvent};
use crate::types::{MareaError, PageId, Result, SlotOffset};

pub const TAG_RECYCLER_INFO: u8 = 1;
pub const TAG_PAGE_TO_RECYCLE: u8 = 2;
pub const TAG_BATCH_PREPARE: u8 = 3;
pub const TAG_BATCH_COMMIT: u8 = 4;

pub const INFO_PAYLOAD_SIZE: usize = 32;
pub const PAGE_TO_RECYCLE_PAYLOAD_SIZE: usize = 20;
pub const BATCH_PREPARE_PAYLOAD_SIZE: usize = 16;
pub const BATCH_COMMIT_PAYLOAD_SIZE: usize = 8;

pub const fn info_slot_size() -> u64 {
    packed_slot_size(INFO_PAYLOAD_SIZE)
}

pub const fn page_to_recycle_slot_size() -> u64 {
    packed_slot_size(PAGE_TO_RECYCLE_PAYLOAD_SIZE)
}

pub const fn batch_prepare_slot_size() -> u64 {
    packed_slot_size(BATCH_PREPARE_PAYLOAD_SIZE)
}

pub const fn batch_commit_slot_size() -> u64 {
    packed_slot_size(BATCH_COMMIT_PAYLOAD_SIZE)
}

/// A logically enqueued page drop.
///
/// `slot_offset` is the recycler WAL offset at which the enqueue was logged;
/// it keys exactly-once refcount release and bounds log trimming.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PageToRecycle {
    pub page_id: PageId,
    pub slot_offset: SlotOffset,
    pub depth: u32,
}

impl fmt::Display for PageToRecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PageToRecycle(page={}, slot={}, depth={})",
            self.page_id, self.slot_offset, self.depth
        )
    }
}

/// Identity and options record, refreshed so the log prefix can be trimmed
/// without orphaning the recycler's identity.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PackedRecyclerInfo {
    pub uuid: Uuid,
    pub batch_size: u32,
    pub info_refresh_interval: u64,
    pub max_refs_per_page: u32,
}

impl PackedRecyclerInfo {
    pub fn from_options(uuid: Uuid, options: &PageRecyclerOptions) -> Self {
        Self {
            uuid,
            batch_size: options.batch_size as u32,
            info_refresh_interval: options.info_refresh_interval,
            max_refs_per_page: options.max_refs_per_page,
        }
    }

    pub fn to_options(&self) -> PageRecyclerOptions {
        PageRecyclerOptions {
            batch_size: self.batch_size as usize,
            info_refresh_interval: self.info_refresh_interval,
            max_refs_per_page: self.max_refs_per_page,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum RecycleEvent {
    Info(PackedRecyclerInfo),
    PageToRecycle(PageToRecycle),
    BatchPrepare {
        page_id: PageId,
        batch_slot: SlotOffset,
    },
    BatchCommit {
        batch_slot: SlotOffset,
    },
}

impl WalEvent for RecycleEvent {
    fn tag(&self) -> u8 {
        match self {
            RecycleEvent::Info(_) => TAG_RECYCLER_INFO,
            RecycleEvent::PageToRecycle(_) => TAG_PAGE_TO_RECYCLE,
            RecycleEvent::BatchPrepare { .. } => TAG_BATCH_PREPARE,
            RecycleEvent::BatchCommit { .. } => TAG_BATCH_COMMIT,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            RecycleEvent::Info(_) => INFO_PAYLOAD_SIZE,
            RecycleEvent::PageToRecycle(_) => PAGE_TO_RECYCLE_PAYLOAD_SIZE,
            RecycleEvent::BatchPrepare { .. } => BATCH_PREPARE_PAYLOAD_SIZE,
            RecycleEvent::BatchCommit { .. } => BATCH_COMMIT_PAYLOAD_SIZE,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            RecycleEvent::Info(info) => {
                out.extend_from_slice(info.uuid.as_bytes());
                out.extend_from_slice(&info.batch_size.to_le_bytes());
                out.extend_from_slice(&info.info_refresh_interval.to_le_bytes());
                out.extend_from_slice(&info.max_refs_per_page.to_le_bytes());
            }
            RecycleEvent::PageToRecycle(item) => {
                out.extend_from_slice(&item.page_id.0.to_le_bytes());
                out.extend_from_slice(&item.slot_offset.to_le_bytes());
                out.extend_from_slice(&item.depth.to_le_bytes());
            }
            RecycleEvent::BatchPrepare {
                page_id,
                batch_slot,
            } => {
                out.extend_from_slice(&page_id.0.to_le_bytes());
                out.extend_from_slice(&batch_slot.to_le_bytes());
            }
            RecycleEvent::BatchCommit { batch_slot } => {
                out.extend_from_slice(&batch_slot.to_le_bytes());
            }
        }
    }

    fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
        match tag {
            TAG_RECYCLER_INFO => {
                if payload.len() != INFO_PAYLOAD_SIZE {
                    return Err(MareaError::Decode("recycler info payload size"));
                }
                Ok(RecycleEvent::Info(PackedRecyclerInfo {
                    uuid: Uuid::from_bytes(payload[0..16].try_into().unwrap()),
                    batch_size: u32::from_le_bytes(payload[16..20].try_into().unwrap()),
                    info_refresh_interval: u64::from_le_bytes(payload[20..28].try_into().unwrap()),
                    max_refs_per_page: u32::from_le_bytes(payload[28..32].try_into().unwrap()),
                }))
            }
            TAG_PAGE_TO_RECYCLE => {
                if payload.len() != PAGE_TO_RECYCLE_PAYLOAD_SIZE {
                    return Err(MareaError::Decode("page-to-recycle payload size"));
                }
                Ok(RecycleEvent::PageToRecycle(PageToRecycle {
                    page_id: PageId(u64::from_le_bytes(payload[0..8].try_into().unwrap())),
                    slot_offset: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
                    depth: u32::from_le_bytes(payload[16..20].try_into().unwrap()),
                }))
            }
            TAG_BATCH_PREPARE => {
                if payload.len() != BATCH_PREPARE_PAYLOAD_SIZE {
                    return Err(MareaError::Decode("batch prepare payload size"));
                }
                Ok(RecycleEvent::BatchPrepare {
                    page_id: PageId(u64::from_le_bytes(payload[0..8].try_into().unwrap())),
                    batch_slot: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
                })
            }
            TAG_BATCH_COMMIT => {
                if payload.len() != BATCH_COMMIT_PAYLOAD_SIZE {
                    return Err(MareaError::Decode("batch commit payload size"));
                }
                Ok(RecycleEvent::BatchCommit {
                    batch_slot: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
                })
            }
            _ => Err(MareaError::Decode("unknown recycler event tag")),
        }
    }
}

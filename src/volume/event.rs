//! Typed events of the volume WAL and their packed wire forms.

use std::convert::TryInto;

use uuid::Uuid;

use crate::slot::writer::{packed_slot_size, WalEvent};
use crate::types::{MareaError, PageId, Result, SlotOffset};

pub const TAG_VOLUME_IDS: u8 = 1;
pub const TAG_VOLUME_ATTACH: u8 = 2;
pub const TAG_VOLUME_DETACH: u8 = 3;
pub const TAG_PREPARE_JOB: u8 = 4;
pub const TAG_COMMIT_JOB: u8 = 5;
pub const TAG_ROLLBACK_JOB: u8 = 6;
pub const TAG_USER_DATA: u8 = 7;

pub const IDS_PAYLOAD_SIZE: usize = 48;
pub const ATTACH_PAYLOAD_SIZE: usize = 24;
pub const RESOLVE_PAYLOAD_SIZE: usize = 8;
const PREPARE_HEADER_SIZE: usize = 12;

pub const fn ids_slot_size() -> u64 {
    packed_slot_size(IDS_PAYLOAD_SIZE)
}

pub const fn attach_slot_size() -> u64 {
    packed_slot_size(ATTACH_PAYLOAD_SIZE)
}

pub const fn resolve_slot_size() -> u64 {
    packed_slot_size(RESOLVE_PAYLOAD_SIZE)
}

/// The three client identities of a volume; exactly one live record.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct VolumeIds {
    pub main_uuid: Uuid,
    pub recycler_uuid: Uuid,
    pub trimmer_uuid: Uuid,
}

/// Durable image of a job: what it anchors, changes, and writes.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct PrepareJob {
    pub root_refs: Vec<PageId>,
    pub refcount_deltas: Vec<(PageId, i64)>,
    pub new_page_ids: Vec<PageId>,
}

impl PrepareJob {
    pub fn payload_size(&self) -> usize {
        PREPARE_HEADER_SIZE
            + 8 * self.root_refs.len()
            + 16 * self.refcount_deltas.len()
            + 8 * self.new_page_ids.len()
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum VolumeEvent {
    Ids(VolumeIds),
    Attach { client_uuid: Uuid, device_id: u64 },
    Detach { client_uuid: Uuid, device_id: u64 },
    Prepare(PrepareJob),
    Commit { prepare_slot: SlotOffset },
    Rollback { prepare_slot: SlotOffset },
    UserData(Vec<u8>),
}

impl WalEvent for VolumeEvent {
    fn tag(&self) -> u8 {
        match self {
            VolumeEvent::Ids(_) => TAG_VOLUME_IDS,
            VolumeEvent::Attach { .. } => TAG_VOLUME_ATTACH,
            VolumeEvent::Detach { .. } => TAG_VOLUME_DETACH,
            VolumeEvent::Prepare(_) => TAG_PREPARE_JOB,
            VolumeEvent::Commit { .. } => TAG_COMMIT_JOB,
            VolumeEvent::Rollback { .. } => TAG_ROLLBACK_JOB,
            VolumeEvent::UserData(_) => TAG_USER_DATA,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            VolumeEvent::Ids(_) => IDS_PAYLOAD_SIZE,
            VolumeEvent::Attach { .. } | VolumeEvent::Detach { .. } => ATTACH_PAYLOAD_SIZE,
            VolumeEvent::Prepare(job) => job.payload_size(),
            VolumeEvent::Commit { .. } | VolumeEvent::Rollback { .. } => RESOLVE_PAYLOAD_SIZE,
            VolumeEvent::UserData(bytes) => bytes.len(),
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            VolumeEvent::Ids(ids) => {
                out.extend_from_slice(ids.main_uuid.as_bytes());
                out.extend_from_slice(ids.recycler_uuid.as_bytes());
                out.extend_from_slice(ids.trimmer_uuid.as_bytes());
            }
            VolumeEvent::Attach {
                client_uuid,
                device_id,
            }
            | VolumeEvent::Detach {
                client_uuid,
                device_id,
            } => {
                out.extend_from_slice(client_uuid.as_bytes());
                out.extend_from_slice(&device_id.to_le_bytes());
            }
            VolumeEvent::Prepare(job) => {
                out.extend_from_slice(&(job.root_refs.len() as u32).to_le_bytes());
                out.extend_from_slice(&(job.refcount_deltas.len() as u32).to_le_bytes());
                out.extend_from_slice(&(job.new_page_ids.len() as u32).to_le_bytes());
                for page in &job.root_refs {
                    out.extend_from_slice(&page.0.to_le_bytes());
                }
                for (page, delta) in &job.refcount_deltas {
                    out.extend_from_slice(&page.0.to_le_bytes());
                    out.extend_from_slice(&delta.to_le_bytes());
                }
                for page in &job.new_page_ids {
                    out.extend_from_slice(&page.0.to_le_bytes());
                }
            }
            VolumeEvent::Commit { prepare_slot } | VolumeEvent::Rollback { prepare_slot } => {
                out.extend_from_slice(&prepare_slot.to_le_bytes());
            }
            VolumeEvent::UserData(bytes) => out.extend_from_slice(bytes),
        }
    }

    fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
        match tag {
            TAG_VOLUME_IDS => {
                if payload.len() != IDS_PAYLOAD_SIZE {
                    return Err(MareaError::Decode("volume ids payload size"));
                }
                Ok(VolumeEvent::Ids(VolumeIds {
                    main_uuid: Uuid::from_bytes(payload[0..16].try_into().unwrap()),
                    recycler_uuid: Uuid::from_bytes(payload[16..32].try_into().unwrap()),
                    trimmer_uuid: Uuid::from_bytes(payload[32..48].try_into().unwrap()),
                }))
            }
            TAG_VOLUME_ATTACH | TAG_VOLUME_DETACH => {
                if payload.len() != ATTACH_PAYLOAD_SIZE {
                    return Err(MareaError::Decode("volume attach payload size"));
                }
                let client_uuid = Uuid::from_bytes(payload[0..16].try_into().unwrap());
                let device_id = u64::from_le_bytes(payload[16..24].try_into().unwrap());
                Ok(if tag == TAG_VOLUME_ATTACH {
                    VolumeEvent::Attach {
                        client_uuid,
                        device_id,
                    }
                } else {
                    VolumeEvent::Detach {
                        client_uuid,
                        device_id,
                    }
                })
            }
            TAG_PREPARE_JOB => {
                if payload.len() < PREPARE_HEADER_SIZE {
                    return Err(MareaError::Decode("prepare job payload truncated"));
                }
                let roots = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
                let deltas = u32::from_le_bytes(payload[4..8].try_into().unwrap()) as usize;
                let new_pages = u32::from_le_bytes(payload[8..12].try_into().unwrap()) as usize;
                let expected = PREPARE_HEADER_SIZE + 8 * roots + 16 * deltas + 8 * new_pages;
                if payload.len() != expected {
                    return Err(MareaError::Decode("prepare job payload size"));
                }
                let mut at = PREPARE_HEADER_SIZE;
                let mut job = PrepareJob::default();
                for _ in 0..roots {
                    job.root_refs.push(PageId(u64::from_le_bytes(
                        payload[at..at + 8].try_into().unwrap(),
                    )));
                    at += 8;
                }
                for _ in 0..deltas {
                    let page = PageId(u64::from_le_bytes(payload[at..at + 8].try_into().unwrap()));
                    let delta = i64::from_le_bytes(payload[at + 8..at + 16].try_into().unwrap());
                    job.refcount_deltas.push((page, delta));
                    at += 16;
                }
                for _ in 0..new_pages {
                    job.new_page_ids.push(PageId(u64::from_le_bytes(
                        payload[at..at + 8].try_into().unwrap(),
                    )));
                    at += 8;
                }
                Ok(VolumeEvent::Prepare(job))
            }
            TAG_COMMIT_JOB | TAG_ROLLBACK_JOB => {
                if payload.len() != RESOLVE_PAYLOAD_SIZE {
                    return Err(MareaError::Decode("job resolver payload size"));
                }
                let prepare_slot = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                Ok(if tag == TAG_COMMIT_JOB {
                    VolumeEvent::Commit { prepare_slot }
                } else {
                    VolumeEvent::Rollback { prepare_slot }
                })
            }
            TAG_USER_DATA => Ok(VolumeEvent::UserData(payload.to_vec())),
            _ => Err(MareaError::Decode("unknown volume event tag")),
        }
    }
}

#![forbid(unsafe_code)]

pub mod cache;
pub mod log;
pub mod metrics;
pub mod recycler;
pub mod retry;
pub mod slot;
pub mod types;
pub mod volume;
pub mod watch;

pub use crate::cache::job::{JobCommitParams, NewPage, PageCacheJob};
pub use crate::cache::{CachePageDeleter, PageCache, PageDeleter};
pub use crate::log::memory::MemoryLogFactory;
pub use crate::log::{LogDevice, LogDeviceFactory, SlotUpperBoundAt};
pub use crate::metrics::MetricsRegistry;
pub use crate::recycler::options::PageRecyclerOptions;
pub use crate::recycler::{PageRecycler, RecyclerCore};
pub use crate::slot::lock::{SlotLockManager, SlotReadLock};
pub use crate::slot::sequencer::SlotSequencer;
pub use crate::slot::writer::{Grant, SlotWriter};
pub use crate::slot::{LogReadMode, SlotRange, SlotRangeSpec, WaitForResource};
pub use crate::types::{MareaError, PageId, Result, SlotOffset, MAX_PAGE_REF_DEPTH};
pub use crate::volume::recovery::PendingJobPolicy;
pub use crate::volume::{Volume, VolumeOptions, VolumeRecoverParams};

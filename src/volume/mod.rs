//! A durable, crash-consistent volume over a WAL and the shared page cache.
//!
//! Appends are two-phase: a durably flushed prepare slot, then the
//! page-cache job commit, then a commit slot. Recovery re-derives everything
//! from the log and resolves jobs the crash left half-done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::job::{self, JobCommitParams, PageCacheJob};
use crate::cache::{CachePageDeleter, PageCache, PageDeleter};
use crate::log::{LogDevice, LogDeviceFactory, SlotUpperBoundAt};
use crate::metrics::{MetricsRegistry, VolumeMetrics};
use crate::recycler::options::PageRecyclerOptions;
use crate::recycler::{PageRecycler, RecyclerCore};
use crate::slot::lock::{SlotLockManager, SlotReadLock};
use crate::slot::reader::TypedSlotReader;
use crate::slot::writer::{Grant, SlotWriter, WalEvent};
use crate::slot::{LogReadMode, SlotRange, SlotRangeSpec, WaitForResource};
use crate::types::{MareaError, Result, SlotOffset};

pub mod event;
pub mod reader;
pub mod recovery;
pub mod trimmer;

use event::{resolve_slot_size, PrepareJob, VolumeEvent, VolumeIds};
use reader::VolumeReader;
use recovery::{resolve_pending_jobs, PendingJobPolicy, VolumeRecoveryVisitor};
use trimmer::{TrimLockSlot, VolumeTrimmer};

pub use crate::slot::sequencer::SlotSequencer;

#[derive(Clone, Debug)]
pub struct VolumeOptions {
    pub name: String,
    /// Main client identity; generated when absent.
    pub uuid: Option<Uuid>,
    pub recycler: PageRecyclerOptions,
    pub pending_job_policy: PendingJobPolicy,
}

impl VolumeOptions {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: None,
            recycler: PageRecyclerOptions::default(),
            pending_job_policy: PendingJobPolicy::default(),
        }
    }
}

pub struct VolumeRecoverParams {
    pub options: VolumeOptions,
    pub cache: Arc<PageCache>,
    pub root_log_factory: Arc<dyn LogDeviceFactory>,
    pub recycler_log_factory: Arc<dyn LogDeviceFactory>,
    /// Shared lock manager; a private one is created when absent.
    pub trim_control: Option<Arc<SlotLockManager>>,
    pub metrics: Arc<MetricsRegistry>,
}

pub struct Volume {
    name: String,
    volume_uuid: Uuid,
    cache: Arc<PageCache>,
    trim_control: Arc<SlotLockManager>,
    deleter: Arc<CachePageDeleter>,
    root_log: Arc<dyn LogDevice>,
    slot_writer: SlotWriter,
    trim_lock: Arc<TrimLockSlot>,
    recycler: PageRecycler,
    trimmer: Arc<VolumeTrimmer>,
    trimmer_task: Mutex<Option<JoinHandle<()>>>,
    halted: AtomicBool,
    metrics: Arc<VolumeMetrics>,
    registry: Arc<MetricsRegistry>,
}

impl Volume {
    /// Recovers a volume from its two logs and starts its background tasks.
    ///
    /// `slot_visitor` observes every user payload slot found in the log.
    pub fn recover(
        params: VolumeRecoverParams,
        slot_visitor: &mut dyn FnMut(SlotRange, &[u8]) -> Result<()>,
    ) -> Result<Volume> {
        let options = params.options;
        let cache = params.cache;
        let trim_control = params
            .trim_control
            .unwrap_or_else(|| Arc::new(SlotLockManager::new()));
        let registry = params.metrics;

        let deleter = Arc::new(CachePageDeleter::new(Arc::clone(&cache)));
        let deleter_trait: Arc<dyn PageDeleter> = Arc::clone(&deleter) as Arc<dyn PageDeleter>;
        let recycler = PageRecycler::recover(
            &format!("{}_recycler", options.name),
            options.recycler.clone(),
            deleter_trait,
            params.recycler_log_factory.as_ref(),
            Arc::clone(&registry),
        )?;

        let mut visitor = VolumeRecoveryVisitor::new();
        let root_log = params.root_log_factory.open_log_device(&mut |log_reader| {
            let mut slots = TypedSlotReader::<_, VolumeEvent>::new(log_reader);
            let recovered =
                slots.visit_all(|range, event| visitor.visit(range, event, slot_visitor))?;
            debug!(name = %options.name, slots = recovered, "volume.recover.scanned");
            Ok(slots.slot_offset())
        })?;

        let slot_writer = SlotWriter::new(Arc::clone(&root_log));
        let metrics = Arc::new(VolumeMetrics::default());

        // Put the root log in a clean state: identity recorded, devices
        // attached, pending jobs resolved.
        let ids = {
            let grant = slot_writer.reserve(slot_writer.pool_size(), WaitForResource::NoWait)?;

            let ids = match visitor.ids {
                Some((_, ids)) => ids,
                None => {
                    let ids = VolumeIds {
                        main_uuid: options.uuid.unwrap_or_else(Uuid::new_v4),
                        recycler_uuid: recycler.uuid(),
                        trimmer_uuid: Uuid::new_v4(),
                    };
                    let range = slot_writer.append(&grant, &VolumeEvent::Ids(ids))?;
                    slot_writer.sync(
                        LogReadMode::Durable,
                        SlotUpperBoundAt {
                            offset: range.upper,
                        },
                    )?;
                    info!(name = %options.name, main_uuid = %ids.main_uuid, "volume.recover.ids_created");
                    ids
                }
            };

            for client_uuid in [ids.main_uuid, ids.recycler_uuid, ids.trimmer_uuid] {
                for arena in cache.all_arenas() {
                    let device_id = arena.device().get_id();
                    if visitor.attachments.contains(&(client_uuid, device_id)) {
                        continue;
                    }
                    let sync_slot = arena.allocator().attach_user(client_uuid, 0)?;
                    arena.allocator().sync(sync_slot)?;
                    let range = slot_writer.append(
                        &grant,
                        &VolumeEvent::Attach {
                            client_uuid,
                            device_id,
                        },
                    )?;
                    slot_writer.sync(
                        LogReadMode::Durable,
                        SlotUpperBoundAt {
                            offset: range.upper,
                        },
                    )?;
                    debug!(%client_uuid, device_id, "volume.recover.attached");
                }
            }

            resolve_pending_jobs(
                &visitor.pending_jobs,
                &cache,
                &recycler,
                ids.main_uuid,
                options.pending_job_policy,
                &slot_writer,
                &grant,
                &metrics,
            )?;

            ids
        };

        let trim_lock = Arc::new(TrimLockSlot::new(
            trim_control.lock_slots(root_log.slot_range(LogReadMode::Durable), "volume_trim")?,
        ));
        metrics.register(&registry, &options.name);

        let trimmer = Arc::new(VolumeTrimmer::new(
            Arc::clone(&cache),
            Arc::clone(&trim_control),
            recycler.share_core(),
            ids.trimmer_uuid,
            Arc::clone(&root_log),
            slot_writer.clone(),
            Arc::clone(&metrics),
        ));

        let volume = Volume {
            name: options.name,
            volume_uuid: ids.main_uuid,
            cache,
            trim_control,
            deleter,
            root_log,
            slot_writer,
            trim_lock,
            recycler,
            trimmer,
            trimmer_task: Mutex::new(None),
            halted: AtomicBool::new(false),
            metrics,
            registry,
        };
        volume.start();
        info!(name = %volume.name, volume_uuid = %volume.volume_uuid, "volume.recovered");
        Ok(volume)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume_uuid(&self) -> Uuid {
        self.volume_uuid
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn recycler(&self) -> &PageRecycler {
        &self.recycler
    }

    pub fn page_deleter(&self) -> &CachePageDeleter {
        &self.deleter
    }

    pub fn metrics(&self) -> &VolumeMetrics {
        &self.metrics
    }

    pub fn root_log_slot_range(&self, mode: LogReadMode) -> SlotRange {
        self.root_log.slot_range(mode)
    }

    /// Reserves WAL space for appends.
    pub fn reserve(&self, size: u64, wait: WaitForResource) -> Result<Grant> {
        self.slot_writer.reserve(size, wait)
    }

    /// Grant bytes one [`Volume::append`] of `job` needs: the prepare slot
    /// plus its resolver.
    pub fn grant_size_for_job(&self, job: &PageCacheJob) -> u64 {
        let prepare = PrepareJob {
            root_refs: job.root_refs.clone(),
            refcount_deltas: job.refcount_deltas.clone(),
            new_page_ids: job.new_page_ids(),
        };
        VolumeEvent::Prepare(prepare).packed_size() + resolve_slot_size()
    }

    /// Appends an opaque user payload slot.
    pub fn append_user_data(&self, payload: &[u8], grant: &Grant) -> Result<SlotRange> {
        self.slot_writer
            .append(grant, &VolumeEvent::UserData(payload.to_vec()))
    }

    /// Two-phase job append.
    ///
    /// With a sequencer, this append first awaits its predecessor's prepare
    /// slot; the sequencer is always resolved (slot or error) before this
    /// returns, so failures propagate to every queued successor.
    pub fn append(
        &self,
        job: &PageCacheJob,
        grant: &Grant,
        sequencer: Option<&SlotSequencer>,
    ) -> Result<SlotRange> {
        // Phase 0: wait for the previous append in the sequence.
        if let Some(seq) = sequencer {
            match seq.await_prev() {
                Ok(None) => {}
                Ok(Some(prev_slot)) => {
                    // Speculative is enough here: the durable sync of our own
                    // prepare below also flushes every earlier slot.
                    if let Err(err) = self.slot_writer.sync(
                        LogReadMode::Speculative,
                        SlotUpperBoundAt {
                            offset: prev_slot.upper,
                        },
                    ) {
                        seq.set_error(err.clone());
                        return Err(err);
                    }
                }
                Err(err) => {
                    seq.set_error(err.clone());
                    return Err(err);
                }
            }
        }

        // Phase 1: durably flushed prepare slot.
        let prepare = PrepareJob {
            root_refs: job.root_refs.clone(),
            refcount_deltas: job.refcount_deltas.clone(),
            new_page_ids: job.new_page_ids(),
        };
        let prepare_slot = match self
            .slot_writer
            .append(grant, &VolumeEvent::Prepare(prepare))
        {
            Ok(range) => range,
            Err(err) => {
                if let Some(seq) = sequencer {
                    if !seq.set_error(err.clone()) {
                        return Err(MareaError::Corruption("sequencer slot set twice"));
                    }
                }
                return Err(err);
            }
        };
        if let Some(seq) = sequencer {
            if !seq.set_current(prepare_slot) {
                return Err(MareaError::Corruption("sequencer slot set twice"));
            }
        }
        self.metrics.prepare_count.add(1);
        self.slot_writer.sync(
            LogReadMode::Durable,
            SlotUpperBoundAt {
                offset: prepare_slot.upper,
            },
        )?;

        // Phase 2a: commit the page-cache job.
        let params = JobCommitParams {
            caller_uuid: self.volume_uuid,
            caller_slot: prepare_slot.lower,
            recycler: self.recycler_core(),
            recycle_grant: None,
            recycle_depth: 0,
        };
        match job::commit(&self.cache, job, &params) {
            Ok(()) => {}
            Err(MareaError::JobNotCommittable(reason)) => {
                warn!(
                    reason,
                    prepare_slot = prepare_slot.lower,
                    "volume.append.rollback"
                );
                let rollback = self.slot_writer.append(
                    grant,
                    &VolumeEvent::Rollback {
                        prepare_slot: prepare_slot.lower,
                    },
                )?;
                self.slot_writer.sync(
                    LogReadMode::Durable,
                    SlotUpperBoundAt {
                        offset: rollback.upper,
                    },
                )?;
                self.metrics.rollback_count.add(1);
                return Err(MareaError::JobNotCommittable(reason));
            }
            Err(err) => return Err(err),
        }

        // Phase 2b: commit slot.
        let commit_slot = self.slot_writer.append(
            grant,
            &VolumeEvent::Commit {
                prepare_slot: prepare_slot.lower,
            },
        )?;
        self.metrics.commit_count.add(1);
        Ok(SlotRange::new(prepare_slot.lower, commit_slot.upper))
    }

    /// Flushes the log in `mode` up to `target` and reports the range.
    pub fn sync(&self, mode: LogReadMode, target: SlotUpperBoundAt) -> Result<SlotRange> {
        self.root_log.sync(mode, target)?;
        Ok(self.root_log.slot_range(mode))
    }

    /// Locks `spec` (clamped to the visible log) without building a reader.
    pub fn lock_slots(&self, spec: SlotRangeSpec, mode: LogReadMode) -> Result<SlotReadLock> {
        let base = self.root_log.slot_range(mode);
        let range = SlotRange::new(
            spec.lower.unwrap_or(base.lower),
            spec.upper.unwrap_or(base.upper),
        );
        self.trim_control.lock_slots(range, "volume_lock_slots")
    }

    /// Opens a locked reader over `spec`, clamped below by the trim lock.
    pub fn reader(&self, spec: SlotRangeSpec, mode: LogReadMode) -> Result<VolumeReader> {
        let mut base = self.root_log.slot_range(mode);
        if let Some(trim_lower) = self.trim_lock.lower_bound() {
            base.lower = crate::slot::slot_max(base.lower, trim_lower);
        }
        let range = SlotRange::new(
            spec.lower.unwrap_or(base.lower),
            spec.upper.unwrap_or(base.upper),
        );
        let read_lock = self.trim_control.lock_slots(range, "volume_read")?;
        Ok(VolumeReader::new(
            read_lock,
            mode,
            self.root_log.new_reader(Some(range.lower), mode),
        ))
    }

    /// Raises the volume's trim lower bound; the trimmer task trims the log
    /// once no reader or unresolved job sits below the new bound.
    pub fn trim(&self, slot_lower_bound: SlotOffset) -> Result<()> {
        self.trim_lock
            .advance(&self.trim_control, slot_lower_bound, "volume_trim")
    }

    /// Launches the trimmer and recycler tasks; idempotent.
    pub fn start(&self) {
        self.recycler.start();
        let mut task = self.trimmer_task.lock();
        if task.is_none() {
            let trimmer = Arc::clone(&self.trimmer);
            *task = Some(thread::spawn(move || match trimmer.run() {
                Ok(()) => debug!("volume.trimmer.exit"),
                Err(err) => {
                    if trimmer.stop_requested() {
                        debug!(error = %err, "volume.trimmer.exit");
                    } else {
                        warn!(error = %err, "volume.trimmer.exit_unexpected");
                    }
                }
            }));
        }
    }

    /// Closes the log, revokes grants, and asks the tasks to stop.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            debug!(name = %self.name, "volume.halt");
            self.slot_writer.halt();
            self.trimmer.halt();
            self.trim_lock.release();
            self.trim_control.halt();
            if let Err(err) = self.root_log.close() {
                debug!(error = %err, "volume.halt.close_failed");
            }
            self.recycler.halt();
        }
    }

    /// Waits for the trimmer and recycler tasks to exit.
    pub fn join(&self) {
        if let Some(handle) = self.trimmer_task.lock().take() {
            let _ = handle.join();
        }
        self.recycler.join();
    }

    fn recycler_core(&self) -> &RecyclerCore {
        &self.recycler
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if let Err(err) = self.root_log.flush() {
            debug!(error = %err, "volume.drop.flush_failed");
        }
        self.halt();
        self.join();
        self.metrics.unregister(&self.registry, &self.name);
    }
}

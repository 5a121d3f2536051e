//! The volume trimmer task: drains the root WAL behind readers and
//! unresolved jobs, releasing log-anchored page references as it goes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::job::merge_deltas;
use crate::cache::PageCache;
use crate::log::{LogDevice, SlotUpperBoundAt};
use crate::metrics::VolumeMetrics;
use crate::recycler::RecyclerCore;
use crate::slot::lock::SlotLockManager;
use crate::slot::reader::TypedSlotReader;
use crate::slot::writer::{SlotWriter, WalEvent};
use crate::slot::{clamp_min_slot, slot_lt, slot_min, LogReadMode, SlotRange, WaitForResource};
use crate::types::{MareaError, Result, SlotOffset};
use crate::volume::event::{PrepareJob, VolumeEvent, VolumeIds};

const TRIMMER_POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ResolvedJob {
    prepare_lower: SlotOffset,
    resolver_upper: SlotOffset,
    committed: bool,
    job: PrepareJob,
}

/// Effects observed while scanning a candidate trim region.
struct ScanEffects {
    open_jobs: Vec<SlotOffset>,
    resolved_jobs: Vec<ResolvedJob>,
    latest_ids: Option<(SlotRange, VolumeIds)>,
    latest_attachments: Vec<((Uuid, u64), SlotRange)>,
}

pub struct VolumeTrimmer {
    cache: Arc<PageCache>,
    trim_control: Arc<SlotLockManager>,
    recycler: Arc<RecyclerCore>,
    trimmer_uuid: Uuid,
    root_log: Arc<dyn LogDevice>,
    slot_writer: SlotWriter,
    metrics: Arc<VolumeMetrics>,
    stop_requested: AtomicBool,
}

impl VolumeTrimmer {
    pub(crate) fn new(
        cache: Arc<PageCache>,
        trim_control: Arc<SlotLockManager>,
        recycler: Arc<RecyclerCore>,
        trimmer_uuid: Uuid,
        root_log: Arc<dyn LogDevice>,
        slot_writer: SlotWriter,
        metrics: Arc<VolumeMetrics>,
    ) -> Self {
        Self {
            cache,
            trim_control,
            recycler,
            trimmer_uuid,
            root_log,
            slot_writer,
            metrics,
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn halt(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub(crate) fn run(&self) -> Result<()> {
        let mut trim_point = self.root_log.slot_range(LogReadMode::Durable).lower;
        loop {
            if self.stop_requested() {
                return Ok(());
            }

            // The lock manager's minimum locked lower bound is the ceiling
            // for trimming; no live lock means the volume released its trim
            // lock and is shutting down.
            let ceiling = match self.trim_control.lower_bound() {
                None => return Ok(()),
                Some(lower) => lower,
            };
            if !slot_lt(trim_point, ceiling) {
                match self.trim_control.await_lower_bound_above(trim_point) {
                    Ok(_) => continue,
                    Err(MareaError::Shutdown(_)) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }

            let durable_upper = self.root_log.slot_range(LogReadMode::Durable).upper;
            let target = slot_min(ceiling, durable_upper);
            let advanced = if slot_lt(trim_point, target) {
                self.advance_trim(trim_point, target)?
            } else {
                trim_point
            };

            if slot_lt(trim_point, advanced) {
                self.slot_writer.trim(advanced)?;
                self.metrics.trim_count.add(1);
                debug!(from = trim_point, to = advanced, "volume.trimmer.advanced");
                trim_point = advanced;
            } else {
                // Blocked by an unresolved job; resolution appears as new
                // durable slots, so poll.
                thread::sleep(TRIMMER_POLL_INTERVAL);
            }
        }
    }

    /// Scans `[from, durable_upper)`, clamps `target` so no job is split by
    /// the trim point, releases the root refs of jobs wholly below the
    /// clamp, and re-appends identity/attachment records that would
    /// otherwise be lost. Returns the new trim lower bound.
    fn advance_trim(&self, from: SlotOffset, target: SlotOffset) -> Result<SlotOffset> {
        let effects = self.scan(from)?;

        let mut clamp = target;
        for &lower in &effects.open_jobs {
            if slot_lt(lower, clamp) {
                clamp = lower;
            }
        }
        // A resolved job straddling the clamp must stay intact; shrinking
        // the clamp can expose further straddlers, so iterate to fixpoint.
        loop {
            let mut changed = false;
            for job in &effects.resolved_jobs {
                if slot_lt(job.prepare_lower, clamp) && slot_lt(clamp, job.resolver_upper) {
                    clamp = job.prepare_lower;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        if !slot_lt(from, clamp) {
            return Ok(from);
        }

        self.release_trimmed_jobs(&effects.resolved_jobs, clamp)?;

        if !self.preserve_metadata(&effects, clamp)? {
            return Ok(from);
        }

        Ok(clamp)
    }

    fn scan(&self, from: SlotOffset) -> Result<ScanEffects> {
        let mut slots = TypedSlotReader::<_, VolumeEvent>::new(
            self.root_log.new_reader(Some(from), LogReadMode::Durable),
        );
        let mut open: Vec<(SlotOffset, PrepareJob)> = Vec::new();
        let mut effects = ScanEffects {
            open_jobs: Vec::new(),
            resolved_jobs: Vec::new(),
            latest_ids: None,
            latest_attachments: Vec::new(),
        };

        fn resolve(
            open: &mut Vec<(SlotOffset, PrepareJob)>,
            effects: &mut ScanEffects,
            prepare_slot: SlotOffset,
            resolver_upper: SlotOffset,
            committed: bool,
        ) -> Result<()> {
            let index = open
                .iter()
                .position(|(lower, _)| *lower == prepare_slot)
                .ok_or(MareaError::Corruption(
                    "trim scan saw a resolver without its prepare",
                ))?;
            let (prepare_lower, job) = open.remove(index);
            effects.resolved_jobs.push(ResolvedJob {
                prepare_lower,
                resolver_upper,
                committed,
                job,
            });
            Ok(())
        }

        while let Some((range, event)) = slots.next_slot()? {
            match event {
                VolumeEvent::Prepare(job) => open.push((range.lower, job)),
                VolumeEvent::Commit { prepare_slot } => {
                    resolve(&mut open, &mut effects, prepare_slot, range.upper, true)?;
                }
                VolumeEvent::Rollback { prepare_slot } => {
                    resolve(&mut open, &mut effects, prepare_slot, range.upper, false)?;
                }
                VolumeEvent::Ids(ids) => effects.latest_ids = Some((range, ids)),
                VolumeEvent::Attach {
                    client_uuid,
                    device_id,
                } => {
                    let key = (client_uuid, device_id);
                    effects.latest_attachments.retain(|(k, _)| *k != key);
                    effects.latest_attachments.push((key, range));
                }
                VolumeEvent::Detach {
                    client_uuid,
                    device_id,
                } => {
                    let key = (client_uuid, device_id);
                    effects.latest_attachments.retain(|(k, _)| *k != key);
                }
                VolumeEvent::UserData(_) => {}
            }
        }

        effects.open_jobs = open.into_iter().map(|(lower, _)| lower).collect();
        Ok(effects)
    }

    /// Releases the root refs of committed jobs that fall wholly below
    /// `clamp`, exactly once per job, and waits for the recycler to make the
    /// resulting drops durable before any trimming happens.
    fn release_trimmed_jobs(&self, resolved: &[ResolvedJob], clamp: SlotOffset) -> Result<()> {
        let mut recycler_sync = None;
        for job in resolved {
            if !job.committed || slot_lt(clamp, job.resolver_upper) || job.job.root_refs.is_empty()
            {
                continue;
            }
            let deltas = merge_deltas(job.job.root_refs.iter().map(|&page| (page, -1i64)));
            let dead =
                self.cache
                    .apply_refcount_deltas(self.trimmer_uuid, job.prepare_lower, &deltas)?;
            if !dead.is_empty() {
                debug!(
                    prepare_slot = job.prepare_lower,
                    released = dead.len(),
                    "volume.trimmer.release"
                );
                let upper = self.recycler.recycle_pages(&dead, None, 0)?;
                clamp_min_slot(&mut recycler_sync, upper);
            }
        }
        if recycler_sync.is_some() {
            self.recycler.await_flush(recycler_sync)?;
        }
        Ok(())
    }

    /// Re-appends the identity and live attachment records whose only copy
    /// sits below `clamp`. False when no log space is available yet.
    fn preserve_metadata(&self, effects: &ScanEffects, clamp: SlotOffset) -> Result<bool> {
        let mut to_reappend: Vec<VolumeEvent> = Vec::new();
        if let Some((range, ids)) = &effects.latest_ids {
            if slot_lt(range.lower, clamp) {
                to_reappend.push(VolumeEvent::Ids(*ids));
            }
        }
        for ((client_uuid, device_id), range) in &effects.latest_attachments {
            if slot_lt(range.lower, clamp) {
                to_reappend.push(VolumeEvent::Attach {
                    client_uuid: *client_uuid,
                    device_id: *device_id,
                });
            }
        }
        if to_reappend.is_empty() {
            return Ok(true);
        }

        let needed: u64 = to_reappend.iter().map(|event| event.packed_size()).sum();
        let grant = match self.slot_writer.reserve(needed, WaitForResource::NoWait) {
            Ok(grant) => grant,
            Err(err) => {
                warn!(needed, error = %err, "volume.trimmer.metadata_reappend_blocked");
                return Ok(false);
            }
        };
        let mut sync_upper = None;
        for event in &to_reappend {
            let range = self.slot_writer.append(&grant, event)?;
            clamp_min_slot(&mut sync_upper, range.upper);
        }
        if let Some(upper) = sync_upper {
            self.slot_writer
                .sync(LogReadMode::Durable, SlotUpperBoundAt { offset: upper })?;
        }
        debug!(
            records = to_reappend.len(),
            "volume.trimmer.metadata_reappended"
        );
        Ok(true)
    }
}

/// Guards the trim lock slot of a volume: updates go through
/// [`SlotLockManager::update_lock`], never in-place mutation.
pub(crate) struct TrimLockSlot {
    lock: Mutex<Option<crate::slot::lock::SlotReadLock>>,
}

impl TrimLockSlot {
    pub(crate) fn new(lock: crate::slot::lock::SlotReadLock) -> Self {
        Self {
            lock: Mutex::new(Some(lock)),
        }
    }

    pub(crate) fn lower_bound(&self) -> Option<SlotOffset> {
        self.lock
            .lock()
            .as_ref()
            .map(|lock| lock.slot_range().lower)
    }

    pub(crate) fn advance(
        &self,
        manager: &SlotLockManager,
        new_lower: SlotOffset,
        tag: &'static str,
    ) -> Result<()> {
        let mut guard = self.lock.lock();
        let held = guard
            .take()
            .ok_or(MareaError::Shutdown("volume trim lock released"))?;
        let mut range = held.slot_range();
        range.lower = crate::slot::slot_max(range.lower, new_lower);
        let updated = manager.update_lock(held, range, tag)?;
        *guard = Some(updated);
        Ok(())
    }

    pub(crate) fn release(&self) {
        *self.lock.lock() = None;
    }
}

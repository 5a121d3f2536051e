//! The page recycler: a separately-logged, depth-bounded queue that turns
//! "refcount reached zero" into "page physically dropped".
//!
//! The recycler WAL is split into two grant pools: the recycle task's
//! reserved pool (prepares, commits, info refreshes) and the insert pool for
//! external enqueues. The task pool is always topped up first so trimming
//! can make progress even when inserters have exhausted the log.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::PageDeleter;
use crate::log::{LogDevice, LogDeviceFactory, SlotUpperBoundAt};
use crate::metrics::{MetricsRegistry, RecyclerMetrics};
use crate::retry;
use crate::slot::reader::TypedSlotReader;
use crate::slot::writer::{Grant, SlotWriter, WalEvent};
use crate::slot::{clamp_min_slot, slot_lt, slot_max, LogReadMode, SlotRange, WaitForResource};
use crate::types::{MareaError, PageId, Result, SlotOffset, MAX_PAGE_REF_DEPTH};
use crate::watch::Watch;

pub mod event;
pub mod options;
pub mod recovery;
pub mod state;

use event::{PackedRecyclerInfo, PageToRecycle, RecycleEvent};
use options::PageRecyclerOptions;
use recovery::RecyclerRecoveryVisitor;
use state::RecyclerState;

/// A set of same-depth pages being dropped together. The batch slot is the
/// exactly-once key for the physical drop.
#[derive(Clone, Debug)]
pub struct Batch {
    pub to_recycle: Vec<PageToRecycle>,
    pub slot_offset: SlotOffset,
}

/// Shared body of a recycler; the recycle task and the page deleter work
/// against this directly.
pub struct RecyclerCore {
    name: String,
    uuid: Uuid,
    options: PageRecyclerOptions,
    deleter: Arc<dyn PageDeleter>,
    wal_device: Arc<dyn LogDevice>,
    slot_writer: SlotWriter,
    recycle_task_grant: Grant,
    insert_grant_pool: Grant,
    pending_count: Watch<u64>,
    latest_info_refresh_slot: AtomicU64,
    state: Mutex<RecyclerState>,
    prepared_batch: Mutex<Option<Batch>>,
    latest_batch_upper: Mutex<Option<SlotOffset>>,
    stop_requested: AtomicBool,
    task_failure: Mutex<Option<MareaError>>,
    metrics: RecyclerMetrics,
}

/// Owning handle: recovery construction plus task lifecycle.
pub struct PageRecycler {
    core: Arc<RecyclerCore>,
    registry: Arc<MetricsRegistry>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::ops::Deref for PageRecycler {
    type Target = RecyclerCore;

    fn deref(&self) -> &RecyclerCore {
        &self.core
    }
}

/// Appends a fresh info slot and flushes it durably.
fn refresh_info_slot(
    slot_writer: &SlotWriter,
    uuid: Uuid,
    options: &PageRecyclerOptions,
    grant: Option<&Grant>,
) -> Result<SlotRange> {
    let event = RecycleEvent::Info(PackedRecyclerInfo::from_options(uuid, options));
    let range = match grant {
        Some(grant) => slot_writer.append(grant, &event)?,
        None => {
            let local = slot_writer.reserve(event.packed_size(), WaitForResource::NoWait)?;
            slot_writer.append(&local, &event)?
        }
    };
    slot_writer.sync(
        LogReadMode::Durable,
        SlotUpperBoundAt {
            offset: range.upper,
        },
    )?;
    Ok(range)
}

impl PageRecycler {
    /// Minimum WAL capacity for `options`; `max_buffered_page_count` bounds
    /// how many enqueued-but-unprocessed pages the log must absorb.
    pub fn calculate_log_size(
        options: &PageRecyclerOptions,
        max_buffered_page_count: Option<u64>,
    ) -> u64 {
        options.calculate_log_size(max_buffered_page_count)
    }

    /// Recovers a recycler from its WAL and leaves it ready to [`start`].
    ///
    /// [`start`]: PageRecycler::start
    pub fn recover(
        name: &str,
        default_options: PageRecyclerOptions,
        deleter: Arc<dyn PageDeleter>,
        log_factory: &dyn LogDeviceFactory,
        registry: Arc<MetricsRegistry>,
    ) -> Result<PageRecycler> {
        let mut visitor = RecyclerRecoveryVisitor::new(default_options);
        let wal_device = log_factory.open_log_device(&mut |reader| {
            let mut slots = TypedSlotReader::<_, RecycleEvent>::new(reader);
            let recovered = slots.visit_all(|range, event| visitor.visit(range, event))?;
            debug!(name, slots = recovered, "recycler.recover.scanned");
            Ok(slots.slot_offset())
        })?;

        let slot_writer = SlotWriter::new(Arc::clone(&wal_device));
        let uuid = visitor.recycler_uuid().unwrap_or_else(Uuid::new_v4);
        let options = visitor.options().clone();

        if Self::calculate_log_size(&options, None) > slot_writer.log_capacity()
            || slot_writer.log_capacity()
                < options.recycle_task_target() + options.insert_grant_size()
        {
            return Err(MareaError::Invalid(
                "recycler WAL is too small for the given configuration",
            ));
        }

        let latest_info = match visitor.latest_info_refresh_slot() {
            Some(slot)
                if !options.info_needs_refresh(
                    slot.lower,
                    wal_device.slot_range(LogReadMode::Speculative).upper,
                ) =>
            {
                slot
            }
            _ => refresh_info_slot(&slot_writer, uuid, &options, None)?,
        };

        let recovered_batch = visitor.consume_latest_batch()?;
        let mut state = RecyclerState::new();
        state.bulk_load(&visitor.take_recovered_pages());
        let pending = state.pending_count();

        let recycle_task_grant = slot_writer.reserve(0, WaitForResource::NoWait)?;
        let insert_grant_pool = slot_writer.reserve(0, WaitForResource::NoWait)?;

        let metrics = RecyclerMetrics::default();
        metrics.register(&registry, name);

        info!(
            name,
            %uuid,
            pending,
            recovered_batch = recovered_batch.is_some(),
            "recycler.recovered"
        );

        let core = Arc::new(RecyclerCore {
            name: name.to_owned(),
            uuid,
            options,
            deleter,
            wal_device,
            slot_writer,
            recycle_task_grant,
            insert_grant_pool,
            pending_count: Watch::new(pending),
            latest_info_refresh_slot: AtomicU64::new(latest_info.lower),
            state: Mutex::new(state),
            prepared_batch: Mutex::new(recovered_batch),
            latest_batch_upper: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            task_failure: Mutex::new(None),
            metrics,
        });

        // Inserters may show up before start() (the volume resolves pending
        // jobs during its own recovery), so fund the pools now.
        core.refresh_grants();

        Ok(PageRecycler {
            core,
            registry,
            task: Mutex::new(None),
        })
    }

    /// Launches the recycle task; idempotent.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_none() {
            self.core.refresh_grants();
            let core = Arc::clone(&self.core);
            *task = Some(thread::spawn(move || recycle_task_main(core)));
        }
    }

    pub fn join(&self) {
        if let Some(handle) = self.task.lock().take() {
            let _ = handle.join();
        }
    }

    /// Error the recycle task exited with, if it failed.
    pub fn task_failure(&self) -> Option<MareaError> {
        self.core.task_failure.lock().clone()
    }

    pub(crate) fn share_core(&self) -> Arc<RecyclerCore> {
        Arc::clone(&self.core)
    }
}

impl Drop for PageRecycler {
    fn drop(&mut self) {
        self.halt();
        self.join();
        self.core
            .metrics
            .unregister(&self.registry, &self.core.name);
    }
}

impl RecyclerCore {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn options(&self) -> &PageRecyclerOptions {
        &self.options
    }

    pub fn metrics(&self) -> &RecyclerMetrics {
        &self.metrics
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn slot_upper_bound(&self, mode: LogReadMode) -> SlotOffset {
        self.wal_device.slot_range(mode).upper
    }

    /// Revokes grants, closes the WAL, and wakes every blocked caller.
    pub fn halt(&self) {
        if !self.stop_requested.swap(true, Ordering::AcqRel) {
            debug!(name = %self.name, "recycler.halt");
            self.pending_count.close();
            self.recycle_task_grant.revoke();
            self.insert_grant_pool.revoke();
            self.slot_writer.halt();
            if let Err(err) = self.wal_device.close() {
                debug!(error = %err, "recycler.halt.close_failed");
            }
        }
    }

    /// Enqueues pages for recycling and returns the highest appended upper
    /// bound (a sync point).
    ///
    /// Without a grant the caller must be at depth zero: each page spends
    /// `insert_grant_size` from the shared insert pool, blocking until the
    /// recycle task frees space. With a grant (the recursive path used while
    /// physically dropping pages) the caller's reservation is reused and
    /// `depth` must stay below the recursion cap.
    pub fn recycle_pages(
        &self,
        page_ids: &[PageId],
        grant: Option<&Grant>,
        depth: u32,
    ) -> Result<SlotOffset> {
        if page_ids.is_empty() {
            return Ok(self.slot_upper_bound(LogReadMode::Durable));
        }
        debug!(name = %self.name, pages = page_ids.len(), depth, "recycler.recycle_pages");

        let mut sync_point = None;
        match grant {
            None => {
                if depth != 0 {
                    return Err(MareaError::Invalid(
                        "recycle_pages without a grant requires depth zero",
                    ));
                }
                for &page_id in page_ids {
                    let local = self
                        .insert_grant_pool
                        .spend(self.options.insert_grant_size(), WaitForResource::Wait)
                        .map_err(|err| {
                            if !self.stop_requested() {
                                warn!(
                                    name = %self.name,
                                    %page_id,
                                    "recycler.insert.no_log_space"
                                );
                            }
                            err
                        })?;
                    let mut state = self.state.lock();
                    let appended = self.insert_to_log(&local, page_id, depth, &mut state)?;
                    clamp_min_slot(&mut sync_point, appended);
                }
            }
            Some(grant) => {
                if depth >= MAX_PAGE_REF_DEPTH {
                    return Err(MareaError::RecursionDepthExceeded(depth));
                }
                let mut state = self.state.lock();
                for &page_id in page_ids {
                    let appended = self.insert_to_log(grant, page_id, depth, &mut state)?;
                    clamp_min_slot(&mut sync_point, appended);
                }
            }
        }

        sync_point.ok_or(MareaError::Corruption(
            "recycle_pages produced no sync point",
        ))
    }

    /// Depth-zero convenience used by external callers.
    pub fn recycle_page(&self, page_id: PageId) -> Result<SlotOffset> {
        self.recycle_pages(&[page_id], None, 0)
    }

    /// Blocks until everything at or below `min_upper_bound` is durable.
    pub fn await_flush(&self, min_upper_bound: Option<SlotOffset>) -> Result<()> {
        match min_upper_bound {
            None => Ok(()),
            Some(offset) => self
                .wal_device
                .sync(LogReadMode::Durable, SlotUpperBoundAt { offset }),
        }
    }

    /// Idempotent insert: updates the state machine and logs only entries it
    /// accepted, returning the latest appended upper bound (or the current
    /// offset when the page was already pending).
    fn insert_to_log(
        &self,
        grant: &Grant,
        page_id: PageId,
        depth: u32,
        state: &mut RecyclerState,
    ) -> Result<SlotOffset> {
        let current_slot = self.slot_writer.slot_offset();
        let to_append = state.insert(PageToRecycle {
            page_id,
            slot_offset: current_slot,
            depth,
        })?;
        if to_append.is_empty() {
            return Ok(current_slot);
        }

        let mut last_slot = current_slot;
        for item in &to_append {
            let range = self
                .slot_writer
                .append(grant, &RecycleEvent::PageToRecycle(*item))?;
            last_slot = slot_max(last_slot, range.upper);
        }
        self.metrics.insert_count.add(1);
        self.pending_count
            .modify(|count| count + to_append.len() as u64);
        Ok(last_slot)
    }

    /// Tops up the WAL grants: the recycle task pool first (it drains the
    /// log, so it must never starve), then the insert pool.
    fn refresh_grants(&self) {
        let target = self.options.recycle_task_target();
        let task_size = self.recycle_task_grant.size();
        if task_size < target {
            let delta = self.slot_writer.pool_size().min(target - task_size);
            if delta > 0 {
                match self.slot_writer.reserve(delta, WaitForResource::NoWait) {
                    Ok(topup) => {
                        let _ = self.recycle_task_grant.subsume(topup);
                    }
                    Err(err) => {
                        if !self.stop_requested() {
                            debug!(error = %err, "recycler.refresh_grants.task_pool");
                        }
                        return;
                    }
                }
            }
        }

        let available = self.slot_writer.pool_size();
        if available > 0 && !self.stop_requested() {
            if let Ok(rest) = self.slot_writer.reserve(available, WaitForResource::NoWait) {
                let _ = self.insert_grant_pool.subsume(rest);
            }
        }
    }

    /// Logs one `BatchPrepare` per member, tagged with the batch slot, and
    /// flushes them durably.
    fn prepare_batch(&self, to_recycle: Vec<PageToRecycle>) -> Result<Batch> {
        let batch_slot = self.slot_writer.slot_offset();
        let mut sync_upper = None;
        for page in &to_recycle {
            if self.stop_requested() {
                return Err(MareaError::Shutdown("recycler stopped"));
            }
            let range = self.slot_writer.append(
                &self.recycle_task_grant,
                &RecycleEvent::BatchPrepare {
                    page_id: page.page_id,
                    batch_slot,
                },
            )?;
            clamp_min_slot(&mut sync_upper, range.upper);
        }
        if let Some(upper) = sync_upper {
            self.await_flush(Some(upper))?;
        }
        debug!(
            batch_slot,
            pages = to_recycle.len(),
            "recycler.batch.prepared"
        );
        Ok(Batch {
            to_recycle,
            slot_offset: batch_slot,
        })
    }

    /// Physically drops the batch (retrying under backoff), then logs and
    /// flushes the commit slot.
    fn commit_batch(&self, batch: &Batch) -> Result<()> {
        let page_count = batch.to_recycle.len() as u64;
        retry::with_backoff("recycler_commit_batch", &self.stop_requested, || {
            let result = self.deleter.delete_pages(
                &batch.to_recycle,
                self,
                batch.slot_offset,
                &self.recycle_task_grant,
            );
            match &result {
                Ok(()) => self.metrics.page_drop_ok_count.add(page_count),
                Err(_) => self.metrics.page_drop_error_count.add(page_count),
            }
            result
        })?;

        if self.stop_requested() {
            return Err(MareaError::Shutdown("recycler stopped"));
        }

        let range = self.slot_writer.append(
            &self.recycle_task_grant,
            &RecycleEvent::BatchCommit {
                batch_slot: batch.slot_offset,
            },
        )?;
        self.await_flush(Some(range.upper))?;
        *self.latest_batch_upper.lock() = Some(range.upper);
        self.metrics.batch_commit_count.add(1);
        debug!(batch_slot = batch.slot_offset, "recycler.batch.committed");
        Ok(())
    }

    /// Trims the WAL up to the highest safe offset, refreshing the info slot
    /// when the refresh interval elapsed or the trim point would pass it.
    fn trim_log(&self) -> Result<()> {
        let mut latest_info = self.latest_info_refresh_slot.load(Ordering::Acquire);
        let lru_slot = self.state.lock().get_lru_slot();
        let latest_batch_upper = *self.latest_batch_upper.lock();

        let trim_point = match (lru_slot, latest_batch_upper) {
            (Some(lru), Some(upper)) => crate::slot::slot_min(lru, upper),
            (Some(lru), None) => lru,
            (None, Some(upper)) => upper,
            (None, None) => latest_info,
        };

        let current_upper = self.slot_upper_bound(LogReadMode::Speculative);
        if self.options.info_needs_refresh(latest_info, current_upper)
            || slot_lt(latest_info, trim_point)
        {
            let info_grant = match self
                .recycle_task_grant
                .spend(self.options.info_slot_size(), WaitForResource::NoWait)
            {
                Ok(grant) => grant,
                Err(_) => return Err(MareaError::Shutdown("recycler stopped")),
            };
            if self.stop_requested() {
                return Err(MareaError::Shutdown("recycler stopped"));
            }
            let new_info = refresh_info_slot(
                &self.slot_writer,
                self.uuid,
                &self.options,
                Some(&info_grant),
            )?;
            latest_info = new_info.lower;
            self.latest_info_refresh_slot
                .store(latest_info, Ordering::Release);
            debug!(info_slot = latest_info, "recycler.info.refreshed");
        }

        // The info slot must survive every trim.
        if slot_lt(latest_info, trim_point) {
            return Err(MareaError::Corruption(
                "recycler trim point would pass the info slot",
            ));
        }

        self.slot_writer.trim(trim_point)?;
        debug!(trim_point, "recycler.trimmed");
        self.refresh_grants();
        Ok(())
    }

    fn recycle_task_loop(&self) -> Result<()> {
        loop {
            let recovered = self.prepared_batch.lock().take();
            if let Some(batch) = recovered {
                self.commit_batch(&batch)?;
                self.trim_log()?;
            }

            if self.pending_count.get() == 0 {
                self.deleter
                    .notify_caught_up(self, self.slot_upper_bound(LogReadMode::Speculative));
                self.pending_count.await_not_equal(0)?;
            }

            let to_recycle = self
                .state
                .lock()
                .collect_batch(self.options.batch_size, &self.metrics);
            if to_recycle.is_empty() {
                continue;
            }
            self.pending_count
                .modify(|count| count - to_recycle.len() as u64);
            let batch = self.prepare_batch(to_recycle)?;
            *self.prepared_batch.lock() = Some(batch);
        }
    }
}

fn recycle_task_main(core: Arc<RecyclerCore>) {
    let result = core.recycle_task_loop();

    // This task drains the WAL; once it exits, blocked writers can never be
    // satisfied, so fail them now.
    core.slot_writer.halt();
    core.recycle_task_grant.revoke();
    core.insert_grant_pool.revoke();

    if let Err(err) = result {
        if core.stop_requested() {
            debug!(name = %core.name, error = %err, "recycler.task.exit");
        } else {
            warn!(name = %core.name, error = %err, "recycler.task.exit_unexpected");
            core.deleter.notify_failure(&core, &err);
        }
        *core.task_failure.lock() = Some(err);
    }
}

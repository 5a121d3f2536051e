use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use marea::recycler::event::{PageToRecycle, RecycleEvent};
use marea::slot::reader::TypedSlotReader;
use marea::{
    Grant, LogDevice, LogDeviceFactory, LogReadMode, MareaError, MemoryLogFactory, MetricsRegistry,
    PageDeleter, PageId, PageRecycler, PageRecyclerOptions, RecyclerCore, Result, SlotOffset,
};

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Deleter that holds every batch behind a gate until the test opens it.
#[derive(Default)]
struct GateDeleter {
    open: Mutex<bool>,
    blocked: Mutex<bool>,
    deleted: Mutex<Vec<PageId>>,
    caught_up: Mutex<Option<SlotOffset>>,
}

impl GateDeleter {
    fn open_gate(&self) {
        *self.open.lock() = true;
    }

    fn is_blocked(&self) -> bool {
        *self.blocked.lock()
    }

    fn deleted(&self) -> Vec<PageId> {
        self.deleted.lock().clone()
    }

    fn caught_up(&self) -> Option<SlotOffset> {
        *self.caught_up.lock()
    }
}

impl PageDeleter for GateDeleter {
    fn delete_pages(
        &self,
        pages: &[PageToRecycle],
        recycler: &RecyclerCore,
        _batch_slot: SlotOffset,
        _grant: &Grant,
    ) -> Result<()> {
        *self.blocked.lock() = true;
        loop {
            if recycler.stop_requested() {
                return Err(MareaError::Shutdown("gate deleter"));
            }
            if *self.open.lock() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        *self.blocked.lock() = false;
        self.deleted
            .lock()
            .extend(pages.iter().map(|page| page.page_id));
        Ok(())
    }

    fn notify_caught_up(&self, _recycler: &RecyclerCore, upper: SlotOffset) {
        *self.caught_up.lock() = Some(upper);
    }

    fn notify_failure(&self, _recycler: &RecyclerCore, _err: &MareaError) {}
}

fn small_options() -> PageRecyclerOptions {
    PageRecyclerOptions {
        batch_size: 1,
        info_refresh_interval: 4096,
        max_refs_per_page: 4,
    }
}

fn recover(
    factory: &MemoryLogFactory,
    options: PageRecyclerOptions,
    deleter: Arc<dyn PageDeleter>,
) -> PageRecycler {
    PageRecycler::recover(
        "test_recycler",
        options,
        deleter,
        factory,
        Arc::new(MetricsRegistry::new()),
    )
    .expect("recycler recovery")
}

#[test]
fn repeat_insert_of_pending_page_appends_nothing() {
    let factory = MemoryLogFactory::new(1 << 14);
    let deleter = Arc::new(GateDeleter::default());
    let recycler = recover(
        &factory,
        small_options(),
        Arc::clone(&deleter) as Arc<dyn PageDeleter>,
    );
    recycler.start();

    // First page is collected immediately and parks the task in the gate.
    recycler.recycle_page(PageId(1)).expect("insert 1");
    assert!(wait_until(Duration::from_secs(2), || deleter.is_blocked()));

    // The second page stays pending, so a repeat insert must be a no-op.
    recycler.recycle_page(PageId(2)).expect("insert 2");
    let upper_before = recycler.slot_upper_bound(LogReadMode::Speculative);
    recycler.recycle_page(PageId(2)).expect("repeat insert 2");
    assert_eq!(
        recycler.slot_upper_bound(LogReadMode::Speculative),
        upper_before
    );
    assert_eq!(recycler.metrics().insert_count.get(), 2);

    deleter.open_gate();
    assert!(wait_until(Duration::from_secs(2), || {
        deleter.deleted() == vec![PageId(1), PageId(2)]
    }));
}

#[test]
fn caught_up_notification_carries_the_log_upper_bound() {
    let factory = MemoryLogFactory::new(1 << 14);
    let deleter = Arc::new(GateDeleter::default());
    deleter.open_gate();
    let recycler = recover(
        &factory,
        small_options(),
        Arc::clone(&deleter) as Arc<dyn PageDeleter>,
    );
    recycler.start();

    recycler.recycle_page(PageId(9)).expect("insert");
    assert!(wait_until(Duration::from_secs(2), || {
        deleter.deleted() == vec![PageId(9)]
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        deleter.caught_up() == Some(recycler.slot_upper_bound(LogReadMode::Speculative))
    }));
}

#[test]
fn depth_requires_a_grant() {
    let factory = MemoryLogFactory::new(1 << 14);
    let deleter = Arc::new(GateDeleter::default());
    deleter.open_gate();
    let recycler = recover(
        &factory,
        small_options(),
        Arc::clone(&deleter) as Arc<dyn PageDeleter>,
    );
    recycler.start();

    assert!(matches!(
        recycler.recycle_pages(&[PageId(5)], None, 1),
        Err(MareaError::Invalid(_))
    ));
}

#[test]
fn uncommitted_batch_is_committed_after_crash() {
    let factory = MemoryLogFactory::new(1 << 14);

    // Run a recycler that never gets to commit: the gate stays shut, so the
    // prepare slots are durable but no commit slot exists.
    {
        let deleter = Arc::new(GateDeleter::default());
        let recycler = recover(
            &factory,
            small_options(),
            Arc::clone(&deleter) as Arc<dyn PageDeleter>,
        );
        recycler.start();
        recycler.recycle_page(PageId(3)).expect("insert");
        assert!(wait_until(Duration::from_secs(2), || deleter.is_blocked()));
    }
    factory.crash();

    // Recovery finds the prepared batch and the task commits it first.
    let deleter = Arc::new(GateDeleter::default());
    deleter.open_gate();
    let recycler = recover(
        &factory,
        small_options(),
        Arc::clone(&deleter) as Arc<dyn PageDeleter>,
    );
    recycler.start();
    assert!(wait_until(Duration::from_secs(2), || {
        deleter.deleted() == vec![PageId(3)]
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        recycler.metrics().batch_commit_count.get() == 1
    }));
    drop(recycler);

    // The log now holds a commit for that batch and the page is done.
    let mut commits = 0;
    let mut pending = 0;
    factory
        .open_log_device(&mut |reader| {
            let mut slots = TypedSlotReader::<_, RecycleEvent>::new(reader);
            slots.visit_all(|_, event| {
                match event {
                    RecycleEvent::BatchCommit { .. } => commits += 1,
                    RecycleEvent::PageToRecycle(_) => pending += 1,
                    _ => {}
                }
                Ok(())
            })?;
            Ok(slots.slot_offset())
        })
        .expect("scan");
    assert!(commits >= 1);
    let _ = pending;
}

#[test]
fn info_slot_is_refreshed_and_old_prefix_trimmed() {
    let factory = MemoryLogFactory::new(1 << 14);
    let deleter = Arc::new(GateDeleter::default());
    deleter.open_gate();
    let options = PageRecyclerOptions {
        batch_size: 1,
        info_refresh_interval: 256,
        max_refs_per_page: 4,
    };
    let first_info_upper;
    {
        let recycler = recover(
            &factory,
            options,
            Arc::clone(&deleter) as Arc<dyn PageDeleter>,
        );
        first_info_upper = recycler.slot_upper_bound(LogReadMode::Durable);
        recycler.start();
        // Enough traffic to push the log well past the refresh interval.
        for page in 0..24u64 {
            recycler.recycle_page(PageId(page)).expect("insert");
        }
        assert!(wait_until(Duration::from_secs(2), || {
            deleter.deleted().len() == 24
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            recycler.metrics().batch_commit_count.get() >= 24
        }));
    }

    let device = factory
        .open_log_device(&mut |reader| Ok(reader.upper_bound()))
        .expect("reopen");
    let range = device.slot_range(LogReadMode::Durable);
    // The original info slot was trimmed away and a fresh one exists above
    // the trim point.
    assert!(range.lower >= first_info_upper);
    let mut info_count = 0;
    let mut slots =
        TypedSlotReader::<_, RecycleEvent>::new(device.new_reader(None, LogReadMode::Durable));
    slots
        .visit_all(|_, event| {
            if matches!(event, RecycleEvent::Info(_)) {
                info_count += 1;
            }
            Ok(())
        })
        .expect("scan");
    assert!(info_count >= 1);
}

#[test]
fn identity_survives_recovery() {
    let factory = MemoryLogFactory::new(1 << 14);
    let deleter = Arc::new(GateDeleter::default());
    deleter.open_gate();
    let uuid = {
        let recycler = recover(
            &factory,
            small_options(),
            Arc::clone(&deleter) as Arc<dyn PageDeleter>,
        );
        recycler.uuid()
    };
    let recycler = recover(
        &factory,
        small_options(),
        Arc::clone(&deleter) as Arc<dyn PageDeleter>,
    );
    assert_eq!(recycler.uuid(), uuid);
}

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use marea::volume::event::{attach_slot_size, ids_slot_size, VolumeEvent};
use marea::{
    LogDeviceFactory, LogReadMode, MemoryLogFactory, MetricsRegistry, NewPage, PageCache,
    PageCacheJob, PageId, PageRecyclerOptions, PendingJobPolicy, SlotRangeSpec, SlotSequencer,
    SlotUpperBoundAt, SlotWriter, Volume, VolumeOptions, VolumeRecoverParams, WaitForResource,
};

const LOG_CAPACITY: u64 = 1 << 16;

struct Harness {
    cache: Arc<PageCache>,
    root_factory: Arc<MemoryLogFactory>,
    recycler_factory: Arc<MemoryLogFactory>,
    registry: Arc<MetricsRegistry>,
}

impl Harness {
    fn new(device_count: usize) -> Self {
        Self {
            cache: PageCache::new(device_count),
            root_factory: Arc::new(MemoryLogFactory::new(LOG_CAPACITY)),
            recycler_factory: Arc::new(MemoryLogFactory::new(LOG_CAPACITY)),
            registry: Arc::new(MetricsRegistry::new()),
        }
    }

    fn recover(&self) -> Volume {
        Volume::recover(
            VolumeRecoverParams {
                options: VolumeOptions {
                    name: "test_volume".into(),
                    uuid: None,
                    recycler: PageRecyclerOptions {
                        batch_size: 4,
                        info_refresh_interval: 8192,
                        max_refs_per_page: 8,
                    },
                    pending_job_policy: PendingJobPolicy::default(),
                },
                cache: Arc::clone(&self.cache),
                root_log_factory: Arc::clone(&self.root_factory) as Arc<dyn LogDeviceFactory>,
                recycler_log_factory: Arc::clone(&self.recycler_factory)
                    as Arc<dyn LogDeviceFactory>,
                trim_control: None,
                metrics: Arc::clone(&self.registry),
            },
            &mut |_, _| Ok(()),
        )
        .expect("volume recovery")
    }
}

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

fn job(new: &[(u64, &[u64])], deltas: &[(u64, i64)], roots: &[u64]) -> PageCacheJob {
    PageCacheJob {
        new_pages: new
            .iter()
            .map(|&(id, refs)| NewPage {
                id: PageId(id),
                refs: refs.iter().copied().map(PageId).collect(),
            })
            .collect(),
        root_refs: roots.iter().copied().map(PageId).collect(),
        refcount_deltas: deltas
            .iter()
            .map(|&(id, delta)| (PageId(id), delta))
            .collect(),
    }
}

fn append_synced(volume: &Volume, job: &PageCacheJob) -> marea::SlotRange {
    let grant = volume
        .reserve(volume.grant_size_for_job(job), WaitForResource::NoWait)
        .expect("grant");
    let range = volume.append(job, &grant, None).expect("append");
    volume
        .sync(
            LogReadMode::Durable,
            SlotUpperBoundAt {
                offset: range.upper,
            },
        )
        .expect("sync");
    range
}

#[test]
fn fresh_volume_writes_ids_and_attachments() {
    let harness = Harness::new(2);
    let volume = harness.recover();

    // One ids slot, then main/recycler/trimmer attached to both devices.
    let expected = ids_slot_size() + 6 * attach_slot_size();
    let durable = volume.root_log_slot_range(LogReadMode::Durable);
    assert_eq!(durable.lower, 0);
    assert_eq!(durable.upper, expected);

    for arena in volume.cache().all_arenas() {
        assert!(arena.allocator().is_attached(volume.volume_uuid()));
        assert!(arena.allocator().is_attached(volume.recycler().uuid()));
    }
}

#[test]
fn append_commit_round_trip_is_readable() {
    let harness = Harness::new(1);
    let volume = harness.recover();

    let range = append_synced(
        &volume,
        &job(&[(1, &[]), (2, &[])], &[(1, 1), (2, 1)], &[1]),
    );

    let mut prepares = Vec::new();
    let mut commits = Vec::new();
    let mut reader = volume
        .reader(SlotRangeSpec::all(), LogReadMode::Durable)
        .expect("reader");
    reader
        .visit_all(|slot, event| {
            match event {
                VolumeEvent::Prepare(job) => prepares.push((slot, job)),
                VolumeEvent::Commit { prepare_slot } => commits.push((slot, prepare_slot)),
                _ => {}
            }
            Ok(())
        })
        .expect("visit");

    assert_eq!(prepares.len(), 1);
    assert_eq!(commits.len(), 1);
    let (prepare_range, prepare_job) = &prepares[0];
    assert_eq!(prepare_range.lower, range.lower);
    assert_eq!(commits[0].1, prepare_range.lower);
    assert_eq!(prepare_job.new_page_ids, vec![PageId(1), PageId(2)]);

    assert_eq!(volume.cache().ref_count(PageId(1)), 2); // delta + root anchor
    assert_eq!(volume.cache().ref_count(PageId(2)), 1);
}

#[test]
fn crash_after_prepare_resolves_to_commit_exactly_once() {
    let harness = Harness::new(1);
    {
        let volume = harness.recover();
        append_synced(&volume, &job(&[(1, &[]), (2, &[])], &[(1, 1), (2, 1)], &[]));
    }

    // Write a bare prepare slot (durable) the way a crash between the
    // prepare flush and the commit slot would leave the log.
    {
        let device = harness
            .root_factory
            .open_log_device(&mut |reader| Ok(reader.upper_bound()))
            .expect("reopen root log");
        let writer = SlotWriter::new(Arc::clone(&device));
        let grant = writer.reserve(256, WaitForResource::NoWait).expect("grant");
        let prepare = VolumeEvent::Prepare(marea::volume::event::PrepareJob {
            root_refs: vec![],
            refcount_deltas: vec![(PageId(1), 1)],
            new_page_ids: vec![],
        });
        let range = writer.append(&grant, &prepare).expect("append prepare");
        writer
            .sync(
                LogReadMode::Durable,
                SlotUpperBoundAt {
                    offset: range.upper,
                },
            )
            .expect("sync prepare");
    }
    harness.root_factory.crash();
    harness.recycler_factory.crash();

    // Recovery must resolve the orphaned prepare with a commit.
    {
        let volume = harness.recover();
        assert_eq!(volume.cache().ref_count(PageId(1)), 2);
        assert!(volume.cache().page_is_valid(PageId(1)));
        assert!(volume.cache().page_is_valid(PageId(2)));
    }

    // And a second recovery must not re-apply the deltas.
    {
        let volume = harness.recover();
        assert_eq!(volume.cache().ref_count(PageId(1)), 2);
    }

    // The log now carries exactly one resolver for the orphaned prepare.
    let mut commits = 0;
    let mut prepares = 0;
    harness
        .root_factory
        .open_log_device(&mut |reader| {
            let mut slots = marea::slot::reader::TypedSlotReader::<_, VolumeEvent>::new(reader);
            slots.visit_all(|_, event| {
                match event {
                    VolumeEvent::Prepare(_) => prepares += 1,
                    VolumeEvent::Commit { .. } => commits += 1,
                    _ => {}
                }
                Ok(())
            })?;
            Ok(slots.slot_offset())
        })
        .expect("scan");
    assert_eq!(prepares, 2);
    assert_eq!(commits, 2);
}

#[test]
fn recovery_is_idempotent_on_a_clean_log() {
    let harness = Harness::new(2);
    {
        let volume = harness.recover();
        append_synced(&volume, &job(&[(7, &[])], &[(7, 1)], &[]));
    }
    let after_first = harness.root_factory.durable_upper();
    {
        let _volume = harness.recover();
    }
    assert_eq!(harness.root_factory.durable_upper(), after_first);
}

#[test]
fn dropped_page_cascades_through_recycler_depths() {
    let harness = Harness::new(1);
    let volume = harness.recover();

    // Page 11 references page 12; dropping 11 releases 12 one depth deeper.
    append_synced(
        &volume,
        &job(&[(12, &[]), (11, &[12])], &[(11, 1), (12, 1)], &[]),
    );
    append_synced(&volume, &job(&[], &[(11, -1)], &[]));

    assert!(wait_until(Duration::from_secs(2), || {
        !volume.cache().page_is_valid(PageId(11)) && !volume.cache().page_is_valid(PageId(12))
    }));

    let metrics = volume.recycler().metrics();
    assert!(wait_until(Duration::from_secs(2), || {
        metrics.batch_commit_count.get() >= 2
    }));
    assert_eq!(metrics.insert_count.get(), 2);
    assert_eq!(volume.cache().ref_count(PageId(11)), 0);
    assert_eq!(volume.cache().ref_count(PageId(12)), 0);
}

#[test]
fn trim_is_blocked_by_a_reader_and_resumes_after_drop() {
    let harness = Harness::new(1);
    let volume = harness.recover();

    let range = append_synced(
        &volume,
        &job(&[(1, &[]), (2, &[])], &[(1, 1), (2, 1)], &[1]),
    );
    assert_eq!(volume.cache().ref_count(PageId(1)), 2);

    let reader = volume
        .reader(SlotRangeSpec::all(), LogReadMode::Durable)
        .expect("reader");
    volume.trim(range.upper).expect("trim");

    thread::sleep(Duration::from_millis(60));
    assert_eq!(volume.root_log_slot_range(LogReadMode::Durable).lower, 0);
    assert_eq!(volume.cache().ref_count(PageId(1)), 2);

    drop(reader);
    assert!(wait_until(Duration::from_secs(2), || {
        volume.root_log_slot_range(LogReadMode::Durable).lower == range.upper
    }));
    // The trimmed job's root anchor on page 1 is released exactly once.
    assert_eq!(volume.cache().ref_count(PageId(1)), 1);
    assert_eq!(volume.cache().ref_count(PageId(2)), 1);
    assert!(volume.cache().page_is_valid(PageId(1)));
}

#[test]
fn sequenced_appends_preserve_order_and_propagate_slots() {
    let harness = Harness::new(1);
    let volume = harness.recover();

    let first = SlotSequencer::new();
    let second = first.next_in_chain();

    let job_a = job(&[(21, &[])], &[(21, 1)], &[]);
    let job_b = job(&[(22, &[])], &[(22, 1)], &[]);

    let (range_a, range_b) = thread::scope(|scope| {
        let volume_ref = &volume;
        let job_b_ref = &job_b;
        let handle = scope.spawn(move || {
            let grant = volume_ref
                .reserve(
                    volume_ref.grant_size_for_job(job_b_ref),
                    WaitForResource::NoWait,
                )
                .expect("grant b");
            volume_ref
                .append(job_b_ref, &grant, Some(&second))
                .expect("append b")
        });

        thread::sleep(Duration::from_millis(20));
        let grant = volume
            .reserve(volume.grant_size_for_job(&job_a), WaitForResource::NoWait)
            .expect("grant a");
        let range_a = volume
            .append(&job_a, &grant, Some(&first))
            .expect("append a");
        let range_b = handle.join().expect("join");
        (range_a, range_b)
    });

    assert!(range_a.lower < range_b.lower);
    assert!(first.is_resolved());
    assert_eq!(volume.cache().ref_count(PageId(21)), 1);
    assert_eq!(volume.cache().ref_count(PageId(22)), 1);
}

#[test]
fn uncommittable_job_rolls_back() {
    let harness = Harness::new(1);
    let volume = harness.recover();

    // A delta against a page that does not exist anywhere.
    let bad_job = job(&[], &[(404, 1)], &[]);
    let grant = volume
        .reserve(volume.grant_size_for_job(&bad_job), WaitForResource::NoWait)
        .expect("grant");
    let result = volume.append(&bad_job, &grant, None);
    assert!(matches!(
        result,
        Err(marea::MareaError::JobNotCommittable(_))
    ));
    assert_eq!(volume.cache().ref_count(PageId(404)), 0);

    let upper = volume.root_log_slot_range(LogReadMode::Durable).upper;
    volume
        .sync(LogReadMode::Durable, SlotUpperBoundAt { offset: upper })
        .expect("sync");
    let mut rollbacks = 0;
    let mut reader = volume
        .reader(SlotRangeSpec::all(), LogReadMode::Durable)
        .expect("reader");
    reader
        .visit_all(|_, event| {
            if matches!(event, VolumeEvent::Rollback { .. }) {
                rollbacks += 1;
            }
            Ok(())
        })
        .expect("visit");
    assert_eq!(rollbacks, 1);
}

#[test]
fn user_payload_slots_reach_the_recovery_visitor() {
    let harness = Harness::new(1);
    {
        let volume = harness.recover();
        let grant = volume.reserve(64, WaitForResource::NoWait).expect("grant");
        let range = volume
            .append_user_data(b"checkpoint-7", &grant)
            .expect("append payload");
        volume
            .sync(
                LogReadMode::Durable,
                SlotUpperBoundAt {
                    offset: range.upper,
                },
            )
            .expect("sync");
    }

    let mut seen: Vec<Vec<u8>> = Vec::new();
    let volume = Volume::recover(
        VolumeRecoverParams {
            options: VolumeOptions::with_name("test_volume"),
            cache: Arc::clone(&harness.cache),
            root_log_factory: Arc::clone(&harness.root_factory) as Arc<dyn LogDeviceFactory>,
            recycler_log_factory: Arc::clone(&harness.recycler_factory)
                as Arc<dyn LogDeviceFactory>,
            trim_control: None,
            metrics: Arc::clone(&harness.registry),
        },
        &mut |_, payload| {
            seen.push(payload.to_vec());
            Ok(())
        },
    )
    .expect("recover");
    drop(volume);
    assert_eq!(seen, vec![b"checkpoint-7".to_vec()]);
}

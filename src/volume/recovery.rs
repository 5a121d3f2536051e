//! Fold over a volume WAL scan, plus resolution of jobs that crashed
//! between their prepare and commit slots.

use std::collections::{BTreeMap, HashSet};

use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::job::{apply_job_effects, JobCommitParams};
use crate::cache::PageCache;
use crate::log::SlotUpperBoundAt;
use crate::metrics::VolumeMetrics;
use crate::recycler::RecyclerCore;
use crate::slot::writer::{Grant, SlotWriter};
use crate::slot::{slot_le, LogReadMode, SlotRange};
use crate::types::{MareaError, Result, SlotOffset};
use crate::volume::event::{PrepareJob, VolumeEvent, VolumeIds};

/// How recovery resolves a prepare that has neither commit nor rollback.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum PendingJobPolicy {
    /// Commit iff every page the job wrote is present and valid in the
    /// cache; roll back otherwise.
    #[default]
    CommitIfDurable,
    /// Always roll back.
    AlwaysRollback,
}

/// Accumulates the identity event, device attachments, and unresolved jobs
/// from a log scan. User payloads are forwarded to the caller's visitor.
pub struct VolumeRecoveryVisitor {
    pub ids: Option<(SlotRange, VolumeIds)>,
    pub attachments: HashSet<(Uuid, u64)>,
    pub pending_jobs: BTreeMap<SlotOffset, PrepareJob>,
    scan_lower: Option<SlotOffset>,
}

impl Default for VolumeRecoveryVisitor {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeRecoveryVisitor {
    pub fn new() -> Self {
        Self {
            ids: None,
            attachments: HashSet::new(),
            pending_jobs: BTreeMap::new(),
            scan_lower: None,
        }
    }

    pub fn visit(
        &mut self,
        range: SlotRange,
        event: VolumeEvent,
        user_visitor: &mut dyn FnMut(SlotRange, &[u8]) -> Result<()>,
    ) -> Result<()> {
        if self.scan_lower.is_none() {
            self.scan_lower = Some(range.lower);
        }
        match event {
            VolumeEvent::Ids(ids) => match &self.ids {
                Some((_, existing)) if *existing != ids => {
                    return Err(MareaError::Corruption("conflicting volume ids in log"));
                }
                Some(_) => {}
                None => self.ids = Some((range, ids)),
            },
            VolumeEvent::Attach {
                client_uuid,
                device_id,
            } => {
                self.attachments.insert((client_uuid, device_id));
            }
            VolumeEvent::Detach {
                client_uuid,
                device_id,
            } => {
                self.attachments.remove(&(client_uuid, device_id));
            }
            VolumeEvent::Prepare(job) => {
                self.pending_jobs.insert(range.lower, job);
            }
            VolumeEvent::Commit { prepare_slot } | VolumeEvent::Rollback { prepare_slot } => {
                if self.pending_jobs.remove(&prepare_slot).is_none() {
                    // A resolver for a slot inside the scanned window must
                    // match a prepare; below the window it resolves a job
                    // that was trimmed away.
                    if let Some(lower) = self.scan_lower {
                        if slot_le(lower, prepare_slot) {
                            return Err(MareaError::Corruption(
                                "job resolver without a matching prepare",
                            ));
                        }
                    }
                }
            }
            VolumeEvent::UserData(bytes) => user_visitor(range, &bytes)?,
        }
        Ok(())
    }
}

/// Resolves every pending prepare left by a crash: refcount deltas are
/// applied idempotently through the cache (keyed by the volume uuid and the
/// prepare slot), then the missing commit or rollback slot is appended and
/// flushed durably.
#[allow(clippy::too_many_arguments)]
pub(crate) fn resolve_pending_jobs(
    pending_jobs: &BTreeMap<SlotOffset, PrepareJob>,
    cache: &PageCache,
    recycler: &RecyclerCore,
    volume_uuid: Uuid,
    policy: PendingJobPolicy,
    slot_writer: &SlotWriter,
    grant: &Grant,
    metrics: &VolumeMetrics,
) -> Result<()> {
    for (&prepare_slot, job) in pending_jobs {
        let commit_ok = match policy {
            PendingJobPolicy::CommitIfDurable => job
                .new_page_ids
                .iter()
                .all(|&page| cache.page_is_valid(page)),
            PendingJobPolicy::AlwaysRollback => false,
        };

        let resolver = if commit_ok {
            let params = JobCommitParams {
                caller_uuid: volume_uuid,
                caller_slot: prepare_slot,
                recycler,
                recycle_grant: None,
                recycle_depth: 0,
            };
            apply_job_effects(cache, &job.root_refs, &job.refcount_deltas, &params)?;
            metrics.commit_count.add(1);
            info!(prepare_slot, "volume.recover.job_committed");
            VolumeEvent::Commit { prepare_slot }
        } else {
            metrics.rollback_count.add(1);
            warn!(prepare_slot, "volume.recover.job_rolled_back");
            VolumeEvent::Rollback { prepare_slot }
        };

        let range = slot_writer.append(grant, &resolver)?;
        slot_writer.sync(
            LogReadMode::Durable,
            SlotUpperBoundAt {
                offset: range.upper,
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageId;

    fn no_user(_: SlotRange, _: &[u8]) -> Result<()> {
        Ok(())
    }

    fn range(at: SlotOffset, len: u64) -> SlotRange {
        SlotRange::new(at, at + len)
    }

    fn ids() -> VolumeIds {
        VolumeIds {
            main_uuid: Uuid::new_v4(),
            recycler_uuid: Uuid::new_v4(),
            trimmer_uuid: Uuid::new_v4(),
        }
    }

    #[test]
    fn pending_jobs_are_prepares_without_resolvers() {
        let mut visitor = VolumeRecoveryVisitor::new();
        let job = PrepareJob {
            new_page_ids: vec![PageId(1)],
            ..PrepareJob::default()
        };
        visitor
            .visit(
                range(0, 10),
                VolumeEvent::Prepare(job.clone()),
                &mut no_user,
            )
            .unwrap();
        visitor
            .visit(range(10, 10), VolumeEvent::Prepare(job), &mut no_user)
            .unwrap();
        visitor
            .visit(
                range(20, 5),
                VolumeEvent::Commit { prepare_slot: 0 },
                &mut no_user,
            )
            .unwrap();
        assert_eq!(visitor.pending_jobs.len(), 1);
        assert!(visitor.pending_jobs.contains_key(&10));
    }

    #[test]
    fn conflicting_ids_are_corruption() {
        let mut visitor = VolumeRecoveryVisitor::new();
        visitor
            .visit(range(0, 5), VolumeEvent::Ids(ids()), &mut no_user)
            .unwrap();
        assert!(matches!(
            visitor.visit(range(5, 5), VolumeEvent::Ids(ids()), &mut no_user),
            Err(MareaError::Corruption(_))
        ));
    }

    #[test]
    fn detach_cancels_attachment() {
        let mut visitor = VolumeRecoveryVisitor::new();
        let uuid = Uuid::new_v4();
        visitor
            .visit(
                range(0, 5),
                VolumeEvent::Attach {
                    client_uuid: uuid,
                    device_id: 1,
                },
                &mut no_user,
            )
            .unwrap();
        visitor
            .visit(
                range(5, 5),
                VolumeEvent::Detach {
                    client_uuid: uuid,
                    device_id: 1,
                },
                &mut no_user,
            )
            .unwrap();
        assert!(visitor.attachments.is_empty());
    }

    #[test]
    fn resolver_inside_window_without_prepare_is_corruption() {
        let mut visitor = VolumeRecoveryVisitor::new();
        visitor
            .visit(range(100, 5), VolumeEvent::Ids(ids()), &mut no_user)
            .unwrap();
        // Below the scanned window: resolves a trimmed job, ignored.
        visitor
            .visit(
                range(105, 5),
                VolumeEvent::Commit { prepare_slot: 50 },
                &mut no_user,
            )
            .unwrap();
        // Inside the window: broken log.
        assert!(matches!(
            visitor.visit(
                range(110, 5),
                VolumeEvent::Commit { prepare_slot: 102 },
                &mut no_user,
            ),
            Err(MareaError::Corruption(_))
        ));
    }
}

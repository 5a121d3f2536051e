//! Counter sets and the registry they are published through.
//!
//! The registry is an injected collaborator (constructed by the embedding
//! application, shared via `Arc`) so tests stay hermetic; components add
//! their counters on construction and remove them on drop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of named counters, shared across components.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<String, Arc<Counter>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>, counter: Arc<Counter>) {
        self.counters.lock().insert(name.into(), counter);
    }

    pub fn remove(&self, name: &str) {
        self.counters.lock().remove(name);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .lock()
            .iter()
            .map(|(name, counter)| (name.clone(), counter.get()))
            .collect();
        MetricsSnapshot { counters }
    }
}

/// Point-in-time view of every registered counter.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
}

/// Counters maintained by a page recycler.
#[derive(Default)]
pub struct RecyclerMetrics {
    pub insert_count: Arc<Counter>,
    pub remove_count: Arc<Counter>,
    pub batch_commit_count: Arc<Counter>,
    pub page_drop_ok_count: Arc<Counter>,
    pub page_drop_error_count: Arc<Counter>,
}

impl RecyclerMetrics {
    pub fn register(&self, registry: &MetricsRegistry, name: &str) {
        registry.add(
            format!("PageRecycler_{name}_insert_count"),
            Arc::clone(&self.insert_count),
        );
        registry.add(
            format!("PageRecycler_{name}_remove_count"),
            Arc::clone(&self.remove_count),
        );
        registry.add(
            format!("PageRecycler_{name}_batch_commit_count"),
            Arc::clone(&self.batch_commit_count),
        );
        registry.add(
            format!("PageRecycler_{name}_page_drop_ok_count"),
            Arc::clone(&self.page_drop_ok_count),
        );
        registry.add(
            format!("PageRecycler_{name}_page_drop_error_count"),
            Arc::clone(&self.page_drop_error_count),
        );
    }

    pub fn unregister(&self, registry: &MetricsRegistry, name: &str) {
        registry.remove(&format!("PageRecycler_{name}_insert_count"));
        registry.remove(&format!("PageRecycler_{name}_remove_count"));
        registry.remove(&format!("PageRecycler_{name}_batch_commit_count"));
        registry.remove(&format!("PageRecycler_{name}_page_drop_ok_count"));
        registry.remove(&format!("PageRecycler_{name}_page_drop_error_count"));
    }
}

/// Counters maintained by a volume.
#[derive(Default)]
pub struct VolumeMetrics {
    pub prepare_count: Arc<Counter>,
    pub commit_count: Arc<Counter>,
    pub rollback_count: Arc<Counter>,
    pub trim_count: Arc<Counter>,
}

impl VolumeMetrics {
    pub fn register(&self, registry: &MetricsRegistry, name: &str) {
        registry.add(
            format!("Volume_{name}_prepare_count"),
            Arc::clone(&self.prepare_count),
        );
        registry.add(
            format!("Volume_{name}_commit_count"),
            Arc::clone(&self.commit_count),
        );
        registry.add(
            format!("Volume_{name}_rollback_count"),
            Arc::clone(&self.rollback_count),
        );
        registry.add(
            format!("Volume_{name}_trim_count"),
            Arc::clone(&self.trim_count),
        );
    }

    pub fn unregister(&self, registry: &MetricsRegistry, name: &str) {
        registry.remove(&format!("Volume_{name}_prepare_count"));
        registry.remove(&format!("Volume_{name}_commit_count"));
        registry.remove(&format!("Volume_{name}_rollback_count"));
        registry.remove(&format!("Volume_{name}_trim_count"));
    }
}

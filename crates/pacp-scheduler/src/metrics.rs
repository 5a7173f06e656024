use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use pacp_schemas::OperationType;

/// In-process counters for the scheduler's own activity (active workers,
/// completions per type). Queue depth is deliberately not cached here —
/// spec §4.5 calls for it to be "queried from Store" on demand, so
/// [`SchedulerMetrics`] leaves that to a direct `pacp_db::count_operations`
/// call against the live table.
#[derive(Default)]
pub struct SchedulerMetrics {
    active_workers: AtomicI64,
    completed_by_type: Mutex<HashMap<OperationType, u64>>,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn worker_finished(&self, operation_type: OperationType) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
        let mut counts = self.completed_by_type.lock().unwrap();
        *counts.entry(operation_type).or_insert(0) += 1;
    }

    pub fn active_workers(&self) -> i64 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn completed_by_type(&self) -> HashMap<OperationType, u64> {
        self.completed_by_type.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_active_count_and_per_type_completions() {
        let metrics = SchedulerMetrics::new();
        metrics.worker_started();
        assert_eq!(metrics.active_workers(), 1);

        metrics.worker_finished(OperationType::SafeProvision);
        assert_eq!(metrics.active_workers(), 0);
        assert_eq!(metrics.completed_by_type().get(&OperationType::SafeProvision), Some(&1));
    }
}

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sqlx::PgPool;

use pacp_db::ClaimPolicy;
use pacp_handlers::HandlerRegistry;
use pacp_schemas::{OperationTimeouts, Priority, ProcessingCapacity};

use crate::{run_one_claim, shutdown_handles, BackoffPolicy, SchedulerMetrics, EMPTY_CLAIM_BACKOFF};

/// `allocated = round(total × fraction)`, minimum 1 when `fraction > 0`;
/// any rounding shortfall goes to the highest configured priority (spec
/// §4.5's lane-scheduler allocation rule).
fn allocate_workers(capacity: &ProcessingCapacity) -> BTreeMap<Priority, u32> {
    let total = capacity.total_workers;
    let mut allocation = BTreeMap::new();
    let mut allocated_sum = 0u32;

    for (&priority, &fraction) in &capacity.priority_allocation {
        let count = if fraction > 0.0 {
            ((total as f64) * fraction).round().max(1.0) as u32
        } else {
            0
        };
        allocation.insert(priority, count);
        allocated_sum += count;
    }

    if let Some(&highest) = capacity.priority_allocation.keys().max() {
        if allocated_sum < total {
            let shortfall = total - allocated_sum;
            *allocation.entry(highest).or_insert(0) += shortfall;
        }
    }

    allocation
}

/// N worker tasks partitioned across priority lanes, each claiming only
/// from its own lane (spec §4.5). Used when throughput matters more than
/// strict per-upstream session affinity.
pub struct LaneScheduler {
    db: PgPool,
    registry: Arc<HandlerRegistry>,
    timeouts: Arc<OperationTimeouts>,
    backoff: BackoffPolicy,
    metrics: Arc<SchedulerMetrics>,
    dispatcher_id: String,
    running: Arc<AtomicBool>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl LaneScheduler {
    pub fn new(
        db: PgPool,
        registry: Arc<HandlerRegistry>,
        timeouts: OperationTimeouts,
        backoff: BackoffPolicy,
        dispatcher_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            registry,
            timeouts: Arc::new(timeouts),
            backoff,
            metrics: Arc::new(SchedulerMetrics::new()),
            dispatcher_id: dispatcher_id.into(),
            running: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }

    /// Spawn the allocated worker tasks. Idempotent only in the sense
    /// that calling it twice spawns a second fleet — callers own the
    /// capacity/start lifecycle, matching the teacher's singleton
    /// components started once at daemon startup.
    pub fn start(&self, capacity: &ProcessingCapacity) {
        self.running.store(true, Ordering::SeqCst);
        let allocation = allocate_workers(capacity);
        let mut handles = self.handles.lock().unwrap();

        for (priority, count) in allocation {
            for worker_idx in 0..count {
                let db = self.db.clone();
                let registry = self.registry.clone();
                let timeouts = self.timeouts.clone();
                let backoff = self.backoff;
                let metrics = self.metrics.clone();
                let running = self.running.clone();
                let dispatcher_id = format!("{}-lane-{}-{worker_idx}", self.dispatcher_id, priority.as_str());

                let handle = tokio::spawn(async move {
                    while running.load(Ordering::SeqCst) {
                        let claimed = run_one_claim(
                            &db,
                            &registry,
                            &timeouts,
                            &backoff,
                            ClaimPolicy::Lane(priority),
                            &dispatcher_id,
                            &metrics,
                        )
                        .await;

                        match claimed {
                            Ok(true) => {}
                            Ok(false) => tokio::time::sleep(EMPTY_CLAIM_BACKOFF).await,
                            Err(e) => {
                                tracing::error!(dispatcher_id = %dispatcher_id, error = %e, "lane-scheduler/claim-failed");
                                tokio::time::sleep(EMPTY_CLAIM_BACKOFF).await;
                            }
                        }
                    }
                });

                handles.push(handle);
            }
        }
    }

    /// Stop accepting new claims and wait (up to the shared shutdown
    /// timeout) for in-flight handler calls to finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        shutdown_handles(handles).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(total: u32, fractions: &[(Priority, f64)]) -> ProcessingCapacity {
        ProcessingCapacity {
            total_workers: total,
            priority_allocation: fractions.iter().copied().collect(),
        }
    }

    #[test]
    fn splits_workers_by_fraction_with_exact_division() {
        let cap = capacity(10, &[(Priority::High, 0.4), (Priority::Normal, 0.4), (Priority::Low, 0.2)]);
        let allocation = allocate_workers(&cap);
        assert_eq!(allocation[&Priority::High], 4);
        assert_eq!(allocation[&Priority::Normal], 4);
        assert_eq!(allocation[&Priority::Low], 2);
    }

    #[test]
    fn enforces_a_minimum_of_one_worker_for_any_nonzero_fraction() {
        let cap = capacity(10, &[(Priority::High, 0.95), (Priority::Low, 0.05)]);
        let allocation = allocate_workers(&cap);
        assert_eq!(allocation[&Priority::Low], 1);
    }

    #[test]
    fn rounding_shortfall_goes_to_the_highest_priority() {
        // 3 lanes of 1/3 each over 10 workers rounds to 3+3+3=9, one short.
        let cap = capacity(
            10,
            &[(Priority::High, 1.0 / 3.0), (Priority::Normal, 1.0 / 3.0), (Priority::Low, 1.0 / 3.0)],
        );
        let allocation = allocate_workers(&cap);
        let total: u32 = allocation.values().sum();
        assert_eq!(total, 10);
        assert_eq!(allocation[&Priority::High], 4);
    }
}

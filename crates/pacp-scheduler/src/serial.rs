use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sqlx::PgPool;

use pacp_db::ClaimPolicy;
use pacp_handlers::HandlerRegistry;
use pacp_schemas::OperationTimeouts;

use crate::{run_one_claim, shutdown_handles, BackoffPolicy, SchedulerMetrics, EMPTY_CLAIM_BACKOFF};

/// A single worker loop claiming under global priority ordering (spec
/// §4.5). Used where strict cross-priority ordering matters more than
/// parallel throughput — e.g. a single small instance with one dispatcher.
pub struct SerialScheduler {
    db: PgPool,
    registry: Arc<HandlerRegistry>,
    timeouts: Arc<OperationTimeouts>,
    backoff: BackoffPolicy,
    metrics: Arc<SchedulerMetrics>,
    dispatcher_id: String,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SerialScheduler {
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
            handle: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);

        let db = self.db.clone();
        let registry = self.registry.clone();
        let timeouts = self.timeouts.clone();
        let backoff = self.backoff;
        let metrics = self.metrics.clone();
        let running = self.running.clone();
        let dispatcher_id = format!("{}-serial", self.dispatcher_id);

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let claimed = run_one_claim(
                    &db,
                    &registry,
                    &timeouts,
                    &backoff,
                    ClaimPolicy::Global,
                    &dispatcher_id,
                    &metrics,
                )
                .await;

                match claimed {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(EMPTY_CLAIM_BACKOFF).await,
                    Err(e) => {
                        tracing::error!(dispatcher_id = %dispatcher_id, error = %e, "serial-scheduler/claim-failed");
                        tokio::time::sleep(EMPTY_CLAIM_BACKOFF).await;
                    }
                }
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap().take();
        shutdown_handles(handle.into_iter().collect()).await;
    }
}

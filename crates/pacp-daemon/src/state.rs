//! Shared runtime state for pacp-daemon.
//!
//! Grounded on `mqk-daemon::state::AppState`: one `Clone`-able struct built
//! once at startup, handed to every handler as `State<Arc<AppState>>`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use pacp_capool::CaPool;
use pacp_eventbus::{EventBus, PlaneEvent};
use pacp_handlers::HandlerRegistry;

#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub db: PgPool,
    pub bus: EventBus,
    pub capool: Arc<CaPool>,
    pub registry: Arc<HandlerRegistry>,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(db: PgPool, bus: EventBus, capool: Arc<CaPool>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            db,
            bus,
            capool,
            registry,
            build: BuildInfo {
                service: "pacp-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START.get_or_init(std::time::Instant::now).elapsed().as_secs()
}

/// Spawn a background task publishing a `Heartbeat` event on the bus every
/// `interval` (spec §6's "heartbeat `heartbeat` every 30 s" SSE framing).
pub fn spawn_heartbeat(bus: EventBus, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            bus.publish(PlaneEvent::Heartbeat { ts: chrono::Utc::now() });
        }
    })
}

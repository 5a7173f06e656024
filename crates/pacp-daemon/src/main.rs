//! pacp-daemon entry point.
//!
//! Thin by design: wires tracing, connects the database, builds the shared
//! state, starts the background loops (lane scheduler, sync ticker, stuck-
//! operation reclaim, heartbeat), and serves the HTTP router. All route
//! handlers live in `routes.rs`; all shared state lives in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use pacp_daemon::{routes, state};
use pacp_scheduler::{BackoffPolicy, LaneScheduler};

/// Interval between `reclaim_stuck_processing` sweeps (spec §4.6).
const STUCK_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);
/// An operation left in `processing` longer than this is presumed dead
/// (its claiming worker crashed or was killed) and reclaimed to `pending`.
const STUCK_RECLAIM_TTL_SECONDS: i64 = 15 * 60;
/// Cadence of the `heartbeat` SSE event (spec §6).
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let db = pacp_db::connect_from_env().await.context("connect to database")?;
    pacp_db::migrate(&db).await.context("run database migrations")?;

    let capool = Arc::new(pacp_capool::CaPool::new(db.clone()).context("build initial CA pool")?);
    capool.force_refresh().await.context("initial CA pool refresh")?;

    let sessions = Arc::new(pacp_session::SessionCache::new(
        capool.clone(),
        db.clone(),
        Arc::new(pacp_session::PassthroughDecryptor),
    ));

    let registry = Arc::new(pacp_handlers::HandlerRegistry::build(db.clone(), sessions.clone()));
    let bus = pacp_eventbus::EventBus::new();

    let pipeline_cfg = pacp_db::get_pipeline_config(&db).await.context("load pipeline config")?;

    let dispatcher_id = format!("pacp-daemon-{}", uuid::Uuid::new_v4());
    let lane_scheduler = Arc::new(LaneScheduler::new(
        db.clone(),
        registry.clone(),
        pipeline_cfg.operation_timeouts.clone(),
        BackoffPolicy::default(),
        dispatcher_id,
    ));
    lane_scheduler.start(&pipeline_cfg.processing_capacity);

    pacp_sync::spawn_tick_loop(db.clone(), pacp_sync::DEFAULT_TICK_INTERVAL);
    pacp_scheduler::spawn_stuck_reclaim_loop(db.clone(), STUCK_RECLAIM_TTL_SECONDS, STUCK_RECLAIM_INTERVAL);
    state::spawn_heartbeat(bus.clone(), HEARTBEAT_INTERVAL);

    let shared = Arc::new(state::AppState::new(db, bus, capool, registry));

    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("pacp-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("PACP_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins (the operator console runs on the
/// same box, never a remote browser).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}

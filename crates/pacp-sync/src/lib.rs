//! Sync Engine + Sync Scheduler: paginated reconciliation of upstream
//! users/groups/safe-authorizations against the local mirror, and the
//! periodic producer that enqueues `*_sync` operations (spec §4.7/§4.8).
//!
//! Grounded on `mqk-reconcile::engine::reconcile`'s "diff against a
//! reference snapshot" shape, generalised from one-shot broker/local
//! comparison to a paginated seen-set accumulated across an upstream
//! listing, and on `mqk-daemon::state::spawn_heartbeat`'s spawn-a-ticker
//! shape for the scheduler side.

mod engine;
mod scheduler;

pub use engine::{
    run_full_user_sync, sync_groups, sync_safes, sync_users, CancelSignal, Session,
};
pub use scheduler::{spawn_tick_loop, tick_once, trigger_manual_sync, DEFAULT_TICK_INTERVAL};

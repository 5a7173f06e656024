//! HTTP surface for the privileged-access control plane (spec §6).
//!
//! Grounded directly on `mqk-daemon`: a thin `main.rs` that wires tracing,
//! shared state, and middleware, a `state.rs` holding one `Arc<AppState>`
//! clone per handler, and a `routes.rs` exposing `build_router` so scenario
//! tests can drive the router without binding a socket.

pub mod routes;
pub mod state;

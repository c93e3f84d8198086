//! Control-plane HTTP API: the axum `Router` wiring every handler module to
//! its route, plus the process-wide types (`Config`, `AppState`) other
//! binaries (tests, the `tyger-server` binary itself) build on.
//!
//! Grounded on the teacher's `sem_os_server::router::build_router` shape:
//! one `Router::new().route(...)` chain per resource, `Extension`/`State`
//! layers applied once at the top, `TraceLayer` + a request-id layer
//! wrapping the whole thing.

pub mod config;
pub mod error;
pub mod handlers;
pub mod request_id;
pub mod state;

use axum::routing::{get, post, put};
use axum::Router;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use request_id::{MakeTygerRequestId, HEADER_NAME_STR};
use state::AppState;

/// Builds the full control-plane router over the given state. Split from
/// binary `main` so integration tests can mount it against an in-memory or
/// test-database-backed `AppState` without going through a real listener.
pub fn build_router(state: AppState) -> Router {
    let header_name = axum::http::HeaderName::from_static(HEADER_NAME_STR);

    Router::new()
        .route("/healthcheck", get(handlers::health::healthcheck))
        .route("/metadata", get(handlers::health::metadata))
        .route("/database-version-in-use", get(handlers::health::database_version_in_use))
        .route("/buffers", post(handlers::buffers::create_buffer).get(handlers::buffers::list_buffers))
        .route("/buffers/:id", get(handlers::buffers::get_buffer))
        .route("/buffers/:id/tags", put(handlers::buffers::update_buffer_tags))
        .route("/buffers/:id/access", post(handlers::buffers::get_buffer_access))
        .route("/codespecs", post(handlers::codespecs::put_codespec).get(handlers::codespecs::list_codespecs))
        .route("/codespecs/:name", get(handlers::codespecs::get_latest_codespec))
        .route("/codespecs/:name/versions/:version", get(handlers::codespecs::get_codespec_version))
        .route("/runs", post(handlers::runs::create_run).get(handlers::runs::list_runs))
        .route("/runs/counts", get(handlers::runs::run_counts))
        .route("/runs/:id", get(handlers::runs::get_run))
        .route("/runs/:id/cancel", post(handlers::runs::cancel_run))
        .route("/runs/:id/tags", put(handlers::runs::update_run_tags))
        .route("/runs/:id/logs", get(handlers::runs::get_run_logs))
        .layer(PropagateRequestIdLayer::new(header_name.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(header_name, MakeTygerRequestId))
        .with_state(state)
}

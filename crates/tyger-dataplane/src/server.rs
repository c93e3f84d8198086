//! Axum routes for the local-mode data plane:
//! `PUT/GET /v1/buffers/data/{id}/{*blob}`, per spec.md §6.
//!
//! Errors map to the `x-ms-error-code` compatibility header the way the
//! teacher's `AppError` maps `SemOsError` to a status code + JSON body — here
//! the body is empty (matching blob-storage semantics) and the code rides in
//! a header instead.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;

use crate::error::DataPlaneError;
use crate::local::LocalStore;
use crate::protocol::BlobName;
use crate::signing::{Action, SasOutcome, SasParams, SigningKeys};

pub struct DataPlaneState {
    pub store: LocalStore,
    pub keys: SigningKeys,
}

pub fn build_router(state: Arc<DataPlaneState>) -> Router {
    Router::new()
        .route("/v1/buffers/data/:id/*blob", put(put_blob).get(get_blob))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SasQuery {
    sv: Option<String>,
    sp: Option<String>,
    st: Option<String>,
    se: Option<String>,
    sig: Option<String>,
}

fn error_response(err: DataPlaneError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = status.into_response();
    resp.headers_mut().insert(
        "x-ms-error-code",
        HeaderValue::from_static(err.x_ms_error_code()),
    );
    resp
}

fn check_sas(id: &str, query: &SasQuery, keys: &SigningKeys, action: Action) -> Result<(), DataPlaneError> {
    let params = SasParams {
        sv: query.sv.as_deref(),
        sp: query.sp.as_deref(),
        st: query.st.as_deref(),
        se: query.se.as_deref(),
        sig: query.sig.as_deref(),
    };
    match crate::signing::verify(id, params, Utc::now(), keys, action) {
        SasOutcome::Allowed => Ok(()),
        SasOutcome::InvalidSas => Err(DataPlaneError::AuthenticationFailed),
        SasOutcome::ActionNotAllowed => Err(DataPlaneError::AuthorizationPermissionMismatch),
    }
}

async fn put_blob(
    State(state): State<Arc<DataPlaneState>>,
    Path((id, blob)): Path<(String, String)>,
    Query(query): Query<SasQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(e) = check_sas(&id, &query, &state.keys, Action::Create) {
        return error_response(e);
    }
    let Some(blob_name) = BlobName::parse(&blob) else {
        return error_response(DataPlaneError::BlobNotFound);
    };
    let content_md5 = headers.get("Content-MD5").and_then(|v| v.to_str().ok()).unwrap_or_default();
    let hash_chain = headers.get("X-Hash-Chain").and_then(|v| v.to_str().ok()).unwrap_or_default();

    match state.store.write_block(&id, blob_name, body, content_md5, hash_chain).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_blob(
    State(state): State<Arc<DataPlaneState>>,
    Path((id, blob)): Path<(String, String)>,
    Query(query): Query<SasQuery>,
) -> Response {
    if let Err(e) = check_sas(&id, &query, &state.keys, Action::Read) {
        return error_response(e);
    }
    let Some(blob_name) = BlobName::parse(&blob) else {
        return error_response(DataPlaneError::BlobNotFound);
    };

    match state.store.read_block(&id, blob_name).await {
        Ok((bytes, content_md5_b64, chain_b64)) => {
            let mut resp = (StatusCode::OK, bytes).into_response();
            if let Ok(value) = HeaderValue::from_str(&content_md5_b64) {
                resp.headers_mut().insert("Content-MD5", value);
            }
            if let Ok(value) = HeaderValue::from_str(&chain_b64) {
                resp.headers_mut().insert("X-Hash-Chain", value);
            }
            resp
        }
        Err(e) => error_response(e),
    }
}

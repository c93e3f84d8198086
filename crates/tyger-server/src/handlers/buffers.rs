//! `POST /buffers`, `GET /buffers`, `GET /buffers/{id}`,
//! `PUT /buffers/{id}/tags`, `POST /buffers/{id}/access` (spec.md §6).

use std::collections::HashMap;

use axum::extract::{Extension, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use tyger_core::ports::BufferListQuery;
use tyger_core::types::{Buffer, ContinuationToken};
use tyger_dataplane::signing::Permission;

use crate::config::DataPlaneMode;
use crate::error::{with_request_id, AppError};
use crate::request_id::RequestId;
use crate::state::AppState;

/// Signed access URLs are short-lived; a client re-requests one as needed
/// rather than holding a single URL for the life of a run.
const ACCESS_URL_TTL: Duration = Duration::hours(1);

#[derive(Debug, Deserialize, Default)]
pub struct CreateBufferRequest {
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

pub async fn create_buffer(
    State(state): State<AppState>,
    Json(req): Json<CreateBufferRequest>,
) -> Result<(StatusCode, Json<Buffer>), AppError> {
    let buffer = state.repo.create_buffer(req.tags).await?;
    if let Some(store) = &state.local_store {
        store.create_container(&buffer.id).await.map_err(|e| {
            tyger_core::error::TygerError::Transient(format!("failed to create local container: {e:?}"))
        })?;
    }
    Ok((StatusCode::CREATED, Json(buffer)))
}

#[derive(Debug, Deserialize)]
pub struct ListBuffersParams {
    pub limit: Option<i64>,
    #[serde(rename = "_ct")]
    pub continuation: Option<String>,
    #[serde(rename = "softDeleted", default)]
    pub include_soft_deleted: bool,
}

pub async fn list_buffers(
    State(state): State<AppState>,
    Query(params): Query<ListBuffersParams>,
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tags = crate::handlers::extract_tag_filters(raw_query.as_deref().unwrap_or(""));
    let continuation = params
        .continuation
        .map(|s| decode_continuation(&s, &request_id))
        .transpose()?;

    let page = state
        .repo
        .list_buffers(BufferListQuery {
            tags,
            include_soft_deleted: params.include_soft_deleted,
            limit: params.limit.unwrap_or(tyger_core::types::DEFAULT_PAGE_SIZE),
            continuation,
        })
        .await?;
    Ok(Json(json!({ "items": page.items, "nextContinuationToken": page.next })))
}

fn decode_continuation(token: &str, request_id: &RequestId) -> Result<ContinuationToken, AppError> {
    let (created_at, id_low) = ContinuationToken::decode(token).ok_or_else(|| {
        with_request_id(
            tyger_core::error::TygerError::validation("InvalidRoute", "malformed continuation token"),
            request_id,
        )
    })?;
    Ok(ContinuationToken { created_at_nanos: created_at.timestamp_nanos_opt().unwrap_or(0), id_low: id_low as i64 })
}

pub async fn get_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Buffer>, AppError> {
    let buffer = state.repo.get_buffer(&id).await?;
    Ok(Json(buffer))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBufferTagsRequest {
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// `*` as `If-Match` means "must exist, don't care what version" (spec.md §6).
fn if_match_etag(headers: &HeaderMap) -> Option<String> {
    headers.get(axum::http::header::IF_MATCH).and_then(|v| v.to_str().ok()).map(str::to_string)
}

pub async fn update_buffer_tags(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateBufferTagsRequest>,
) -> Result<Json<Buffer>, AppError> {
    let expected_etag = if_match_etag(&headers);
    let buffer = state.repo.update_buffer_tags(&id, req.tags, expected_etag.as_deref()).await?;
    Ok(Json(buffer))
}

#[derive(Debug, Deserialize, Default)]
pub struct AccessParams {
    #[serde(default)]
    pub writeable: bool,
}

/// `POST /buffers/{id}/access?writeable=bool`: hands back a location the
/// client reads/writes blocks through, with a signed query string appended
/// in local mode (cloud mode returns the storage account's own opaque SAS,
/// which is out of scope here — spec.md §4.B only requires local-mode
/// signing to be implemented).
pub async fn get_buffer_access(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<AccessParams>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<serde_json::Value>, AppError> {
    let buffer = state.repo.get_buffer(&id).await?;
    if buffer.is_soft_deleted {
        return Err(with_request_id(
            tyger_core::error::TygerError::PreconditionFailed(format!("buffer '{id}' is soft-deleted")),
            &request_id,
        ));
    }

    match state.data_plane_mode {
        DataPlaneMode::Local => {
            let permission = if params.writeable { Permission::ReadCreate } else { Permission::Read };
            let now = Utc::now();
            let signed = state.signing_keys.sign_url(&id, permission, now, now + ACCESS_URL_TTL);
            let url = format!("{}?{}", buffer.location, signed.to_query_string());
            Ok(Json(json!({ "uri": url })))
        }
        DataPlaneMode::Cloud => Ok(Json(json!({ "uri": buffer.location }))),
    }
}

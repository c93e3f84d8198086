//! `POST /codespecs`, `GET /codespecs`, `GET /codespecs/{name}`,
//! `GET /codespecs/{name}/versions/{version}` (spec.md §6).

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use tyger_core::ports::CodespecListQuery;
use tyger_core::types::{Codespec, CodespecContent};

use crate::error::{with_request_id, AppError};
use crate::request_id::RequestId;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PutCodespecRequest {
    pub name: String,
    #[serde(flatten)]
    pub content: CodespecContent,
}

pub async fn put_codespec(
    State(state): State<AppState>,
    Json(req): Json<PutCodespecRequest>,
) -> Result<(StatusCode, Json<Codespec>), AppError> {
    let codespec = state.repo.put_codespec(&req.name, req.content).await?;
    Ok((StatusCode::CREATED, Json(codespec)))
}

#[derive(Debug, Deserialize)]
pub struct ListCodespecsParams {
    pub prefix: Option<String>,
    pub limit: Option<i64>,
    #[serde(rename = "_ct")]
    pub continuation: Option<String>,
}

pub async fn list_codespecs(
    State(state): State<AppState>,
    Query(params): Query<ListCodespecsParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let page = state
        .repo
        .list_codespecs(CodespecListQuery {
            prefix: params.prefix,
            limit: params.limit.unwrap_or(tyger_core::types::DEFAULT_PAGE_SIZE),
            continuation: params.continuation,
        })
        .await?;
    Ok(Json(serde_json::json!({ "items": page.items, "nextContinuationToken": page.next })))
}

pub async fn get_latest_codespec(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<Codespec>, AppError> {
    if name.trim().is_empty() {
        return Err(with_request_id(
            tyger_core::error::TygerError::validation("InvalidRoute", "codespec name must not be empty"),
            &request_id,
        ));
    }
    let codespec = state.repo.get_codespec(&name, None).await?;
    Ok(Json(codespec))
}

pub async fn get_codespec_version(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, i64)>,
) -> Result<Json<Codespec>, AppError> {
    let codespec = state.repo.get_codespec(&name, Some(version)).await?;
    Ok(Json(codespec))
}

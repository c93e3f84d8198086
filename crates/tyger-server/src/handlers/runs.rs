//! `POST /runs`, `GET /runs`, `GET /runs/{id}`, `GET /runs/counts`,
//! `POST /runs/{id}/cancel`, `PUT /runs/{id}/tags`, `GET /runs/{id}/logs`
//! (spec.md §6).

use std::collections::HashMap;

use axum::extract::{Extension, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use tyger_core::error::TygerError;
use tyger_core::ports::RunListQuery;
use tyger_core::types::{
    ContinuationToken, Run, RunKind, RunStatus, RunWorker, DEFAULT_PAGE_SIZE, DEFAULT_RUN_TIMEOUT_SECONDS,
};
use tyger_logs::{LogFilter, LogFilterOptions};

use crate::error::{with_request_id, AppError};
use crate::request_id::RequestId;
use crate::state::AppState;

const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub job: tyger_core::types::RunJob,
    #[serde(default)]
    pub worker: Option<RunWorker>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

pub async fn create_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Json<Run>, AppError> {
    tyger_core::buffer::validate_tags(&req.tags).map_err(|e| with_request_id(e, &request_id))?;
    state
        .backend
        .validate_target(req.job.node_pool.as_deref(), req.cluster.as_deref())
        .await
        .map_err(|e| with_request_id(e, &request_id))?;

    let run = Run {
        id: 0, // assigned by the database on insert
        kind: RunKind::User,
        job: req.job,
        worker: req.worker,
        cluster: req.cluster,
        timeout_seconds: req.timeout_seconds.unwrap_or(DEFAULT_RUN_TIMEOUT_SECONDS),
        tags: req.tags,
        etag: String::new(),
        status: RunStatus::Pending,
        status_reason: None,
        running_count: None,
        created_at: chrono::Utc::now(),
        started_at: None,
        finished_at: None,
        resources_created: false,
        final_: false,
        logs_archived_at: None,
    };

    let idempotency_key = headers.get(IDEMPOTENCY_KEY_HEADER).and_then(|v| v.to_str().ok());
    let created = state.repo.create_run_with_idempotency(run, idempotency_key).await?;
    Ok(Json(created))
}

pub async fn get_run(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Run>, AppError> {
    let run = state.repo.get_run(id).await?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsParams {
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    #[serde(rename = "_ct")]
    pub continuation: Option<String>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
    Extension(request_id): Extension<RequestId>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tags = crate::handlers::extract_tag_filters(raw_query.as_deref().unwrap_or(""));
    let statuses = params
        .status
        .as_deref()
        .map(|s| s.split(','))
        .into_iter()
        .flatten()
        .filter_map(RunStatus::from_str_opt)
        .collect::<Vec<_>>();

    let continuation = params
        .continuation
        .map(|s| {
            let (created_at, id_low) = ContinuationToken::decode(&s).ok_or_else(|| {
                with_request_id(
                    TygerError::validation("InvalidRoute", "malformed continuation token"),
                    &request_id,
                )
            })?;
            Ok::<_, AppError>(ContinuationToken {
                created_at_nanos: created_at.timestamp_nanos_opt().unwrap_or(0),
                id_low: id_low as i64,
            })
        })
        .transpose()?;

    let page = state
        .repo
        .list_runs(RunListQuery {
            since: params.since,
            statuses,
            tags,
            limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            continuation,
        })
        .await?;
    Ok(Json(json!({ "items": page.items, "nextContinuationToken": page.next })))
}

#[derive(Debug, Deserialize)]
pub struct RunCountsParams {
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn run_counts(
    State(state): State<AppState>,
    Query(params): Query<RunCountsParams>,
    axum::extract::RawQuery(raw_query): axum::extract::RawQuery,
) -> Result<Json<HashMap<String, i64>>, AppError> {
    let tags = crate::handlers::extract_tag_filters(raw_query.as_deref().unwrap_or(""));
    let counts = state.repo.count_runs_by_status(params.since, tags).await?;
    Ok(Json(counts))
}

pub async fn cancel_run(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Run>, AppError> {
    let run = state.repo.get_run(id).await?;
    // Mirrors `tyger_core::engine::Controller::cancel` rather than calling
    // through it directly: the handler has no reference to the running
    // Controller instance, only to the shared repository and backend it
    // reconciles against (spec.md §4.D "idempotent cancel()", "request
    // backend delete"). Must request the backend delete here too — the
    // reconcile loop's `Canceling` branch only ever observes, it never
    // itself asks the backend to stop anything.
    if run.status.is_terminal() {
        return Ok(Json(run));
    }
    let canceled = state.repo.request_cancellation(id).await?;
    state.backend.cancel(&canceled).await?;
    Ok(Json(canceled))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRunTagsRequest {
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// `*` as `If-Match` means "must exist, don't care what version" (spec.md §6),
/// same convention as the buffer tags endpoint.
fn if_match_etag(headers: &HeaderMap) -> Option<String> {
    headers.get(axum::http::header::IF_MATCH).and_then(|v| v.to_str().ok()).map(str::to_string)
}

pub async fn update_run_tags(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Extension(request_id): Extension<RequestId>,
    Json(req): Json<UpdateRunTagsRequest>,
) -> Result<Json<Run>, AppError> {
    tyger_core::buffer::validate_tags(&req.tags).map_err(|e| with_request_id(e, &request_id))?;
    let expected_etag = if_match_etag(&headers);
    let run = state.repo.update_run_tags(id, req.tags, expected_etag.as_deref()).await?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct RunLogsParams {
    #[serde(default)]
    pub follow: bool,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub tail: Option<usize>,
    #[serde(default)]
    pub timestamps: bool,
}

/// Streams a run's logs: live from the backend while the run is active,
/// from the gzip archive once `logs_archived_at` is set (spec.md §4.E).
pub async fn get_run_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<RunLogsParams>,
    Extension(request_id): Extension<RequestId>,
) -> Result<impl IntoResponse, AppError> {
    let run = state.repo.get_run(id).await?;

    let filter_options = LogFilterOptions { include_timestamps: params.timestamps, tail_lines: params.tail, since: params.since };

    if run.logs_archived_at.is_some() {
        let archived = state.archive_sink.find(run.id).await.map_err(|e| {
            with_request_id(TygerError::Fatal(anyhow::anyhow!("archived log lookup failed: {e:?}")), &request_id)
        })?;
        let Some((path, line_count)) = archived else {
            return Err(with_request_id(TygerError::NotFound(format!("no archived logs for run {id}")), &request_id));
        };
        let byte_stream = tyger_logs::ArchiveSource::open_local(&path, true)
            .await
            .map_err(|e| with_request_id(TygerError::Fatal(anyhow::anyhow!("open archived log failed: {e:?}")), &request_id))?;
        let lines = tyger_logs::split_lines(byte_stream);
        let filter = LogFilter::new(filter_options);
        let filtered = filter.apply_with_known_total(lines, line_count);
        let body = axum::body::Body::from_stream(
            filtered.map(|r| r.map(|mut line| { line.push('\n'); line }).map_err(std::io::Error::other)),
        );
        return Ok(body.into_response());
    }

    if !params.follow {
        return Err(with_request_id(
            TygerError::validation("InvalidRoute", "logs not yet archived; retry with follow=true for a live tail"),
            &request_id,
        ));
    }

    let source = state.log_source.log_source(&run).await?;
    let byte_stream = source
        .open(params.since)
        .await
        .map_err(|e| with_request_id(TygerError::Transient(format!("log source open failed: {e:?}")), &request_id))?;
    let lines = tyger_logs::split_lines(byte_stream);
    let filter = LogFilter::new(filter_options);
    let filtered = filter.apply_live(lines);
    let body = axum::body::Body::from_stream(
        filtered.map(|r| r.map(|mut line| { line.push('\n'); line }).map_err(std::io::Error::other)),
    );
    Ok(body.into_response())
}

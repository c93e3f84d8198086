//! `Request-Id` on every response, per spec.md §6. The teacher relies on
//! `tower_http::trace::TraceLayer` alone for correlation; that layer logs a
//! request id but never surfaces it to the client, so this crate adds a
//! thin extension + response-header layer on top of it instead of
//! reinventing tracing middleware.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderValue, Request};
use std::convert::Infallible;
use tower_http::request_id::{MakeRequestId, RequestId as TowerRequestId};
use uuid::Uuid;

#[derive(Clone, Copy, Default)]
pub struct MakeTygerRequestId;

impl MakeRequestId for MakeTygerRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<TowerRequestId> {
        let value = HeaderValue::from_str(&Uuid::new_v4().to_string()).ok()?;
        Some(TowerRequestId::new(value))
    }
}

pub const HEADER_NAME_STR: &str = "request-id";

/// Handler-facing extractor for the id `MakeTygerRequestId` assigned this
/// request, read back from `tower_http::request_id::SetRequestIdLayer`'s
/// extension.
pub struct RequestId(pub String);

impl RequestId {
    pub const HEADER_NAME: &'static str = HEADER_NAME_STR;
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .extensions
            .get::<TowerRequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        Ok(RequestId(id))
    }
}

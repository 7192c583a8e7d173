//! Axum extractors for pipeline requests.

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Request},
    http::request::Parts,
};
use pipeline_core::{CorrelationId, RequestId, UserContext};
pub use pipeline_resilience::{CORRELATION_ID_HEADER, REQUEST_ID_HEADER};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::ApiError;

/// Caller id header
pub const USER_ID_HEADER: &str = "x-user-id";
/// Caller role header
pub const USER_ROLE_HEADER: &str = "x-user-role";
/// Caller institution header
pub const INSTITUTION_HEADER: &str = "x-institution-id";

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Request id from `x-request-id`, generated when absent
#[derive(Debug, Clone)]
pub struct RequestIdHeader(pub RequestId);

#[async_trait]
impl<S> FromRequestParts<S> for RequestIdHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header_str(parts, REQUEST_ID_HEADER)
            .map_or_else(RequestId::generate, RequestId::from);
        Ok(Self(id))
    }
}

/// Correlation id from `x-correlation-id`, generated when absent
#[derive(Debug, Clone)]
pub struct CorrelationIdHeader(pub CorrelationId);

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationIdHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(CorrelationId::from_optional(header_str(
            parts,
            CORRELATION_ID_HEADER,
        ))))
    }
}

/// Optional idempotency key
#[derive(Debug, Clone)]
pub struct IdempotencyKey(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let key = header_str(parts, "idempotency-key")
            .or_else(|| header_str(parts, "x-idempotency-key"))
            .map(String::from);
        if let Some(key) = &key {
            if key.len() > 256 {
                return Err(ApiError::bad_request(
                    "Idempotency key must be at most 256 characters",
                ));
            }
        }
        Ok(Self(key))
    }
}

/// Authenticated caller
///
/// Identity is asserted by the fronting auth proxy through `x-user-id`,
/// `x-user-role` and the optional `x-institution-id`.
#[derive(Debug, Clone)]
pub struct Caller(pub UserContext);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_str(parts, USER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthenticated("Missing X-User-Id header"))?;
        let role = header_str(parts, USER_ROLE_HEADER)
            .ok_or_else(|| ApiError::unauthenticated("Missing X-User-Role header"))?;

        let mut user = UserContext::new(user_id, role);
        if let Some(institution) = header_str(parts, INSTITUTION_HEADER) {
            user = user.with_institution(institution);
        }
        Ok(Self(user))
    }
}

/// JSON body extractor with API-shaped rejections
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = axum::body::Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read request body: {e}")))?;

        let value: T = serde_json::from_slice(&bytes).map_err(|e| {
            // Body may carry transcript text, so only the error position is logged
            debug!(line = e.line(), column = e.column(), "JSON parse error");
            ApiError::bad_request(format!("Invalid JSON: {e}"))
        })?;

        Ok(Self(value))
    }
}

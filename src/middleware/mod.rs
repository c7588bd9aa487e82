//! All endpoints require header `X-User-ID`; its value becomes the `user`
//! identity for authorization. Request parsing and authentication proper
//! (verifying that header came from a real session) is an external
//! collaborator -- this extractor only pulls the already-authenticated
//! identity out of the request.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use std::sync::Arc;

pub const USER_ID_HEADER: &str = "X-User-ID";

/// The caller's identity, as supplied by the upstream auth layer. Carried
/// through every handler that needs to check reservation/booking
/// ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromRequestParts<Arc<crate::AppState>> for UserId {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<crate::AppState>,
    ) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(StatusCode::UNAUTHORIZED)?;
        Ok(UserId(value.to_string()))
    }
}

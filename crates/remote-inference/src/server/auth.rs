//! Bearer-token authentication.
//!
//! Runs in front of routing, so unknown paths and the utility endpoints are
//! covered too. With no token configured every request passes.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use super::{handlers::error_response, AppState};
use crate::metrics;

const SCHEME: &str = "bearer ";

/// Credentials from an `Authorization` value. The scheme is matched
/// case-insensitively, the credentials are returned verbatim.
pub fn bearer_credentials(header_value: &str) -> Option<&str> {
    let scheme = header_value.get(..SCHEME.len())?;
    if scheme.eq_ignore_ascii_case(SCHEME) {
        Some(&header_value[SCHEME.len()..])
    } else {
        None
    }
}

pub fn is_authorized(expected: &str, header_value: Option<&str>) -> bool {
    header_value
        .and_then(bearer_credentials)
        .map_or(false, |presented| presented == expected)
}

pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.token.as_deref() {
        let header_value = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        if !is_authorized(expected, header_value) {
            let path = request.uri().path();
            if header_value.is_some() {
                warn!("Rejected request to {} with invalid credentials", path);
            } else {
                warn!("Rejected request to {} without credentials", path);
            }
            metrics::inc_request("unauthorized", StatusCode::UNAUTHORIZED.as_u16());
            return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    }

    next.run(request).await
}

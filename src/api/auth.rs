// =============================================================================
// API Authentication — bearer guard for the query surface
// =============================================================================
//
// Query endpoints require `Authorization: Bearer <token>`, checked against
// the token configured in RuntimeConfig (TICKFORGE_API_TOKEN overrides it
// from the environment). An empty configured token disables the query
// surface rather than opening it. Token comparison never short-circuits on
// the first mismatching byte.

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::api::ApiContext;
use crate::errors::CoreError;

/// Extractor proving the request carried the configured API token. Bound to
/// this engine's router state so the expected token comes from the runtime
/// configuration, not ambient process state.
pub struct AuthBearer;

/// Why a request was turned away.
pub enum AuthRejection {
    /// No token configured — the query surface is administratively off.
    Unconfigured(CoreError),
    /// Missing header, wrong scheme, or token mismatch.
    Denied,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::Unconfigured(err) => {
                let body = serde_json::json!({ "error": err.to_string(), "kind": err.kind() });
                (StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response()
            }
            Self::Denied => {
                let body = serde_json::json!({ "error": "invalid bearer token" });
                (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
            }
        }
    }
}

/// Pull the token out of an `Authorization` header value, accepting only
/// the Bearer scheme.
fn bearer_from_header(value: &str) -> Option<&str> {
    value.strip_prefix("Bearer ")
}

/// Timing-safe token comparison: XOR-accumulates over the longer of the two
/// lengths, so run time does not reveal where the first mismatch sits.
fn token_matches(presented: &str, expected: &str) -> bool {
    let a = presented.as_bytes();
    let b = expected.as_bytes();

    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<ApiContext>> for AuthBearer {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &Arc<ApiContext>,
    ) -> Result<Self, Self::Rejection> {
        let expected = ctx.state.config.api_token.as_str();
        if expected.is_empty() {
            warn!("api_token is not configured — query surface is disabled");
            return Err(AuthRejection::Unconfigured(CoreError::InvalidConfiguration(
                "api_token is not set".into(),
            )));
        }

        let presented = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_from_header);

        match presented {
            Some(token) if token_matches(token, expected) => Ok(AuthBearer),
            Some(_) => {
                warn!("query request presented an invalid API token");
                Err(AuthRejection::Denied)
            }
            None => {
                warn!("query request without a Bearer authorization header");
                Err(AuthRejection::Denied)
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_scheme_only() {
        assert_eq!(bearer_from_header("Bearer abc123"), Some("abc123"));
        assert_eq!(bearer_from_header("Basic abc123"), None);
        assert_eq!(bearer_from_header("bearer abc123"), None);
        assert_eq!(bearer_from_header(""), None);
    }

    #[test]
    fn matching_tokens_pass() {
        assert!(token_matches("s3cret", "s3cret"));
    }

    #[test]
    fn mismatched_tokens_fail_regardless_of_position() {
        assert!(!token_matches("x3cret", "s3cret"));
        assert!(!token_matches("s3crex", "s3cret"));
    }

    #[test]
    fn length_mismatch_fails_without_panicking() {
        assert!(!token_matches("s3cret-but-longer", "s3cret"));
        assert!(!token_matches("s3", "s3cret"));
        assert!(!token_matches("", "s3cret"));
    }
}

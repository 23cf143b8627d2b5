//! Identity extraction middleware.
//!
//! Verifies the bearer token and attaches a [`TenantContext`] to the request
//! scope. A missing token is not rejected here — the permission gate (via
//! the [`crate::authz::Identity`] extractor) turns that into 401 on routes
//! that need identity, so genuinely public handlers stay public.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

use loomerp_auth::{is_exempt, AuthError, TenantContext, TokenVerifier};

use crate::app::errors::json_error;

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn TokenVerifier>,
}

pub async fn identity_middleware(
    State(state): State<AuthState>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if is_exempt(req.uri().path()) {
        return next.run(req).await;
    }

    let Some(token) = extract_bearer(req.headers()) else {
        // No token: pass through; protected handlers reject via the gate.
        return next.run(req).await;
    };

    match state.verifier.verify(token) {
        Ok(claims) => {
            req.extensions_mut().insert(TenantContext::from(claims));
            next.run(req).await
        }
        Err(AuthError::Expired) => {
            json_error(StatusCode::UNAUTHORIZED, "token_expired", "token expired")
        }
        Err(AuthError::Invalid) | Err(AuthError::Missing) => {
            json_error(StatusCode::UNAUTHORIZED, "token_invalid", "token invalid")
        }
        Err(AuthError::KeyUnavailable(e)) => {
            tracing::error!(error = %e, "verification key unavailable");
            json_error(
                StatusCode::UNAUTHORIZED,
                "token_invalid",
                "token could not be verified",
            )
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = value {
            headers.insert(axum::http::header::AUTHORIZATION, value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer(&headers(Some("Bearer abc"))), Some("abc"));
        assert_eq!(extract_bearer(&headers(Some("Bearer  abc "))), Some("abc"));
        assert_eq!(extract_bearer(&headers(Some("Basic abc"))), None);
        assert_eq!(extract_bearer(&headers(Some("Bearer "))), None);
        assert_eq!(extract_bearer(&headers(None)), None);
    }
}

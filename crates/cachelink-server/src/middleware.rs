use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};

use crate::config::BasicAuthConfig;
use crate::error::ApiError;
use crate::metrics;

/// Rejects requests whose Basic credentials differ from the configured pair.
pub async fn basic_auth(
    State(expected): State<Arc<BasicAuthConfig>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let credentials = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| parse_basic_auth(h).ok());

    match credentials {
        Some((user, pass)) if user == expected.user && pass == expected.pass => {
            next.run(req).await
        }
        _ => {
            tracing::debug!(method = %req.method(), uri = %req.uri(), "Access rejected");
            ApiError::Unauthorized.into_response()
        }
    }
}

/// Records the request count and latency per matched route.
pub async fn http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(req).await;
    metrics::record_http_request(&method, &route, response.status().as_u16(), started.elapsed());
    response
}

/// Parse a "Basic <base64>" header into user and password.
fn parse_basic_auth(header: &str) -> Result<(String, String), String> {
    let credentials = header
        .strip_prefix("Basic ")
        .ok_or_else(|| "Authorization header must start with 'Basic '".to_string())?;

    let decoded = STANDARD
        .decode(credentials.trim())
        .map_err(|_| "Invalid base64 encoding in Authorization header".to_string())?;

    let decoded = String::from_utf8(decoded)
        .map_err(|_| "Invalid UTF-8 in decoded credentials".to_string())?;

    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| "Credentials must be in format 'user:pass'".to_string())?;

    Ok((user.to_string(), pass.to_string()))
}

//! Shared-secret bearer authentication for trigger and command routes.
//!
//! The periodic triggers and the command endpoints present
//! `Authorization: Bearer <cron_secret>`. An empty configured secret rejects
//! every request.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::rest::{AppState, ErrorResponse};

/// Compute SHA-256 hex digest.
fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compares digests so the check does not short-circuit on the first
/// differing byte of the secret.
pub fn secret_matches(presented: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let a = sha256_hex(presented);
    let b = sha256_hex(expected);
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Axum middleware that rejects requests without the shared secret.
pub async fn require_cron_secret(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(token) if secret_matches(token.trim(), &state.cron_secret) => next.run(req).await,
        _ => {
            warn!(path = %req.uri().path(), "Rejected request without valid secret");
            metrics::counter!("api.unauthorized").increment(1);
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "unauthorized".to_string(),
                    message: "Missing or invalid bearer secret".to_string(),
                }),
            )
                .into_response()
        }
    }
}

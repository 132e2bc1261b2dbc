// # API types
//
// The error envelope and the admin-token gate. Every failure body has the
// shape `{"error": {"code", "message"}}` with the code repeated in the
// `X-Resin-Error` header.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use super::ApiState;
use crate::error::ResinError;

pub const ERROR_HEADER: &str = "x-resin-error";

pub struct ApiError(pub ResinError);

impl From<ResinError> for ApiError {
    fn from(e: ResinError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = self.0.code();
        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.0.to_string(),
            }
        }));
        let mut response = (status, body).into_response();
        if let Ok(v) = HeaderValue::from_str(code) {
            response.headers_mut().insert(ERROR_HEADER, v);
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Standard `{"ok": true}`-style acknowledgements.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Json<Self> {
        Json(Self { ok: true })
    }
}

/// Mutating control-plane calls require the admin bearer token when one is
/// configured. Reads stay open.
pub async fn require_admin(
    State(state): State<Arc<ApiState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mutating = !matches!(*request.method(), Method::GET | Method::HEAD);
    if mutating && !state.settings.admin_token.is_empty() {
        let presented = request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");
        if presented != state.settings.admin_token {
            return ApiError(ResinError::AuthFailed(
                "admin token required".to_string(),
            ))
            .into_response();
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_error_envelope_shape() {
        let response = ApiError(ResinError::NotFound("platform x".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(ERROR_HEADER).unwrap(),
            "NOT_FOUND"
        );
        let bytes = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["error"]["code"], "NOT_FOUND");
        assert!(v["error"]["message"]
            .as_str()
            .unwrap()
            .contains("platform x"));
    }
}

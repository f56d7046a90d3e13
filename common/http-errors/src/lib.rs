use axum::{http::{StatusCode, HeaderValue}, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub missing_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "detail")] pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "retryAfterMs")] pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
pub enum ApiError {
    ForbiddenMissingRole { role: &'static str, trace_id: Option<Uuid> },
    Forbidden { trace_id: Option<Uuid> },
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    Internal { trace_id: Option<Uuid>, message: Option<String> },
    /// One of the media-gateway error-taxonomy codes (spec §7), carrying its own
    /// status code and an optional retry-after hint. `code` is owned because
    /// several variants (stage-contract violations, segment-failure counts)
    /// interpolate a dynamic suffix into it at construction time.
    Gateway {
        code: String,
        status: StatusCode,
        trace_id: Option<Uuid>,
        message: Option<String>,
        retry_after_ms: Option<u64>,
    },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self { Self::Internal { trace_id, message: Some(e.to_string()) } }
    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::BadRequest { code, trace_id, message: None } }

    pub fn gateway(code: impl Into<String>, status: StatusCode, trace_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self::Gateway { code: code.into(), status, trace_id, message: Some(message.into()), retry_after_ms: None }
    }

    pub fn gateway_with_retry(code: impl Into<String>, status: StatusCode, trace_id: Option<Uuid>, message: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::Gateway { code: code.into(), status, trace_id, message: Some(message.into()), retry_after_ms: Some(retry_after_ms) }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, error_code): (StatusCode, ErrorBody, String) = match self {
            ApiError::ForbiddenMissingRole { role, trace_id } => (
                StatusCode::FORBIDDEN,
                ErrorBody { code: "missing_role".into(), missing_role: Some(role.into()), trace_id, message: None, retry_after_ms: None },
                "missing_role".to_string()
            ),
            ApiError::Forbidden { trace_id } => (
                StatusCode::FORBIDDEN,
                ErrorBody { code: "forbidden".into(), missing_role: None, trace_id, message: None, retry_after_ms: None },
                "forbidden".to_string()
            ),
            ApiError::BadRequest { code, trace_id, message } => (
                StatusCode::BAD_REQUEST,
                ErrorBody { code: code.into(), missing_role: None, trace_id, message, retry_after_ms: None },
                code.to_string()
            ),
            ApiError::NotFound { code, trace_id } => (
                StatusCode::NOT_FOUND,
                ErrorBody { code: code.into(), missing_role: None, trace_id, message: None, retry_after_ms: None },
                code.to_string()
            ),
            ApiError::Internal { trace_id, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody { code: "internal_error".into(), missing_role: None, trace_id, message, retry_after_ms: None },
                "internal_error".to_string()
            ),
            ApiError::Gateway { code, status, trace_id, message, retry_after_ms } => (
                status,
                ErrorBody { code: code.clone(), missing_role: None, trace_id, message, retry_after_ms },
                code
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(&error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

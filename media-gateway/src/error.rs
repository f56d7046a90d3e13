use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common_http_errors::ApiError;
use uuid::Uuid;

/// The error taxonomy named in the gateway's error handling design: distinct
/// from HTTP status codes, carried verbatim in the `code` field of the JSON
/// envelope and in the `X-Error-Code` response header.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no valid keys in pool")]
    ApiKeyMissing,
    #[error("provider client not loaded")]
    RuntimeSdkUnavailable,
    #[error("every attempt returned an auth error")]
    AllKeysAuthFailed,
    #[error("every attempt returned a rate-limit error")]
    AllKeysRateLimited { retry_after_ms: u64 },
    #[error("allocator budget exhausted")]
    KeyPoolTimeout { retry_after_ms: u64 },
    #[error("mixed or other upstream failure: {summary}")]
    UpstreamModelFailed { summary: String },
    #[error("script exceeds the per-request word cap")]
    WordLimitExceeded,
    #[error("monthly VF budget exceeded")]
    MonthlyVfExceeded,
    #[error("daily generation limit reached")]
    DailyGenerationExceeded,
    #[error("service is in maintenance mode")]
    MaintenanceMode,
    #[error("hard concurrency limit reached")]
    HardConcurrencyLimit,
    #[error("temporary load shedding in effect")]
    SoftShedding { remaining_ms: u64 },
    #[error("stage contract violation: {stage}:{when}:missing={missing}")]
    StageContractViolation {
        stage: String,
        when: &'static str,
        missing: String,
    },
    #[error("{0} synthesis segment(s) failed under the strict policy")]
    TtsSegmentFailures(usize),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn stage_contract_violation(stage: impl Into<String>, when: &'static str, missing: &[String]) -> Self {
        Self::StageContractViolation {
            stage: stage.into(),
            when,
            missing: missing.join(","),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::ApiKeyMissing => "API_KEY_MISSING",
            Self::RuntimeSdkUnavailable => "RUNTIME_SDK_UNAVAILABLE",
            Self::AllKeysAuthFailed => "ALL_KEYS_AUTH_FAILED",
            Self::AllKeysRateLimited { .. } => "ALL_KEYS_RATE_LIMITED",
            Self::KeyPoolTimeout { .. } => "KEY_POOL_TIMEOUT",
            Self::UpstreamModelFailed { .. } => "UPSTREAM_MODEL_FAILED",
            Self::WordLimitExceeded => "word_limit_exceeded",
            Self::MonthlyVfExceeded => "MONTHLY_VF_EXCEEDED",
            Self::DailyGenerationExceeded => "DAILY_GENERATION_EXCEEDED",
            Self::MaintenanceMode => "maintenance_mode",
            Self::HardConcurrencyLimit => "hard_concurrency_limit",
            Self::SoftShedding { .. } => "soft_shedding",
            Self::StageContractViolation { .. } => "stage_contract_violation",
            Self::TtsSegmentFailures(_) => "tts_segment_failures",
            Self::NotFound => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status().as_u16()
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::ApiKeyMissing | Self::WordLimitExceeded | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RuntimeSdkUnavailable
            | Self::MaintenanceMode
            | Self::HardConcurrencyLimit
            | Self::SoftShedding { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::AllKeysAuthFailed
            | Self::AllKeysRateLimited { .. }
            | Self::KeyPoolTimeout { .. }
            | Self::UpstreamModelFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::MonthlyVfExceeded | Self::DailyGenerationExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::StageContractViolation { .. } | Self::TtsSegmentFailures(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::AllKeysRateLimited { retry_after_ms } => Some(*retry_after_ms),
            Self::KeyPoolTimeout { retry_after_ms } => Some(*retry_after_ms),
            Self::SoftShedding { remaining_ms } => Some(*remaining_ms),
            Self::MaintenanceMode => Some(15_000),
            Self::HardConcurrencyLimit => Some(2_000),
            _ => None,
        }
    }

    /// Builds the full error-taxonomy code including stage/when/missing suffixes,
    /// matching the literal format in the error handling design.
    fn full_code(&self) -> String {
        match self {
            Self::StageContractViolation { stage, when, missing } => {
                format!("stage_contract_violation:{stage}:{when}:missing={missing}")
            }
            Self::TtsSegmentFailures(n) => format!("tts_segment_failures:{n}"),
            other => other.code().to_string(),
        }
    }

    pub fn into_api_error(self, trace_id: Option<Uuid>) -> ApiError {
        let status = self.status();
        let retry_after_ms = self.retry_after_ms();
        let message = self.to_string();
        let code = self.full_code();
        match retry_after_ms {
            Some(ms) => ApiError::gateway_with_retry(code, status, trace_id, message, ms),
            None => ApiError::gateway(code, status, trace_id, message),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_api_error(None).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

//! Shared application state, assembled once at boot and cloned (cheaply,
//! behind `Arc`) into every request. Grounded on
//! `integration-gateway/src/app_state.rs`'s `AppState` shape.

use std::sync::Arc;

use axum::extract::FromRef;
use common_auth::JwtVerifier;

use crate::allocator::Allocator;
use crate::config::GatewayConfig;
use crate::guardian::Guardian;
use crate::job_engine::JobEngine;
use crate::metrics::GatewayMetrics;
use crate::quota::QuotaLedger;
use crate::tts_orchestrator::TtsOrchestrator;
use crate::upstream_clients::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub jwt_verifier: Arc<JwtVerifier>,
    pub metrics: Arc<GatewayMetrics>,
    pub allocator: Arc<Allocator>,
    pub guardian: Arc<Guardian>,
    pub quota: Arc<QuotaLedger>,
    pub job_engine: Arc<JobEngine>,
    pub gem_orchestrator: Arc<TtsOrchestrator>,
    pub kokoro_orchestrator: Arc<TtsOrchestrator>,
    pub gem_client: Arc<UpstreamClient>,
    pub kokoro_client: Arc<UpstreamClient>,
    pub http_client: reqwest::Client,
}

/// Lets `common_auth::AuthContext` (a `FromRequestParts<S>` extractor that
/// requires `Arc<JwtVerifier>: FromRef<S>`) pull the verifier straight out
/// of `AppState`, the same wiring `integration-gateway` would use if it
/// extracted `AuthContext` instead of its manual middleware.
impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_verifier.clone()
    }
}

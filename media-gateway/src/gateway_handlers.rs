//! HTTP surface (`spec.md` §6): thin handlers that call straight into the
//! allocator/orchestrator/job-engine/guardian/quota core, translating to
//! and from the wire shapes in this module. Grounded on
//! `integration-gateway/src/payment_handlers.rs`/`integration_handlers.rs`'s
//! handler shape (`State<AppState>` + typed JSON body + `Result<_, ApiError>`).

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_http_errors::ApiError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::GatewayError;
use crate::job_engine::Job;
use crate::security_context::RequestContext;
use crate::tts_orchestrator::{LineInput, SpeakerVoiceInput, SynthesisRequest};

fn trace_header(trace_id: Uuid) -> HeaderValue {
    HeaderValue::from_str(&trace_id.to_string()).unwrap_or_else(|_| HeaderValue::from_static("invalid"))
}

/// Minimal percent-encoding for a single response header value: the teacher's
/// stack carries no `percent-encoding`/`url` crate, and diagnostics is the
/// only place this gateway needs one, so it is hand-rolled narrowly here
/// rather than adding a dependency for one call site.
fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------
// /health, /system/version
// ---------------------------------------------------------------------

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.allocator.snapshot().await;
    Json(serde_json::json!({
        "status": "ok",
        "guardianMode": state.guardian.mode(),
        "inFlight": state.guardian.in_flight_total().await,
        "keyPool": {
            "healthyKeys": snapshot.healthy_keys,
            "atLimitKeys": snapshot.at_limit_keys,
            "totalKeys": snapshot.keys.len(),
        },
    }))
}

pub async fn system_version() -> Json<Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "build": option_env!("GIT_SHA").unwrap_or("dev"),
        "features": ["allocator", "tts_orchestrator", "job_engine", "guardian", "quota"],
    }))
}

// ---------------------------------------------------------------------
// /tts/synthesize
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SynthesizeSpeakerVoice {
    pub speaker: String,
    #[serde(rename = "voiceName")]
    pub voice_name: String,
}

#[derive(Debug, Deserialize)]
pub struct SynthesizeLine {
    #[serde(rename = "lineIndex")]
    pub line_index: usize,
    pub speaker: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct SynthesizeBody {
    pub text: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(rename = "targetVoice")]
    pub target_voice: String,
    #[serde(rename = "speakerVoices", default)]
    pub speaker_voices: Vec<SynthesizeSpeakerVoice>,
    #[serde(rename = "lineMap", default)]
    pub line_map: Option<Vec<SynthesizeLine>>,
    #[serde(rename = "studioPairGroups", default)]
    pub studio_pair_groups: bool,
    #[serde(rename = "requestedConcurrency", default = "default_concurrency")]
    pub requested_concurrency: usize,
    #[serde(rename = "adminToken", default)]
    pub admin_token: Option<String>,
}

fn default_concurrency() -> usize {
    1
}

pub async fn tts_synthesize(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<SynthesizeBody>,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4();
    let word_count = body.text.split_whitespace().count();
    if word_count > state.config.max_words_per_request {
        return Err(GatewayError::WordLimitExceeded.into_api_error(Some(ctx.trace_id)));
    }

    let engine = body.engine.clone().unwrap_or_else(|| "gem".to_string());
    // Per the admin-bypass decision (uid-in-allowlist is never sufficient
    // alone): the presented token must match the configured one too.
    let is_admin_present = body
        .admin_token
        .as_deref()
        .zip(state.config.admin_approval_token.as_deref())
        .is_some_and(|(presented, expected)| presented == expected);

    let _reservation = state
        .quota
        .reserve(ctx.uid, &request_id.to_string(), &engine, body.text.len() as u64, is_admin_present)
        .await
        .map_err(|err| err.into_api_error(Some(ctx.trace_id)))?;

    let ticket = state
        .guardian
        .admit("/tts/synthesize")
        .await
        .map_err(|err| err.into_api_error(Some(ctx.trace_id)))?;

    let orchestrator = if engine.eq_ignore_ascii_case("kokoro") {
        &state.kokoro_orchestrator
    } else {
        &state.gem_orchestrator
    };

    let req = SynthesisRequest {
        text: body.text.clone(),
        speaker_voices: body
            .speaker_voices
            .into_iter()
            .map(|v| SpeakerVoiceInput { speaker: v.speaker, voice_name: v.voice_name })
            .collect(),
        line_map: body.line_map.map(|lines| {
            lines
                .into_iter()
                .map(|l| LineInput { line_index: l.line_index, speaker: l.speaker, text: l.text })
                .collect()
        }),
        studio_pair_groups_requested: body.studio_pair_groups,
        requested_concurrency: body.requested_concurrency.max(1),
        target_voice: body.target_voice,
    };

    let outcome = orchestrator.synthesize(&req).await;

    match outcome {
        Ok(outcome) => {
            state.guardian.finish(ticket, 200, "").await;
            state
                .quota
                .commit(ctx.uid, &request_id.to_string())
                .await
                .map_err(|err| err.into_api_error(Some(ctx.trace_id)))?;

            let diagnostics = serde_json::to_string(&outcome.diagnostics).unwrap_or_default();
            let mut response = (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"))],
                outcome.wav,
            )
                .into_response();
            let headers = response.headers_mut();
            headers.insert("x-vf-request-id", HeaderValue::from_str(&request_id.to_string()).unwrap());
            headers.insert("x-voiceflow-trace-id", trace_header(ctx.trace_id));
            if let Ok(value) = HeaderValue::from_str(&url_encode(&diagnostics)) {
                headers.insert("x-voiceflow-diagnostics", value);
            }
            Ok(response)
        }
        Err(err) => {
            let status_code = err.status_code();
            state.guardian.finish(ticket, status_code, &err.to_string()).await;
            if let Err(revert_err) = state.quota.revert(ctx.uid, &request_id.to_string()).await {
                warn!(error = %revert_err, "quota revert failed after synthesis error");
            }
            Err(err.into_api_error(Some(ctx.trace_id)))
        }
    }
}

// ---------------------------------------------------------------------
// /services/dubbing/prepare
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct EnginePrepareState {
    pub engine: &'static str,
    pub state: &'static str,
}

pub async fn prepare_dubbing(State(state): State<AppState>, _ctx: RequestContext) -> Json<Vec<EnginePrepareState>> {
    let gem_online = state.gem_client.health().await;
    let kokoro_online = state.kokoro_client.health().await;
    Json(vec![
        EnginePrepareState { engine: "GEM", state: if gem_online { "online" } else { "failed" } },
        EnginePrepareState { engine: "KOKORO", state: if kokoro_online { "online" } else { "failed" } },
    ])
}

// ---------------------------------------------------------------------
// /dubbing/jobs/v2 and friends
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateDubbingJobBody {
    #[serde(rename = "sourcePath")]
    pub source_path: String,
    pub segments: Vec<SynthesizeLine>,
    #[serde(rename = "voiceMap", default)]
    pub voice_map: HashMap<String, String>,
    #[serde(rename = "targetVoice")]
    pub target_voice: String,
    #[serde(rename = "targetLanguage")]
    pub target_language: String,
}

#[derive(Debug, Serialize)]
pub struct CreateDubbingJobResponse {
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
}

pub async fn create_dubbing_job(
    State(state): State<AppState>,
    _ctx: RequestContext,
    Json(body): Json<CreateDubbingJobBody>,
) -> Result<Json<CreateDubbingJobResponse>, ApiError> {
    if body.segments.is_empty() {
        return Err(ApiError::bad_request("empty_segments", None));
    }

    let segments_json: Vec<Value> = body
        .segments
        .iter()
        .map(|s| serde_json::json!({"lineIndex": s.line_index, "speaker": s.speaker, "text": s.text}))
        .collect();
    let voice_map_json: Value =
        serde_json::to_value(&body.voice_map).unwrap_or_else(|_| Value::Object(Default::default()));

    // Seeds every key `stage1_preprocess` would otherwise need to produce
    // itself, plus the TTS stage's own inputs — `OpaqueStage::run` only
    // fills in what's still missing, so these real values survive intact.
    let mut ctx = HashMap::new();
    ctx.insert("source_path".to_string(), Value::String(body.source_path.clone()));
    ctx.insert("target_language".to_string(), Value::String(body.target_language.clone()));
    ctx.insert("segments".to_string(), Value::Array(segments_json));
    ctx.insert("voice_map".to_string(), voice_map_json);
    ctx.insert("target_voice".to_string(), Value::String(body.target_voice.clone()));
    ctx.insert("vocals".to_string(), Value::Bool(true));

    let preflight = serde_json::json!({
        "targetLanguage": body.target_language,
        "targetVoice": body.target_voice,
        "segmentCount": body.segments.len(),
    });

    let job_id = state.job_engine.enqueue(preflight, ctx).await;
    Ok(Json(CreateDubbingJobResponse { job_id }))
}

pub async fn get_dubbing_job(
    State(state): State<AppState>,
    _ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    state
        .job_engine
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| GatewayError::NotFound.into_api_error(None))
}

pub async fn cancel_dubbing_job(
    State(state): State<AppState>,
    _ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .job_engine
        .cancel(id)
        .await
        .map(|_| StatusCode::ACCEPTED)
        .map_err(|err| err.into_api_error(None))
}

/// Final-artifact download. The stages that would actually mux a dubbed
/// video (`stage7_world`..`stage9_lipsync`) are explicitly opaque per
/// `spec.md` §1 — this gateway never produces `resultPath` on disk, so a
/// completed job with no path yet set reports `not_found` rather than
/// fabricating a file.
pub async fn get_dubbing_job_result(
    State(state): State<AppState>,
    _ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let job = state
        .job_engine
        .get(id)
        .await
        .ok_or_else(|| GatewayError::NotFound.into_api_error(None))?;

    match job.result_path {
        Some(path) => Ok(Json(serde_json::json!({ "resultPath": path })).into_response()),
        None => Err(GatewayError::NotFound.into_api_error(None)),
    }
}

#[derive(Debug, Serialize)]
pub struct JobReport {
    #[serde(rename = "jobId")]
    pub job_id: Uuid,
    pub status: String,
    #[serde(rename = "stageTimeline")]
    pub stage_timeline: Value,
    #[serde(rename = "qualityGate")]
    pub quality_gate: Value,
    #[serde(rename = "failureReason")]
    pub failure_reason: Option<String>,
}

pub async fn get_dubbing_job_report(
    State(state): State<AppState>,
    _ctx: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<JobReport>, ApiError> {
    let job = state
        .job_engine
        .get(id)
        .await
        .ok_or_else(|| GatewayError::NotFound.into_api_error(None))?;

    Ok(Json(JobReport {
        job_id: job.id,
        status: serde_json::to_value(&job.status).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default(),
        stage_timeline: serde_json::to_value(&job.stage_timeline).unwrap_or(Value::Null),
        quality_gate: serde_json::to_value(&job.quality_gate).unwrap_or(Value::Null),
        failure_reason: job.failure_reason,
    }))
}

// ---------------------------------------------------------------------
// /ops/guardian/*
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RecentStatusesQuery {
    #[serde(rename = "recentStatuses", default)]
    pub recent_statuses: bool,
}

pub async fn guardian_status(
    State(state): State<AppState>,
    Query(query): Query<RecentStatusesQuery>,
    _ctx: RequestContext,
) -> Json<Value> {
    let route_stats = state.guardian.route_stats_snapshot(query.recent_statuses).await;
    let issues = state.guardian.detect_issues().await;
    let snapshot = state.allocator.snapshot().await;
    let gem_online = state.gem_client.health().await;
    let kokoro_online = state.kokoro_client.health().await;

    Json(serde_json::json!({
        "mode": state.guardian.mode(),
        "inFlight": state.guardian.in_flight_total().await,
        "pendingApprovals": state.guardian.pending_approval_count().await,
        "routeStats": route_stats,
        "issues": issues,
        "keyPool": {
            "healthyKeys": snapshot.healthy_keys,
            "atLimitKeys": snapshot.at_limit_keys,
            "totalKeys": snapshot.keys.len(),
        },
        "runtimes": { "gem": gem_online, "kokoro": kokoro_online },
    }))
}

#[derive(Debug, Deserialize)]
pub struct ScanBody {
    #[serde(rename = "autoFixMinor", default = "default_true")]
    pub auto_fix_minor: bool,
}

fn default_true() -> bool {
    true
}

pub async fn guardian_scan(
    State(state): State<AppState>,
    _ctx: RequestContext,
    Json(body): Json<ScanBody>,
) -> Json<Value> {
    let results = state.guardian.scan_and_remediate(body.auto_fix_minor).await;
    let payload: Vec<Value> = results
        .into_iter()
        .map(|(issue, execution)| {
            serde_json::json!({
                "issue": issue,
                "execution": execution,
            })
        })
        .collect();
    Json(serde_json::json!({ "results": payload }))
}

#[derive(Debug, Deserialize)]
pub struct ActionBody {
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "adminToken", default)]
    pub admin_token: Option<String>,
}

pub async fn guardian_actions(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(body): Json<ActionBody>,
) -> Result<Json<Value>, ApiError> {
    let severity = crate::guardian::action_severity(&body.action);
    match severity {
        Some(crate::guardian::Severity::Minor) => {
            let execution = state
                .guardian
                .execute_action(&body.action, body.payload, false, ctx.uid.to_string(), None)
                .await;
            Ok(Json(serde_json::to_value(&execution).unwrap_or(Value::Null)))
        }
        Some(crate::guardian::Severity::Major) => {
            if body.admin_token.is_some() && state.config.admin_uids.contains(&ctx.uid) {
                let execution = state
                    .guardian
                    .execute_action(&body.action, body.payload, false, ctx.uid.to_string(), None)
                    .await;
                Ok(Json(serde_json::to_value(&execution).unwrap_or(Value::Null)))
            } else {
                let (approval, _) = state
                    .guardian
                    .create_approval(&body.action, body.payload, ctx.uid.to_string(), "requested_via_api".to_string())
                    .await
                    .map_err(|err| err.into_api_error(Some(ctx.trace_id)))?;
                Ok(Json(serde_json::to_value(&approval).unwrap_or(Value::Null)))
            }
        }
        None => Err(GatewayError::BadRequest(format!("unsupported guardian action: {}", body.action)).into_api_error(Some(ctx.trace_id))),
    }
}

#[derive(Debug, Deserialize)]
pub struct ApprovalsQuery {
    #[serde(default = "default_status_filter")]
    pub status: String,
}

fn default_status_filter() -> String {
    "pending".to_string()
}

pub async fn list_guardian_approvals(
    State(state): State<AppState>,
    Query(query): Query<ApprovalsQuery>,
    _ctx: RequestContext,
) -> Json<Value> {
    let approvals = state.guardian.list_approvals(&query.status).await;
    Json(serde_json::json!({ "approvals": approvals }))
}

#[derive(Debug, Deserialize)]
pub struct ApprovalDecisionBody {
    pub approve: bool,
    #[serde(rename = "adminToken", default)]
    pub admin_token: Option<String>,
}

pub async fn decide_guardian_approval(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(id): Path<String>,
    Json(body): Json<ApprovalDecisionBody>,
) -> Result<Json<Value>, ApiError> {
    let approval = state
        .guardian
        .decide_approval(&id, body.approve, ctx.uid, body.admin_token.as_deref())
        .await
        .map_err(|err| err.into_api_error(Some(ctx.trace_id)))?;
    Ok(Json(serde_json::to_value(&approval).unwrap_or(Value::Null)))
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    state.metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::config::{AllocatorConfig, GatewayConfig};
    use crate::guardian::Guardian;
    use crate::job_engine::{build_stage_pipeline, JobEngine, JobStatus};
    use crate::metrics::GatewayMetrics;
    use crate::quota::QuotaLedger;
    use crate::state_store::InMemoryStateStore;
    use crate::tts_orchestrator::{EngineTag, TtsOrchestrator};
    use crate::upstream_clients::UpstreamClient;
    use common_auth::{JwtConfig, JwtVerifier};
    use reqwest::Client;
    use std::collections::HashSet;

    fn test_allocator_config() -> AllocatorConfig {
        serde_json::from_value(serde_json::json!({
            "version": "1",
            "windowSeconds": 60,
            "defaultWaitTimeoutMs": 1000,
            "models": [{"id": "m1", "rpm": 10, "tpm": 1000, "enabledFor": ["tts"]}],
            "routes": {"tts": ["m1"], "text": [], "ocr": []},
        }))
        .unwrap()
    }

    // Both runtimes point at an address nothing listens on, so orchestrator
    // calls fail fast and deterministically instead of hanging on a real
    // network wait.
    const UNREACHABLE_RUNTIME: &str = "http://127.0.0.1:1";

    fn test_state(admin_uid: Uuid) -> AppState {
        let allocator = Arc::new(Allocator::new(
            test_allocator_config(),
            vec!["AIzaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string()],
            300_000,
            50,
        ));
        let http_client = Client::new();
        let gem_client = Arc::new(UpstreamClient::new(http_client.clone(), UNREACHABLE_RUNTIME.to_string()));
        let kokoro_client = Arc::new(UpstreamClient::new(http_client.clone(), UNREACHABLE_RUNTIME.to_string()));

        let gem_orchestrator =
            Arc::new(TtsOrchestrator::new(allocator.clone(), (*gem_client).clone(), EngineTag::Gem, 1800, 250));
        let kokoro_orchestrator =
            Arc::new(TtsOrchestrator::new(allocator.clone(), (*kokoro_client).clone(), EngineTag::Kokoro, 1800, 250));

        let job_engine = Arc::new(JobEngine::new(build_stage_pipeline(gem_orchestrator.clone())));

        let mut admin_uids = HashSet::new();
        admin_uids.insert(admin_uid);

        let guardian = Arc::new(Guardian::new(
            "enforce".to_string(),
            64,
            96,
            true,
            180,
            80,
            admin_uids.clone(),
            Some("s3cr3t".to_string()),
            allocator.clone(),
            gem_client.clone(),
            kokoro_client.clone(),
        ));

        let mut rates = HashMap::new();
        rates.insert("gem".to_string(), 1.0);
        rates.insert("kokoro".to_string(), 0.4);
        let quota = Arc::new(QuotaLedger::new(Arc::new(InMemoryStateStore::new()), rates.clone(), admin_uids.clone()));

        let config = GatewayConfig {
            bind_addr: "0.0.0.0:0".to_string(),
            database_url: String::new(),
            allocator_config_path: String::new(),
            jwks_url: None,
            jwt_issuer: "media-gateway".to_string(),
            jwt_audience: "media-gateway".to_string(),
            admin_uids,
            admin_approval_token: Some("s3cr3t".to_string()),
            guardian_mode: "enforce".to_string(),
            soft_limit: 64,
            hard_limit: 96,
            auto_fix_minor: true,
            action_cooldown_secs: 180,
            approval_queue_capacity: 80,
            default_wait_slice_ms: 50,
            auth_disable_ms: 300_000,
            engine_rates: rates,
            max_words_per_request: 1800,
            silence_bridge_ms: 250,
            affinity_lru_capacity: 4096,
            gemini_runtime_url: UNREACHABLE_RUNTIME.to_string(),
            kokoro_runtime_url: UNREACHABLE_RUNTIME.to_string(),
        };

        AppState {
            config: Arc::new(config),
            jwt_verifier: Arc::new(JwtVerifier::new(JwtConfig::new("media-gateway", "media-gateway"))),
            metrics: Arc::new(GatewayMetrics::new()),
            allocator,
            guardian,
            quota,
            job_engine,
            gem_orchestrator,
            kokoro_orchestrator,
            gem_client,
            kokoro_client,
            http_client,
        }
    }

    fn ctx(uid: Uuid) -> RequestContext {
        RequestContext { uid, roles: vec![], trace_id: Uuid::new_v4() }
    }

    fn line(idx: usize, speaker: &str, text: &str) -> SynthesizeLine {
        SynthesizeLine { line_index: idx, speaker: speaker.to_string(), text: text.to_string() }
    }

    #[test]
    fn url_encode_passes_unreserved_and_escapes_the_rest() {
        assert_eq!(url_encode("abcXYZ019-_.~"), "abcXYZ019-_.~");
        assert_eq!(url_encode("a b/c"), "a%20b%2Fc");
    }

    #[tokio::test]
    async fn tts_synthesize_rejects_scripts_over_the_word_cap() {
        let state = test_state(Uuid::new_v4());
        let max_words = state.config.max_words_per_request;
        let body = SynthesizeBody {
            text: vec!["w"; max_words + 1].join(" "),
            engine: None,
            target_voice: "default".to_string(),
            speaker_voices: vec![],
            line_map: None,
            studio_pair_groups: false,
            requested_concurrency: 1,
            admin_token: None,
        };
        let err = tts_synthesize(State(state), ctx(Uuid::new_v4()), Json(body)).await.unwrap_err();
        assert!(matches!(err, ApiError::Gateway { ref code, .. } if code == "word_limit_exceeded"));
    }

    #[tokio::test]
    async fn tts_synthesize_reverts_quota_when_upstream_is_unreachable() {
        let state = test_state(Uuid::new_v4());
        let uid = Uuid::new_v4();
        let body = SynthesizeBody {
            text: "hello world".to_string(),
            engine: Some("gem".to_string()),
            target_voice: "default".to_string(),
            speaker_voices: vec![],
            line_map: None,
            studio_pair_groups: false,
            requested_concurrency: 1,
            admin_token: None,
        };
        let err = tts_synthesize(State(state.clone()), ctx(uid), Json(body)).await.unwrap_err();
        assert!(matches!(err, ApiError::Gateway { .. }));
        // The failed attempt must not leave an in-flight admission ticket open.
        assert_eq!(state.guardian.in_flight_total().await, 0);
        // And a retry with the same request body must be billable again,
        // which only holds if the earlier reservation was reverted.
        let reserved = state.quota.reserve(uid, "probe", "gem", 1, false).await.unwrap();
        assert!(reserved.bypass_reason.is_none());
    }

    #[tokio::test]
    async fn create_dubbing_job_rejects_empty_segments() {
        let state = test_state(Uuid::new_v4());
        let body = CreateDubbingJobBody {
            source_path: "in.mp4".to_string(),
            segments: vec![],
            voice_map: HashMap::new(),
            target_voice: "default".to_string(),
            target_language: "es".to_string(),
        };
        let err = create_dubbing_job(State(state), ctx(Uuid::new_v4()), Json(body)).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest { code: "empty_segments", .. }));
    }

    #[tokio::test]
    async fn completed_job_without_a_result_path_reports_not_found() {
        let state = test_state(Uuid::new_v4());
        let body = CreateDubbingJobBody {
            source_path: "in.mp4".to_string(),
            segments: vec![line(0, "A", "hi")],
            voice_map: HashMap::new(),
            target_voice: "default".to_string(),
            target_language: "es".to_string(),
        };
        let created = create_dubbing_job(State(state.clone()), ctx(Uuid::new_v4()), Json(body)).await.unwrap();
        let job_id = created.0.job_id;

        let mut job = state.job_engine.get(job_id).await.unwrap();
        let mut attempts = 0;
        while !matches!(job.status, JobStatus::Completed | JobStatus::Failed) && attempts < 50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            job = state.job_engine.get(job_id).await.unwrap();
            attempts += 1;
        }

        let err = get_dubbing_job_result(State(state), ctx(Uuid::new_v4()), Path(job_id)).await.unwrap_err();
        assert!(matches!(err, ApiError::Gateway { ref code, .. } if code == "not_found"));
    }

    #[tokio::test]
    async fn guardian_actions_runs_minor_actions_directly_without_an_approval() {
        let state = test_state(Uuid::new_v4());
        let body = ActionBody { action: "refresh_gemini_pool".to_string(), payload: Value::Null, admin_token: None };
        let result = guardian_actions(State(state), ctx(Uuid::new_v4()), Json(body)).await.unwrap();
        assert_eq!(result.0.get("ok").and_then(|v| v.as_bool()), Some(true));
    }

    #[tokio::test]
    async fn guardian_actions_queues_major_actions_without_admin_authorization() {
        let state = test_state(Uuid::new_v4());
        let body = ActionBody {
            action: "set_maintenance_mode".to_string(),
            payload: serde_json::json!({"enabled": true}),
            admin_token: None,
        };
        let result = guardian_actions(State(state), ctx(Uuid::new_v4()), Json(body)).await.unwrap();
        assert_eq!(result.0.get("status").and_then(|v| v.as_str()), Some("pending"));
    }

    #[tokio::test]
    async fn guardian_actions_rejects_an_unsupported_action_name() {
        let state = test_state(Uuid::new_v4());
        let body = ActionBody { action: "drop_all_tables".to_string(), payload: Value::Null, admin_token: None };
        let err = guardian_actions(State(state), ctx(Uuid::new_v4()), Json(body)).await.unwrap_err();
        assert!(matches!(err, ApiError::Gateway { ref code, .. } if code == "bad_request"));
    }

    #[tokio::test]
    async fn prepare_dubbing_reports_failed_when_runtimes_are_unreachable() {
        let state = test_state(Uuid::new_v4());
        let result = prepare_dubbing(State(state), ctx(Uuid::new_v4())).await;
        assert!(result.0.iter().all(|s| s.state == "failed"));
    }
}

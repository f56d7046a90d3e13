//! Bootstrap: config → state store → allocator → orchestrator → job engine
//! → guardian → gateway, each step logged the way
//! `integration-gateway/src/main.rs` logs its own bootstrap sequence.

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use common_auth::{JwtConfig, JwtVerifier};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};

use media_gateway::allocator::Allocator;
use media_gateway::app_state::AppState;
use media_gateway::config::{load_key_pool, AllocatorConfig, GatewayConfig};
use media_gateway::gateway_handlers;
use media_gateway::guardian::Guardian;
use media_gateway::job_engine::{build_stage_pipeline, JobEngine};
use media_gateway::metrics::GatewayMetrics;
use media_gateway::quota::QuotaLedger;
use media_gateway::state_store::{PostgresStateStore, SharedStateStore};
use media_gateway::tts_orchestrator::{EngineTag, TtsOrchestrator};
use media_gateway::upstream_clients::UpstreamClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = GatewayConfig::from_env()?;
    tracing::info!("config loaded");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let state_store: SharedStateStore = Arc::new(PostgresStateStore::new(pool));
    tracing::info!("state store connected");

    let allocator_config = AllocatorConfig::load(&config.allocator_config_path)?;
    let key_pool = load_key_pool()?;
    let allocator = Arc::new(Allocator::new(
        allocator_config,
        key_pool,
        config.auth_disable_ms,
        config.default_wait_slice_ms,
    ));
    tracing::info!("allocator ready");

    let http_client = reqwest::Client::builder().build()?;
    let gem_client = Arc::new(UpstreamClient::new(http_client.clone(), config.gemini_runtime_url.clone()));
    let kokoro_client = Arc::new(UpstreamClient::new(http_client.clone(), config.kokoro_runtime_url.clone()));

    let gem_orchestrator = Arc::new(TtsOrchestrator::new(
        allocator.clone(),
        (*gem_client).clone(),
        EngineTag::Gem,
        config.max_words_per_request,
        config.silence_bridge_ms,
    ));
    let kokoro_orchestrator = Arc::new(TtsOrchestrator::new(
        allocator.clone(),
        (*kokoro_client).clone(),
        EngineTag::Kokoro,
        config.max_words_per_request,
        config.silence_bridge_ms,
    ));
    tracing::info!("orchestrators ready");

    let job_engine = Arc::new(JobEngine::new(build_stage_pipeline(gem_orchestrator.clone())));
    tracing::info!("job engine ready");

    let guardian = Arc::new(Guardian::new(
        config.guardian_mode.clone(),
        config.soft_limit,
        config.hard_limit,
        config.auto_fix_minor,
        config.action_cooldown_secs,
        config.approval_queue_capacity,
        config.admin_uids.clone(),
        config.admin_approval_token.clone(),
        allocator.clone(),
        gem_client.clone(),
        kokoro_client.clone(),
    ));
    tracing::info!(mode = %guardian.mode(), "guardian ready");

    let quota = Arc::new(QuotaLedger::new(
        state_store.clone(),
        config.engine_rates.clone(),
        config.admin_uids.clone(),
    ));

    let jwt_config = JwtConfig::new(config.jwt_issuer.clone(), config.jwt_audience.clone()).with_leeway(30);
    let jwt_verifier = Arc::new(match &config.jwks_url {
        Some(url) => JwtVerifier::builder(jwt_config).with_jwks_url(url.clone()).build().await?,
        None => JwtVerifier::new(jwt_config),
    });

    let metrics = Arc::new(GatewayMetrics::new());

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        config: Arc::new(config.clone()),
        jwt_verifier,
        metrics,
        allocator,
        guardian,
        quota,
        job_engine,
        gem_orchestrator,
        kokoro_orchestrator,
        gem_client,
        kokoro_client,
        http_client,
    };

    let allowed_origins: Vec<HeaderValue> = std::env::var("CORS_ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string())
        .split(',')
        .filter_map(|origin| HeaderValue::from_str(origin.trim()).ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE, header::AUTHORIZATION]);

    let app = Router::new()
        .route("/health", get(gateway_handlers::health))
        .route("/system/version", get(gateway_handlers::system_version))
        .route("/metrics", get(gateway_handlers::metrics_endpoint))
        .route("/tts/synthesize", post(gateway_handlers::tts_synthesize))
        .route("/services/dubbing/prepare", post(gateway_handlers::prepare_dubbing))
        .route("/dubbing/jobs/v2", post(gateway_handlers::create_dubbing_job))
        .route("/dubbing/jobs/:id", get(gateway_handlers::get_dubbing_job))
        .route("/dubbing/jobs/:id/cancel", post(gateway_handlers::cancel_dubbing_job))
        .route("/dubbing/jobs/:id/result", get(gateway_handlers::get_dubbing_job_result))
        .route("/dubbing/jobs/:id/report", get(gateway_handlers::get_dubbing_job_report))
        .route("/ops/guardian/status", get(gateway_handlers::guardian_status))
        .route("/ops/guardian/scan", post(gateway_handlers::guardian_scan))
        .route("/ops/guardian/actions", post(gateway_handlers::guardian_actions))
        .route("/ops/guardian/approvals", get(gateway_handlers::list_guardian_approvals))
        .route("/ops/guardian/approvals/:id/decision", post(gateway_handlers::decide_guardian_approval))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "media-gateway listening");
    axum::serve(listener, app).await?;

    Ok(())
}

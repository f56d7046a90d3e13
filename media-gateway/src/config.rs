use std::collections::{HashMap, HashSet};
use std::env;

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use uuid::Uuid;

static API_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^AIza[A-Za-z0-9_-]{30,}$").expect("valid regex"));

/// Process-level settings, loaded from the environment the way
/// `integration-gateway`'s `GatewayConfig::from_env` loads its settings:
/// required vars fail fast with context, optional vars fall back to a
/// documented default.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub allocator_config_path: String,
    pub jwks_url: Option<String>,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub admin_uids: HashSet<Uuid>,
    pub admin_approval_token: Option<String>,
    pub guardian_mode: String,
    pub soft_limit: u32,
    pub hard_limit: u32,
    pub auto_fix_minor: bool,
    pub action_cooldown_secs: u64,
    pub approval_queue_capacity: usize,
    pub default_wait_slice_ms: u64,
    pub auth_disable_ms: u64,
    pub engine_rates: HashMap<String, f64>,
    pub max_words_per_request: usize,
    pub silence_bridge_ms: u64,
    pub affinity_lru_capacity: usize,
    pub gemini_runtime_url: String,
    pub kokoro_runtime_url: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let allocator_config_path = env::var("ALLOCATOR_CONFIG_PATH")
            .context("ALLOCATOR_CONFIG_PATH must be set")?;

        let jwks_url = env::var("JWKS_URL").ok();
        let jwt_issuer = env::var("JWT_ISSUER").unwrap_or_else(|_| "media-gateway".to_string());
        let jwt_audience = env::var("JWT_AUDIENCE").unwrap_or_else(|_| "media-gateway".to_string());

        let admin_uids = env::var("GUARDIAN_ADMIN_UIDS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|s| Uuid::parse_str(s.trim()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let admin_approval_token = env::var("GUARDIAN_ADMIN_APPROVAL_TOKEN").ok();

        let guardian_mode = env::var("GUARDIAN_MODE")
            .ok()
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| matches!(v.as_str(), "observe" | "enforce" | "manual"))
            .unwrap_or_else(|| "observe".to_string());

        let soft_limit = env::var("GUARDIAN_SOFT_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(64u32)
            .max(1);
        let hard_limit = env::var("GUARDIAN_HARD_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(96u32)
            .max(soft_limit);

        let auto_fix_minor = env::var("GUARDIAN_AUTO_FIX_MINOR")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        let action_cooldown_secs = env::var("GUARDIAN_ACTION_COOLDOWN_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(180u64);

        let approval_queue_capacity = env::var("GUARDIAN_APPROVAL_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(80usize)
            .max(1);

        let default_wait_slice_ms = env::var("ALLOCATOR_WAIT_SLICE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(250u64)
            .max(10);

        let auth_disable_ms = env::var("ALLOCATOR_AUTH_DISABLE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300_000u64);

        let engine_rates = parse_engine_rates(
            &env::var("ENGINE_VF_RATES").unwrap_or_else(|_| "gem=1.0,kokoro=0.4".to_string()),
        )?;

        let max_words_per_request = env::var("TTS_MAX_WORDS_PER_REQUEST")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1800usize)
            .max(1);

        let silence_bridge_ms = env::var("TTS_SILENCE_BRIDGE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(250u64);

        let affinity_lru_capacity = env::var("TTS_AFFINITY_LRU_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4096usize)
            .max(1);

        let gemini_runtime_url =
            env::var("GEMINI_RUNTIME_URL").context("GEMINI_RUNTIME_URL must be set")?;
        let kokoro_runtime_url =
            env::var("KOKORO_RUNTIME_URL").context("KOKORO_RUNTIME_URL must be set")?;

        Ok(Self {
            bind_addr,
            database_url,
            allocator_config_path,
            jwks_url,
            jwt_issuer,
            jwt_audience,
            admin_uids,
            admin_approval_token,
            guardian_mode,
            soft_limit,
            hard_limit,
            auto_fix_minor,
            action_cooldown_secs,
            approval_queue_capacity,
            default_wait_slice_ms,
            auth_disable_ms,
            engine_rates,
            max_words_per_request,
            silence_bridge_ms,
            affinity_lru_capacity,
            gemini_runtime_url,
            kokoro_runtime_url,
        })
    }
}

fn parse_engine_rates(raw: &str) -> Result<HashMap<String, f64>> {
    let mut out = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (engine, rate) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("malformed engine rate entry: {entry}"))?;
        let rate: f64 = rate
            .trim()
            .parse()
            .with_context(|| format!("invalid rate for engine {engine}"))?;
        out.insert(engine.trim().to_string(), rate);
    }
    Ok(out)
}

/// The allocator's required configuration document (external interface,
/// §6): model RPM/TPM budgets and per-task route order.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AllocatorConfig {
    pub version: String,
    #[serde(rename = "windowSeconds")]
    pub window_seconds: u64,
    #[serde(rename = "defaultWaitTimeoutMs")]
    pub default_wait_timeout_ms: u64,
    pub models: Vec<ModelConfig>,
    pub routes: RoutesConfig,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub rpm: u32,
    pub tpm: u32,
    #[serde(rename = "enabledFor")]
    pub enabled_for: Vec<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct RoutesConfig {
    #[serde(default)]
    pub tts: Vec<String>,
    #[serde(default)]
    pub text: Vec<String>,
    #[serde(default)]
    pub ocr: Vec<String>,
}

impl AllocatorConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading allocator config at {path}"))?;
        let config: Self =
            serde_json::from_str(&raw).context("parsing allocator config JSON")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(anyhow!("allocator config: version must be non-empty"));
        }
        if self.window_seconds == 0 {
            return Err(anyhow!("allocator config: windowSeconds must be > 0"));
        }
        if self.default_wait_timeout_ms == 0 {
            return Err(anyhow!("allocator config: defaultWaitTimeoutMs must be > 0"));
        }
        let by_id: HashMap<&str, &ModelConfig> =
            self.models.iter().map(|m| (m.id.as_str(), m)).collect();
        for model in &self.models {
            if model.rpm == 0 || model.tpm == 0 {
                return Err(anyhow!("allocator config: model {} must have rpm/tpm > 0", model.id));
            }
        }
        for (task, ids) in [
            ("tts", &self.routes.tts),
            ("text", &self.routes.text),
            ("ocr", &self.routes.ocr),
        ] {
            for id in ids {
                let model = by_id
                    .get(id.as_str())
                    .ok_or_else(|| anyhow!("route {task} references undefined model {id}"))?;
                if !model.enabled_for.iter().any(|t| t == task) {
                    return Err(anyhow!(
                        "route {task} references model {id} not enabled for {task}"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Loads the API key pool from the three sources in priority order
/// (file path env var, inline env var, single-key env var), deduplicating
/// while preserving first-seen order and rejecting keys that do not match
/// the provider's token pattern.
pub fn load_key_pool() -> Result<Vec<String>> {
    let raw_keys = if let Ok(path) = env::var("GEMINI_API_KEY_FILE") {
        std::fs::read_to_string(&path)
            .with_context(|| format!("reading key pool file at {path}"))?
    } else if let Ok(inline) = env::var("GEMINI_API_KEYS") {
        inline
    } else if let Ok(single) = env::var("GEMINI_API_KEY") {
        single
    } else {
        return Err(anyhow!("no API key source configured (GEMINI_API_KEY_FILE, GEMINI_API_KEYS, or GEMINI_API_KEY)"));
    };

    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for token in raw_keys.split(|c| c == '\n' || c == ',') {
        let token = token.trim();
        if token.is_empty() || seen.contains(token) {
            continue;
        }
        if !API_KEY_PATTERN.is_match(token) {
            tracing::warn!(fingerprint = %fingerprint(token), "rejecting key with invalid pattern");
            continue;
        }
        seen.insert(token.to_string());
        keys.push(token.to_string());
    }

    if keys.is_empty() {
        return Err(anyhow!("API_KEY_MISSING: key pool resolved to zero valid keys"));
    }

    Ok(keys)
}

/// Stable, log-safe short hash of an API key. Never log the raw key or any
/// prefix of it; only this fingerprint.
pub fn fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..4])
}

//! Request-admission shedder, route statistics, issue detection, and the
//! action-execution/approval pipeline.
//!
//! Grounded on `backend/app.py`'s `_ai_ops_*` function family (original
//! source): exempt-path admission, the throttle decision tree, bounded
//! route/error/approval/action-history lists, and the static action
//! severity table.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator::{Allocator, AllocatorSnapshot};
use crate::error::GatewayError;
use crate::upstream_clients::UpstreamClient;

const RECENT_STATUS_WINDOW: usize = 80;
const ERROR_BURST_MIN_SAMPLES: usize = 8;
const ERROR_BURST_WINDOW: usize = 20;
const ERROR_BURST_MIN_SERVER_ERRORS: usize = 4;
const ERROR_BURST_MIN_RATE: f64 = 0.40;
const MAX_RECENT_ERRORS: usize = 120;
const MAX_ACTION_HISTORY: usize = 200;
const SOFT_SHED_DURATION_MS: i64 = 30_000;

const EXEMPT_PATHS: &[&str] = &[
    "/health",
    "/system/version",
    "/ops/guardian/status",
    "/ops/guardian/scan",
    "/ops/guardian/approvals",
];

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn is_exempt_path(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path) || path.starts_with("/ops/guardian/") || path.starts_with("/docs")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Major,
}

/// Static action classification. Keep in one place, matching
/// `AI_OPS_MINOR_ACTIONS`/`AI_OPS_MAJOR_ACTIONS`.
pub(crate) fn action_severity(action: &str) -> Option<Severity> {
    match action {
        "restart_runtime" | "refresh_gemini_pool" | "enable_soft_shedding" => Some(Severity::Minor),
        "restart_all_runtimes" | "set_maintenance_mode" => Some(Severity::Major),
        _ => None,
    }
}

pub(crate) fn validate_action(action: &str) -> Result<&'static str, GatewayError> {
    match action {
        "restart_runtime" => Ok("restart_runtime"),
        "refresh_gemini_pool" => Ok("refresh_gemini_pool"),
        "enable_soft_shedding" => Ok("enable_soft_shedding"),
        "restart_all_runtimes" => Ok("restart_all_runtimes"),
        "set_maintenance_mode" => Ok("set_maintenance_mode"),
        other => Err(GatewayError::BadRequest(format!("unsupported guardian action: {other}"))),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteStats {
    pub requests: u64,
    pub success: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub rejected: u64,
    pub in_flight: i64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub last_status_code: Option<u16>,
    pub last_error: String,
    pub updated_at_ms: i64,
    pub recent_statuses: Vec<u16>,
}

impl RouteStats {
    fn push_status(&mut self, status: u16) {
        self.recent_statuses.push(status);
        let overflow = self.recent_statuses.len().saturating_sub(RECENT_STATUS_WINDOW);
        if overflow > 0 {
            self.recent_statuses.drain(0..overflow);
        }
    }

    fn recent_window_stats(&self) -> (usize, usize, f64) {
        let window_start = self.recent_statuses.len().saturating_sub(ERROR_BURST_WINDOW);
        let window = &self.recent_statuses[window_start..];
        let server_errors = window.iter().filter(|&&c| c >= 500).count();
        let rate = if window.is_empty() { 0.0 } else { server_errors as f64 / window.len() as f64 };
        (window.len(), server_errors, rate)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStatsSnapshot {
    pub requests: u64,
    pub success: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub rejected: u64,
    pub in_flight: i64,
    pub avg_latency_ms: f64,
    pub last_status_code: Option<u16>,
    pub last_error: String,
    pub updated_at_ms: i64,
    pub recent_window_size: usize,
    pub recent_server_errors: usize,
    pub recent_server_error_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_statuses: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentError {
    pub ts_ms: i64,
    pub path: String,
    pub status_code: u16,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Executed,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub id: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub severity: Severity,
    pub status: ApprovalStatus,
    pub requested_by: String,
    pub requested_at_ms: i64,
    pub updated_at_ms: i64,
    pub reason: String,
    pub decision_by: Option<String>,
    pub decision_at_ms: Option<i64>,
    pub execution: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionExecution {
    pub ok: bool,
    pub action: String,
    pub severity: Severity,
    pub payload: serde_json::Value,
    pub initiator: String,
    pub approval_id: Option<String>,
    pub detail: String,
    pub duration_ms: i64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub severity: Severity,
    pub message: String,
    pub action: Option<&'static str>,
    pub payload: serde_json::Value,
}

/// Admission rejection, distinct from [`GatewayError`] since callers also
/// need the reason string surfaced in route stats.
#[derive(Debug, Clone)]
pub struct AdmissionRejected {
    pub reason: &'static str,
    pub retry_after_ms: u64,
}

impl From<AdmissionRejected> for GatewayError {
    fn from(value: AdmissionRejected) -> Self {
        match value.reason {
            "maintenance_mode" => GatewayError::MaintenanceMode,
            "hard_concurrency_limit" => GatewayError::HardConcurrencyLimit,
            _ => GatewayError::SoftShedding { remaining_ms: value.retry_after_ms },
        }
    }
}

struct GuardianData {
    maintenance_mode: bool,
    temporary_shedding_until_ms: i64,
    in_flight_total: i64,
    in_flight_peak: i64,
    route_stats: HashMap<String, RouteStats>,
    recent_errors: Vec<RecentError>,
    pending_approvals: HashMap<String, Approval>,
    approval_order: Vec<String>,
    action_history: Vec<ActionExecution>,
    last_autofix_at_ms: HashMap<String, i64>,
}

impl GuardianData {
    fn new() -> Self {
        Self {
            maintenance_mode: false,
            temporary_shedding_until_ms: 0,
            in_flight_total: 0,
            in_flight_peak: 0,
            route_stats: HashMap::new(),
            recent_errors: Vec::new(),
            pending_approvals: HashMap::new(),
            approval_order: Vec::new(),
            action_history: Vec::new(),
            last_autofix_at_ms: HashMap::new(),
        }
    }

    fn route_mut(&mut self, path: &str) -> &mut RouteStats {
        self.route_stats.entry(path.to_string()).or_default()
    }

    fn record_backend_error(&mut self, path: &str, status_code: u16, detail: &str) {
        self.recent_errors.push(RecentError {
            ts_ms: now_ms(),
            path: path.to_string(),
            status_code,
            detail: detail.chars().take(320).collect(),
        });
        let overflow = self.recent_errors.len().saturating_sub(MAX_RECENT_ERRORS);
        if overflow > 0 {
            self.recent_errors.drain(0..overflow);
        }
    }
}

/// Completion handle returned by [`Guardian::admit`]; callers must call
/// [`finish`](AdmitTicket::finish) exactly once.
pub struct AdmitTicket {
    path: String,
    started_at_ms: i64,
}

/// Three responsibilities in one module: request admission, issue
/// detection, and action execution/approvals. Guarded by a single
/// `RwLock` since the status/scan read paths outnumber admission writes.
pub struct Guardian {
    data: RwLock<GuardianData>,
    mode: String,
    soft_limit: i64,
    hard_limit: i64,
    auto_fix_minor: bool,
    action_cooldown_ms: i64,
    approval_queue_capacity: usize,
    admin_uids: std::collections::HashSet<Uuid>,
    admin_approval_token: Option<String>,
    allocator: Arc<Allocator>,
    gem_client: Arc<UpstreamClient>,
    kokoro_client: Arc<UpstreamClient>,
}

impl Guardian {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: String,
        soft_limit: u32,
        hard_limit: u32,
        auto_fix_minor: bool,
        action_cooldown_secs: u64,
        approval_queue_capacity: usize,
        admin_uids: std::collections::HashSet<Uuid>,
        admin_approval_token: Option<String>,
        allocator: Arc<Allocator>,
        gem_client: Arc<UpstreamClient>,
        kokoro_client: Arc<UpstreamClient>,
    ) -> Self {
        Self {
            data: RwLock::new(GuardianData::new()),
            mode,
            soft_limit: soft_limit as i64,
            hard_limit: hard_limit as i64,
            auto_fix_minor,
            action_cooldown_ms: (action_cooldown_secs as i64) * 1000,
            approval_queue_capacity,
            admin_uids,
            admin_approval_token,
            allocator,
            gem_client,
            kokoro_client,
        }
    }

    /// Admission check + in-flight bookkeeping. Exempt paths always pass
    /// without touching state. On rejection, records one entry in the
    /// route's rejected/recentStatuses counters before returning the error.
    pub async fn admit(&self, path: &str) -> Result<AdmitTicket, GatewayError> {
        if is_exempt_path(path) {
            return Ok(AdmitTicket { path: path.to_string(), started_at_ms: now_ms() });
        }

        let rejection = {
            let guard = self.data.read().await;
            let now = now_ms();
            if guard.maintenance_mode {
                Some(AdmissionRejected { reason: "maintenance_mode", retry_after_ms: 15_000 })
            } else if self.mode != "enforce" {
                None
            } else if guard.in_flight_total >= self.hard_limit {
                Some(AdmissionRejected { reason: "hard_concurrency_limit", retry_after_ms: 2_000 })
            } else if guard.temporary_shedding_until_ms > now && guard.in_flight_total >= self.soft_limit {
                let remaining = (guard.temporary_shedding_until_ms - now).max(500) as u64;
                Some(AdmissionRejected { reason: "soft_shedding", retry_after_ms: remaining })
            } else {
                None
            }
        };

        if let Some(rejected) = rejection {
            let mut guard = self.data.write().await;
            let route = guard.route_mut(path);
            route.rejected += 1;
            route.push_status(503);
            route.last_status_code = Some(503);
            route.last_error = rejected.reason.to_string();
            route.updated_at_ms = now_ms();
            guard.record_backend_error(path, 503, rejected.reason);
            warn!(path, reason = rejected.reason, "guardian admission rejected");
            return Err(rejected.into());
        }

        let mut guard = self.data.write().await;
        guard.in_flight_total = (guard.in_flight_total + 1).max(0);
        guard.in_flight_peak = guard.in_flight_peak.max(guard.in_flight_total);
        let route = guard.route_mut(path);
        route.requests += 1;
        route.in_flight += 1;
        route.updated_at_ms = now_ms();

        Ok(AdmitTicket { path: path.to_string(), started_at_ms: now_ms() })
    }

    /// Closes out an admission ticket, folding elapsed time and the
    /// response status into route stats. Any 5xx or non-empty error
    /// detail is also appended to recent errors.
    pub async fn finish(&self, ticket: AdmitTicket, status_code: u16, error_detail: &str) {
        if is_exempt_path(&ticket.path) {
            return;
        }
        let elapsed_ms = (now_ms() - ticket.started_at_ms).max(0) as u64;
        let mut guard = self.data.write().await;
        guard.in_flight_total = (guard.in_flight_total - 1).max(0);

        let route = guard.route_mut(&ticket.path);
        route.in_flight = (route.in_flight - 1).max(0);
        route.total_latency_ms += elapsed_ms;
        let requests_total = route.requests.max(1);
        route.avg_latency_ms = route.total_latency_ms as f64 / requests_total as f64;
        route.push_status(status_code);
        route.last_status_code = Some(status_code);
        route.updated_at_ms = now_ms();

        if status_code >= 500 || !error_detail.is_empty() {
            let detail = if error_detail.is_empty() { format!("status_{status_code}") } else { error_detail.to_string() };
            route.last_error = detail.chars().take(320).collect();
            let path = ticket.path.clone();
            guard.record_backend_error(&path, status_code, &detail);
        }
    }

    pub async fn route_stats_snapshot(&self, include_recent_statuses: bool) -> HashMap<String, RouteStatsSnapshot> {
        let guard = self.data.read().await;
        guard
            .route_stats
            .iter()
            .map(|(path, stats)| {
                let (window_size, server_errors, rate) = stats.recent_window_stats();
                let snapshot = RouteStatsSnapshot {
                    requests: stats.requests,
                    success: stats.success,
                    client_errors: stats.client_errors,
                    server_errors: stats.server_errors,
                    rejected: stats.rejected,
                    in_flight: stats.in_flight,
                    avg_latency_ms: (stats.avg_latency_ms * 100.0).round() / 100.0,
                    last_status_code: stats.last_status_code,
                    last_error: stats.last_error.clone(),
                    updated_at_ms: stats.updated_at_ms,
                    recent_window_size: window_size,
                    recent_server_errors: server_errors,
                    recent_server_error_rate: (rate * 1000.0).round() / 1000.0,
                    recent_statuses: include_recent_statuses.then(|| stats.recent_statuses.clone()),
                };
                (path.clone(), snapshot)
            })
            .collect()
    }

    /// Scans runtime health, the Gemini allocator snapshot, and route
    /// stats for the static set of detectable issues.
    pub async fn detect_issues(&self) -> Vec<Issue> {
        let mut issues = Vec::new();

        let gem_healthy = self.gem_client.health().await;
        let kokoro_healthy = self.kokoro_client.health().await;
        let offline: Vec<&str> = [("GEM", gem_healthy), ("KOKORO", kokoro_healthy)]
            .into_iter()
            .filter_map(|(engine, healthy)| (!healthy).then_some(engine))
            .collect();

        match offline.len() {
            0 => {}
            1 => issues.push(Issue {
                id: "runtime_single_offline".to_string(),
                kind: "runtime_health",
                severity: Severity::Minor,
                message: format!("Runtime {} appears offline.", offline[0]),
                action: Some("restart_runtime"),
                payload: serde_json::json!({ "engine": offline[0] }),
            }),
            _ => issues.push(Issue {
                id: "runtime_multi_offline".to_string(),
                kind: "runtime_health",
                severity: Severity::Major,
                message: format!("Multiple runtimes offline: {}", offline.join(", ")),
                action: Some("restart_all_runtimes"),
                payload: serde_json::json!({}),
            }),
        }

        let in_flight = {
            let guard = self.data.read().await;
            guard.in_flight_total
        };
        if in_flight >= self.hard_limit {
            issues.push(Issue {
                id: "concurrency_hard_limit".to_string(),
                kind: "concurrency",
                severity: Severity::Major,
                message: format!("In-flight requests reached hard limit ({in_flight}/{}).", self.hard_limit),
                action: Some("set_maintenance_mode"),
                payload: serde_json::json!({ "enabled": true }),
            });
        } else if in_flight >= self.soft_limit {
            issues.push(Issue {
                id: "concurrency_soft_limit".to_string(),
                kind: "concurrency",
                severity: Severity::Minor,
                message: format!("In-flight requests reached soft limit ({in_flight}/{}).", self.soft_limit),
                action: Some("enable_soft_shedding"),
                payload: serde_json::json!({ "durationMs": SOFT_SHED_DURATION_MS }),
            });
        }

        let pool: AllocatorSnapshot = self.allocator.snapshot().await;
        if pool.keys.len() > 0 && pool.at_limit_keys >= pool.keys.len() {
            issues.push(Issue {
                id: "gemini_pool_at_capacity".to_string(),
                kind: "gemini_pool",
                severity: Severity::Minor,
                message: "Gemini key pool is fully at capacity.".to_string(),
                action: Some("refresh_gemini_pool"),
                payload: serde_json::json!({}),
            });
        }
        let unhealthy_keys = pool.keys.len().saturating_sub(pool.healthy_keys);
        if pool.keys.len() > 0 && unhealthy_keys >= pool.keys.len() {
            issues.push(Issue {
                id: "gemini_pool_all_unhealthy".to_string(),
                kind: "gemini_pool",
                severity: Severity::Major,
                message: "All Gemini keys are currently unhealthy.".to_string(),
                action: None,
                payload: serde_json::json!({}),
            });
        }

        issues.extend(self.detect_route_error_bursts().await);
        issues
    }

    async fn detect_route_error_bursts(&self) -> Vec<Issue> {
        let guard = self.data.read().await;
        let mut issues = Vec::new();
        for (path, stats) in guard.route_stats.iter() {
            if stats.recent_statuses.len() < ERROR_BURST_MIN_SAMPLES {
                continue;
            }
            let (window_size, server_errors, rate) = stats.recent_window_stats();
            if server_errors >= ERROR_BURST_MIN_SERVER_ERRORS && rate >= ERROR_BURST_MIN_RATE {
                issues.push(Issue {
                    id: format!("route_burst_{:04x}", route_hash(path)),
                    kind: "backend_route_error_burst",
                    severity: Severity::Minor,
                    message: format!("Route {path} has elevated 5xx errors ({server_errors}/{window_size})."),
                    action: Some("enable_soft_shedding"),
                    payload: serde_json::json!({ "durationMs": SOFT_SHED_DURATION_MS }),
                });
            }
        }
        issues
    }

    fn autofix_key(action: &str, payload: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(payload).unwrap_or_default());
        let digest = hasher.finalize();
        format!("{action}:{}", hex::encode(&digest[..6]))
    }

    async fn autofix_allowed(&self, action: &str, payload: &serde_json::Value) -> bool {
        let key = Self::autofix_key(action, payload);
        let guard = self.data.read().await;
        let last_run = guard.last_autofix_at_ms.get(&key).copied().unwrap_or(0);
        now_ms() - last_run >= self.action_cooldown_ms
    }

    async fn mark_autofix(&self, action: &str, payload: &serde_json::Value) {
        let key = Self::autofix_key(action, payload);
        let mut guard = self.data.write().await;
        guard.last_autofix_at_ms.insert(key, now_ms());
    }

    fn admin_authorized(&self, uid: Uuid, provided_token: Option<&str>) -> bool {
        if self.admin_uids.is_empty() || !self.admin_uids.contains(&uid) {
            return false;
        }
        match (&self.admin_approval_token, provided_token) {
            (Some(expected), Some(provided)) => expected == provided,
            _ => false,
        }
    }

    /// Runs a detection scan and, for each issue carrying an action,
    /// either auto-fixes minor issues (cooldown-gated) or creates a
    /// pending approval. Returns the issues alongside what was done.
    pub async fn scan_and_remediate(&self, auto_fix_minor: bool) -> Vec<(Issue, Option<ActionExecution>)> {
        let issues = self.detect_issues().await;
        let mut results = Vec::with_capacity(issues.len());
        for issue in issues {
            let Some(action) = issue.action else {
                results.push((issue, None));
                continue;
            };
            let minor = issue.severity == Severity::Minor;
            if minor && auto_fix_minor && self.auto_fix_minor && self.autofix_allowed(action, &issue.payload).await {
                self.mark_autofix(action, &issue.payload).await;
                let execution = self.execute_action(action, issue.payload.clone(), false, "autofix".to_string(), None).await;
                results.push((issue, Some(execution)));
            } else {
                self.create_approval(action, issue.payload.clone(), "system".to_string(), "auto_detected_issue".to_string()).await;
                results.push((issue, None));
            }
        }
        results
    }

    fn find_pending_approval_locked(data: &GuardianData, action: &str, payload: &serde_json::Value) -> Option<Approval> {
        data.pending_approvals
            .values()
            .find(|a| a.status == ApprovalStatus::Pending && a.action == action && &a.payload == payload)
            .cloned()
    }

    /// Creates a pending approval, deduplicating against an existing
    /// pending approval with the same action+payload.
    pub async fn create_approval(
        &self,
        action: &str,
        payload: serde_json::Value,
        requested_by: String,
        reason: String,
    ) -> Result<(Approval, bool), GatewayError> {
        let normalized = validate_action(action)?;
        let severity = action_severity(normalized).expect("validated action has a severity");

        let mut guard = self.data.write().await;
        if let Some(existing) = Self::find_pending_approval_locked(&guard, normalized, &payload) {
            return Ok((existing, false));
        }

        let id = format!("aop_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let now = now_ms();
        let approval = Approval {
            id: id.clone(),
            action: normalized.to_string(),
            payload,
            severity,
            status: ApprovalStatus::Pending,
            requested_by,
            requested_at_ms: now,
            updated_at_ms: now,
            reason,
            decision_by: None,
            decision_at_ms: None,
            execution: None,
        };
        guard.pending_approvals.insert(id.clone(), approval.clone());
        guard.approval_order.push(id.clone());
        let overflow = guard.approval_order.len().saturating_sub(self.approval_queue_capacity.max(1));
        if overflow > 0 {
            let evicted: Vec<String> = guard.approval_order.drain(0..overflow).collect();
            for evicted_id in evicted {
                guard.pending_approvals.remove(&evicted_id);
            }
        }
        info!(action = normalized, id = %id, "guardian approval created");
        Ok((approval, true))
    }

    pub async fn list_approvals(&self, status_filter: &str) -> Vec<Approval> {
        let guard = self.data.read().await;
        let filter = status_filter.to_ascii_lowercase();
        guard
            .approval_order
            .iter()
            .rev()
            .filter_map(|id| guard.pending_approvals.get(id))
            .filter(|a| {
                filter == "all"
                    || match a.status {
                        ApprovalStatus::Pending => filter == "pending",
                        ApprovalStatus::Executed => filter == "executed",
                        ApprovalStatus::Rejected => filter == "rejected",
                        ApprovalStatus::Failed => filter == "failed",
                    }
            })
            .cloned()
            .collect()
    }

    /// Approves or rejects a pending approval. Requires a valid admin
    /// token and allowlisted uid. On approve, runs the action through the
    /// same execution path autofix uses.
    pub async fn decide_approval(
        &self,
        approval_id: &str,
        approve: bool,
        admin_uid: Uuid,
        admin_token: Option<&str>,
    ) -> Result<Approval, GatewayError> {
        if !self.admin_authorized(admin_uid, admin_token) {
            return Err(GatewayError::BadRequest("admin approval requires an allowlisted uid and a valid token".to_string()));
        }

        let (action, payload) = {
            let guard = self.data.read().await;
            let approval = guard.pending_approvals.get(approval_id).ok_or(GatewayError::NotFound)?;
            if approval.status != ApprovalStatus::Pending {
                return Err(GatewayError::BadRequest("approval already decided".to_string()));
            }
            (approval.action.clone(), approval.payload.clone())
        };

        if !approve {
            let mut guard = self.data.write().await;
            let approval = guard.pending_approvals.get_mut(approval_id).ok_or(GatewayError::NotFound)?;
            approval.status = ApprovalStatus::Rejected;
            approval.decision_by = Some(admin_uid.to_string());
            approval.decision_at_ms = Some(now_ms());
            approval.updated_at_ms = now_ms();
            return Ok(approval.clone());
        }

        let execution = self
            .execute_action(&action, payload, false, admin_uid.to_string(), Some(approval_id.to_string()))
            .await;

        let mut guard = self.data.write().await;
        let approval = guard.pending_approvals.get_mut(approval_id).ok_or(GatewayError::NotFound)?;
        approval.status = if execution.ok { ApprovalStatus::Executed } else { ApprovalStatus::Failed };
        approval.decision_by = Some(admin_uid.to_string());
        approval.decision_at_ms = Some(now_ms());
        approval.updated_at_ms = now_ms();
        approval.execution = serde_json::to_value(&execution).ok();
        Ok(approval.clone())
    }

    /// Executes a guardian action directly, bypassing approval — used by
    /// auto-fix and by an already-approved decision. Appends the outcome
    /// to the bounded action-history ring regardless of success.
    pub async fn execute_action(
        &self,
        action: &str,
        payload: serde_json::Value,
        _gpu: bool,
        initiator: String,
        approval_id: Option<String>,
    ) -> ActionExecution {
        let started_ms = now_ms();
        let normalized = match validate_action(action) {
            Ok(a) => a,
            Err(err) => {
                let execution = ActionExecution {
                    ok: false,
                    action: action.to_string(),
                    severity: Severity::Major,
                    payload,
                    initiator,
                    approval_id,
                    detail: err.to_string(),
                    duration_ms: 0,
                    timestamp_ms: started_ms,
                };
                self.append_action_history(execution.clone()).await;
                return execution;
            }
        };
        let severity = action_severity(normalized).expect("validated action has a severity");

        let (ok, detail) = match normalized {
            "enable_soft_shedding" => {
                let duration_ms = payload
                    .get("durationMs")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(SOFT_SHED_DURATION_MS)
                    .clamp(5_000, 300_000);
                let until_ms = now_ms() + duration_ms;
                let mut guard = self.data.write().await;
                guard.temporary_shedding_until_ms = guard.temporary_shedding_until_ms.max(until_ms);
                (true, format!("Soft traffic shedding enabled until {until_ms}."))
            }
            "set_maintenance_mode" => {
                let enabled = payload.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true);
                let mut guard = self.data.write().await;
                guard.maintenance_mode = enabled;
                (true, format!("Maintenance mode set to {enabled}."))
            }
            "refresh_gemini_pool" => {
                if self.allocator.key_pool_size().await == 0 {
                    (false, "Gemini key pool is empty.".to_string())
                } else {
                    (true, "Gemini key pool refreshed.".to_string())
                }
            }
            "restart_runtime" | "restart_all_runtimes" => {
                // Runtime process supervision lives outside this service's
                // process boundary (docker/systemd); this gateway cannot
                // restart a runtime itself, but acknowledges the request and
                // records the post-acknowledgment health it observes.
                let gem_up = self.gem_client.health().await;
                let kokoro_up = self.kokoro_client.health().await;
                (
                    true,
                    format!(
                        "restart acknowledged; runtime supervision is external (gem_up={gem_up}, kokoro_up={kokoro_up})"
                    ),
                )
            }
            _ => unreachable!("validate_action rejects unknown actions"),
        };

        let execution = ActionExecution {
            ok,
            action: normalized.to_string(),
            severity,
            payload,
            initiator,
            approval_id,
            detail,
            duration_ms: (now_ms() - started_ms).max(0),
            timestamp_ms: now_ms(),
        };
        self.append_action_history(execution.clone()).await;
        execution
    }

    async fn append_action_history(&self, execution: ActionExecution) {
        let mut guard = self.data.write().await;
        guard.action_history.push(execution);
        let overflow = guard.action_history.len().saturating_sub(MAX_ACTION_HISTORY);
        if overflow > 0 {
            guard.action_history.drain(0..overflow);
        }
    }

    pub async fn action_history(&self) -> Vec<ActionExecution> {
        self.data.read().await.action_history.clone()
    }

    pub async fn recent_errors(&self) -> Vec<RecentError> {
        self.data.read().await.recent_errors.clone()
    }

    pub async fn pending_approval_count(&self) -> usize {
        self.data
            .read()
            .await
            .pending_approvals
            .values()
            .filter(|a| a.status == ApprovalStatus::Pending)
            .count()
    }

    pub async fn in_flight_total(&self) -> i64 {
        self.data.read().await.in_flight_total
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }
}

fn route_hash(path: &str) -> u16 {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    u16::from_be_bytes([digest[0], digest[1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Allocator;
    use crate::config::AllocatorConfig;
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

    fn guardian(mode: &str) -> Guardian {
        guardian_with_admin(mode, HashSet::new(), None)
    }

    fn guardian_with_admin(mode: &str, admin_uids: HashSet<Uuid>, admin_approval_token: Option<String>) -> Guardian {
        let allocator = Arc::new(Allocator::new(test_allocator_config(), vec!["AIzaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string()], 300_000, 50));
        let gem = Arc::new(UpstreamClient::new(Client::new(), "http://127.0.0.1:1".to_string()));
        let kokoro = Arc::new(UpstreamClient::new(Client::new(), "http://127.0.0.1:1".to_string()));
        Guardian::new(
            mode.to_string(),
            2,
            4,
            true,
            180,
            80,
            admin_uids,
            admin_approval_token,
            allocator,
            gem,
            kokoro,
        )
    }

    #[tokio::test]
    async fn exempt_paths_bypass_admission_entirely() {
        let g = guardian("enforce");
        g.admit("/health").await.unwrap();
        assert_eq!(g.in_flight_total().await, 0);
    }

    #[tokio::test]
    async fn observe_mode_never_rejects() {
        let g = guardian("observe");
        for _ in 0..10 {
            g.admit("/tts/synthesize").await.unwrap();
        }
        assert_eq!(g.in_flight_total().await, 10);
    }

    #[tokio::test]
    async fn enforce_mode_rejects_at_hard_limit() {
        let g = guardian("enforce");
        for _ in 0..4 {
            g.admit("/tts/synthesize").await.unwrap();
        }
        let err = g.admit("/tts/synthesize").await.unwrap_err();
        assert!(matches!(err, GatewayError::HardConcurrencyLimit));
    }

    #[tokio::test]
    async fn maintenance_mode_rejects_even_under_soft_limit() {
        let g = guardian("enforce");
        g.execute_action("set_maintenance_mode", serde_json::json!({"enabled": true}), false, "test".to_string(), None).await;
        let err = g.admit("/tts/synthesize").await.unwrap_err();
        assert!(matches!(err, GatewayError::MaintenanceMode));
    }

    #[tokio::test]
    async fn approval_dedup_returns_existing_pending_entry() {
        let g = guardian("enforce");
        let (first, created_first) = g
            .create_approval("set_maintenance_mode", serde_json::json!({"enabled": true}), "system".to_string(), "test".to_string())
            .await
            .unwrap();
        let (second, created_second) = g
            .create_approval("set_maintenance_mode", serde_json::json!({"enabled": true}), "system".to_string(), "test".to_string())
            .await
            .unwrap();
        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn decide_approval_requires_admin_authorization() {
        let g = guardian("enforce");
        let (approval, _) = g
            .create_approval("restart_all_runtimes", serde_json::json!({}), "system".to_string(), "test".to_string())
            .await
            .unwrap();
        let err = g.decide_approval(&approval.id, true, Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn decide_approval_with_valid_admin_authorization_executes_and_transitions_to_executed() {
        let admin_uid = Uuid::new_v4();
        let mut admin_uids = HashSet::new();
        admin_uids.insert(admin_uid);
        let g = guardian_with_admin("enforce", admin_uids, Some("s3cr3t".to_string()));

        let (approval, _) = g
            .create_approval("restart_all_runtimes", serde_json::json!({}), "system".to_string(), "test".to_string())
            .await
            .unwrap();

        let decided = g.decide_approval(&approval.id, true, admin_uid, Some("s3cr3t")).await.unwrap();
        assert_eq!(decided.status, ApprovalStatus::Executed);
        assert_eq!(decided.decision_by, Some(admin_uid.to_string()));
    }

    #[test]
    fn unknown_action_is_rejected_by_validate() {
        assert!(validate_action("drop_all_tables").is_err());
    }

    #[test]
    fn route_burst_detection_requires_minimum_sample_and_rate() {
        let mut stats = RouteStats::default();
        for _ in 0..7 {
            stats.push_status(500);
        }
        let (_, server_errors, _) = stats.recent_window_stats();
        assert_eq!(server_errors, 7);
    }
}

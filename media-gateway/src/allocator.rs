use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{fingerprint, AllocatorConfig, ModelConfig};
use crate::upstream_clients::ErrorKind;

#[derive(Debug, Clone)]
struct KeyState {
    raw: String,
    fingerprint: String,
    in_flight: i64,
    requests_total: u64,
    successes: u64,
    failures: u64,
    auth_failures: u64,
    rate_limit_strikes: u64,
    auth_disabled_until: Option<Instant>,
}

impl KeyState {
    fn new(raw: String) -> Self {
        let fp = fingerprint(&raw);
        Self {
            raw,
            fingerprint: fp,
            in_flight: 0,
            requests_total: 0,
            successes: 0,
            failures: 0,
            auth_failures: 0,
            rate_limit_strikes: 0,
            auth_disabled_until: None,
        }
    }

    fn is_auth_disabled(&self, now: Instant) -> bool {
        self.auth_disabled_until.map(|t| now < t).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
struct LaneState {
    window_start: Instant,
    counted_requests: u32,
    counted_tokens: u64,
    in_flight_requests: u32,
    in_flight_tokens: u64,
    temp_block_until: Option<Instant>,
}

impl LaneState {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            counted_requests: 0,
            counted_tokens: 0,
            in_flight_requests: 0,
            in_flight_tokens: 0,
            temp_block_until: None,
        }
    }

    fn maybe_rollover(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.counted_requests = 0;
            self.counted_tokens = 0;
            self.in_flight_requests = 0;
            self.in_flight_tokens = 0;
            self.temp_block_until = None;
        }
    }

    fn window_reset_in(&self, now: Instant, window: Duration) -> Duration {
        let elapsed = now.duration_since(self.window_start);
        window.checked_sub(elapsed).unwrap_or(Duration::ZERO)
    }
}

/// Opaque admission ticket. Must be released exactly once.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: Uuid,
    pub key_index: usize,
    pub key_fingerprint: String,
    pub model: String,
    pub reserved_tokens: u64,
    pub reserved_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Healthy,
    InFlight,
    RateLimited,
    AuthIssue,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub fingerprint: String,
    pub status: &'static str,
    pub in_flight: i64,
    pub requests_total: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSnapshot {
    pub model: String,
    pub rpm: u32,
    pub tpm: u32,
    pub counted_requests: u32,
    pub counted_tokens: u64,
    pub in_flight_requests: u32,
    pub in_flight_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocatorSnapshot {
    pub keys: Vec<KeySnapshot>,
    pub models: Vec<ModelSnapshot>,
    pub healthy_keys: usize,
    pub at_limit_keys: usize,
    pub in_flight_total: i64,
    pub next_index: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct AcquireOutcome {
    pub waited_ms: u64,
    pub retry_after_ms: u64,
    pub timed_out: bool,
}

struct Inner {
    keys: Vec<KeyState>,
    lanes: HashMap<(usize, String), LaneState>,
    next_index: usize,
    /// Speaker→key affinity LRU. Lives behind the same lock as key state so
    /// eviction on auth failure is atomic with the key disable.
    affinity: HashMap<String, (String, Instant)>,
}

/// Decides which (key, model) lane may run next, respecting per-model
/// RPM/TPM budgets over a rolling window while avoiding auth-disabled or
/// rate-limit-stricken keys. Grounded on `shared/gemini_allocator.py`.
pub struct Allocator {
    config: AllocatorConfig,
    models_by_id: HashMap<String, ModelConfig>,
    window: Duration,
    auth_disable_ms: u64,
    wait_slice_ms: u64,
    affinity_capacity: usize,
    inner: Mutex<Inner>,
}

impl Allocator {
    pub fn new(config: AllocatorConfig, key_pool: Vec<String>, auth_disable_ms: u64, wait_slice_ms: u64) -> Self {
        Self::with_affinity_capacity(config, key_pool, auth_disable_ms, wait_slice_ms, 4096)
    }

    pub fn with_affinity_capacity(
        config: AllocatorConfig,
        key_pool: Vec<String>,
        auth_disable_ms: u64,
        wait_slice_ms: u64,
        affinity_capacity: usize,
    ) -> Self {
        let window = Duration::from_secs(config.window_seconds);
        let models_by_id = config
            .models
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect();
        let keys = key_pool.into_iter().map(KeyState::new).collect();
        Self {
            config,
            models_by_id,
            window,
            auth_disable_ms,
            wait_slice_ms,
            affinity_capacity,
            inner: Mutex::new(Inner {
                keys,
                lanes: HashMap::new(),
                next_index: 0,
                affinity: HashMap::new(),
            }),
        }
    }

    /// Returns the serving key fingerprint previously bound to any of the
    /// given normalized speaker ids, if one exists (most recently bound wins).
    pub async fn affinity_preferred_key(&self, speakers: &[String]) -> Option<String> {
        let guard = self.inner.lock().await;
        speakers
            .iter()
            .filter_map(|s| guard.affinity.get(s))
            .max_by_key(|(_, ts)| *ts)
            .map(|(key, _)| key.clone())
    }

    /// Binds a set of normalized speaker ids to a serving key after a
    /// successful synthesis call. Bounded-size LRU; eviction at insert time
    /// is an O(n) scan, acceptable at the configured capacity.
    pub async fn affinity_bind(&self, speakers: &[String], key_fingerprint: &str) {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        for speaker in speakers {
            guard.affinity.insert(speaker.clone(), (key_fingerprint.to_string(), now));
        }
        while guard.affinity.len() > self.affinity_capacity {
            if let Some(oldest) = guard.affinity.iter().min_by_key(|(_, (_, ts))| *ts).map(|(k, _)| k.clone()) {
                guard.affinity.remove(&oldest);
            } else {
                break;
            }
        }
    }

    fn evict_affinity_for_key(guard: &mut Inner, key_fingerprint: &str) {
        guard.affinity.retain(|_, (bound_key, _)| bound_key != key_fingerprint);
    }

    fn route_for_task(&self, task: &str) -> &[String] {
        match task {
            "tts" => &self.config.routes.tts,
            "text" => &self.config.routes.text,
            "ocr" => &self.config.routes.ocr,
            _ => &[],
        }
    }

    pub async fn acquire_for_task(
        &self,
        task: &str,
        requested_tokens: u64,
        blocked_keys: &[String],
        blocked_models: &[String],
        wait_timeout_ms: Option<u64>,
        preferred_key: Option<&str>,
    ) -> (Option<Lease>, AcquireOutcome) {
        let models: Vec<String> = self
            .route_for_task(task)
            .iter()
            .filter(|m| !blocked_models.iter().any(|b| b == *m))
            .cloned()
            .collect();
        self.acquire_for_models(
            &models,
            requested_tokens,
            blocked_keys,
            wait_timeout_ms,
            preferred_key,
        )
        .await
    }

    pub async fn acquire_for_models(
        &self,
        models: &[String],
        requested_tokens: u64,
        blocked_keys: &[String],
        wait_timeout_ms: Option<u64>,
        preferred_key: Option<&str>,
    ) -> (Option<Lease>, AcquireOutcome) {
        let timeout_ms = wait_timeout_ms.unwrap_or(self.config.default_wait_timeout_ms);
        let start = Instant::now();
        let deadline = start + Duration::from_millis(timeout_ms);

        loop {
            let now = Instant::now();
            let mut guard = self.inner.lock().await;

            let candidates = ordered_key_candidates(&guard, blocked_keys, preferred_key, now);

            let mut nearest_wait: Option<Duration> = None;
            let mut chosen: Option<(usize, String)> = None;

            'search: for model_id in models {
                let Some(model_cfg) = self.models_by_id.get(model_id) else { continue };
                for key_index in &candidates {
                    let key = &guard.keys[*key_index];
                    if key.is_auth_disabled(now) {
                        let wait = key.auth_disabled_until.unwrap().saturating_duration_since(now);
                        nearest_wait = Some(nearest_wait.map_or(wait, |w| w.min(wait)));
                        continue;
                    }
                    let lane_key = (*key_index, model_id.clone());
                    let lane = guard
                        .lanes
                        .entry(lane_key.clone())
                        .or_insert_with(|| LaneState::new(now));
                    lane.maybe_rollover(now, self.window);

                    if let Some(block_until) = lane.temp_block_until {
                        if now < block_until {
                            let wait = block_until.saturating_duration_since(now);
                            nearest_wait = Some(nearest_wait.map_or(wait, |w| w.min(wait)));
                            continue;
                        }
                    }

                    let would_exceed_rpm =
                        lane.counted_requests as u64 + lane.in_flight_requests as u64 + 1 > model_cfg.rpm as u64;
                    let would_exceed_tpm =
                        lane.counted_tokens + lane.in_flight_tokens + requested_tokens > model_cfg.tpm as u64;

                    if would_exceed_rpm || would_exceed_tpm {
                        let wait = lane.window_reset_in(now, self.window);
                        nearest_wait = Some(nearest_wait.map_or(wait, |w| w.min(wait)));
                        continue;
                    }

                    chosen = Some(lane_key);
                    break 'search;
                }
            }

            if let Some((key_index, model)) = chosen {
                let lane = guard.lanes.get_mut(&(key_index, model.clone())).expect("lane present");
                lane.in_flight_requests += 1;
                lane.in_flight_tokens += requested_tokens;
                let key = &mut guard.keys[key_index];
                key.in_flight += 1;
                let key_fingerprint = key.fingerprint.clone();
                guard.next_index = (key_index + 1) % guard.keys.len().max(1);

                let waited_ms = now.duration_since(start).as_millis() as u64;
                debug!(model = %model, key = %key_fingerprint, waited_ms, "lane acquired");
                return (
                    Some(Lease {
                        id: Uuid::new_v4(),
                        key_index,
                        key_fingerprint,
                        model,
                        reserved_tokens: requested_tokens,
                        reserved_at: now,
                    }),
                    AcquireOutcome { waited_ms, retry_after_ms: 0, timed_out: false },
                );
            }

            drop(guard);

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let retry_after_ms = nearest_wait.unwrap_or(Duration::ZERO).as_millis() as u64;
                return (
                    None,
                    AcquireOutcome {
                        waited_ms: Instant::now().duration_since(start).as_millis() as u64,
                        retry_after_ms,
                        timed_out: true,
                    },
                );
            }

            let sleep_for = nearest_wait
                .unwrap_or(Duration::from_millis(self.wait_slice_ms))
                .min(Duration::from_millis(self.wait_slice_ms))
                .min(remaining);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }

    pub async fn release(&self, lease: &Lease, success: bool, used_tokens: u64, error_kind: Option<ErrorKind>) {
        let mut guard = self.inner.lock().await;
        if lease.key_index >= guard.keys.len() {
            warn!(key_index = lease.key_index, "release for unknown key index, ignoring");
            return;
        }
        let now = Instant::now();
        let window = self.window;
        let auth_disable_ms = self.auth_disable_ms;

        let lane_present = guard.lanes.contains_key(&(lease.key_index, lease.model.clone()));
        if !lane_present {
            warn!(model = %lease.model, "release for unissued lease, ignoring");
            return;
        }

        let window_end = {
            let lane = guard.lanes.get(&(lease.key_index, lease.model.clone())).unwrap();
            lane.window_start + window
        };

        let lane = guard.lanes.get_mut(&(lease.key_index, lease.model.clone())).unwrap();
        lane.in_flight_requests = lane.in_flight_requests.saturating_sub(1);
        lane.in_flight_tokens = lane.in_flight_tokens.saturating_sub(lease.reserved_tokens);
        lane.counted_requests += 1;
        lane.counted_tokens += used_tokens.max(lease.reserved_tokens);
        if matches!(error_kind, Some(ErrorKind::RateLimit)) {
            lane.temp_block_until = Some(window_end);
        }

        let key = &mut guard.keys[lease.key_index];
        key.in_flight = (key.in_flight - 1).max(0);
        key.requests_total += 1;
        if success {
            key.successes += 1;
        } else {
            key.failures += 1;
        }
        let fingerprint = key.fingerprint.clone();
        match error_kind {
            Some(ErrorKind::Auth) => {
                key.auth_failures += 1;
                key.auth_disabled_until = Some(now + Duration::from_millis(auth_disable_ms));
                Self::evict_affinity_for_key(&mut guard, &fingerprint);
            }
            Some(ErrorKind::RateLimit) => {
                key.rate_limit_strikes += 1;
            }
            _ => {}
        }
    }

    pub async fn mark_rate_limited(&self, key_fingerprint: &str, model: &str) {
        let mut guard = self.inner.lock().await;
        let Some(index) = guard.keys.iter().position(|k| k.fingerprint == key_fingerprint) else { return };
        let now = Instant::now();
        let window = self.window;
        let lane = guard
            .lanes
            .entry((index, model.to_string()))
            .or_insert_with(|| LaneState::new(now));
        lane.maybe_rollover(now, window);
        lane.temp_block_until = Some(lane.window_start + window);
        guard.keys[index].rate_limit_strikes += 1;
    }

    pub async fn mark_auth_failed(&self, key_fingerprint: &str) {
        let mut guard = self.inner.lock().await;
        let Some(index) = guard.keys.iter().position(|k| k.fingerprint == key_fingerprint) else { return };
        let now = Instant::now();
        let auth_disable_ms = self.auth_disable_ms;
        let key = &mut guard.keys[index];
        key.auth_failures += 1;
        key.auth_disabled_until = Some(now + Duration::from_millis(auth_disable_ms));
        Self::evict_affinity_for_key(&mut guard, key_fingerprint);
    }

    pub async fn snapshot(&self) -> AllocatorSnapshot {
        let guard = self.inner.lock().await;
        let now = Instant::now();

        let keys: Vec<KeySnapshot> = guard
            .keys
            .iter()
            .enumerate()
            .map(|(index, k)| {
                let status = if k.is_auth_disabled(now) {
                    "auth_issue"
                } else if guard
                    .lanes
                    .iter()
                    .any(|((key_index, _), l)| *key_index == index && l.temp_block_until.map(|t| now < t).unwrap_or(false))
                {
                    "rate_limited"
                } else if k.in_flight > 0 {
                    "in_flight"
                } else {
                    "healthy"
                };
                KeySnapshot {
                    fingerprint: k.fingerprint.clone(),
                    status,
                    in_flight: k.in_flight,
                    requests_total: k.requests_total,
                    successes: k.successes,
                    failures: k.failures,
                }
            })
            .collect();

        let mut by_model: HashMap<String, (u32, u64, u32, u64)> = HashMap::new();
        for ((_, model), lane) in guard.lanes.iter() {
            let entry = by_model.entry(model.clone()).or_default();
            entry.0 += lane.counted_requests;
            entry.1 += lane.counted_tokens;
            entry.2 += lane.in_flight_requests;
            entry.3 += lane.in_flight_tokens;
        }
        let models = self
            .config
            .models
            .iter()
            .map(|m| {
                let (cr, ct, ifr, ift) = by_model.get(&m.id).copied().unwrap_or_default();
                ModelSnapshot {
                    model: m.id.clone(),
                    rpm: m.rpm,
                    tpm: m.tpm,
                    counted_requests: cr,
                    counted_tokens: ct,
                    in_flight_requests: ifr,
                    in_flight_tokens: ift,
                }
            })
            .collect();

        let healthy_keys = keys.iter().filter(|k| k.status == "healthy" || k.status == "in_flight").count();
        let at_limit_keys = keys.len() - healthy_keys;
        let in_flight_total = guard.keys.iter().map(|k| k.in_flight).sum();

        AllocatorSnapshot {
            keys,
            models,
            healthy_keys,
            at_limit_keys,
            in_flight_total,
            next_index: guard.next_index,
        }
    }

    pub async fn key_pool_size(&self) -> usize {
        self.inner.lock().await.keys.len()
    }
}

fn ordered_key_candidates(
    guard: &Inner,
    blocked_keys: &[String],
    preferred_key: Option<&str>,
    _now: Instant,
) -> Vec<usize> {
    let n = guard.keys.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n)
        .map(|offset| (guard.next_index + offset) % n)
        .filter(|idx| !blocked_keys.iter().any(|b| *b == guard.keys[*idx].fingerprint))
        .collect();

    if let Some(preferred) = preferred_key {
        if let Some(pos) = order.iter().position(|idx| guard.keys[*idx].fingerprint == preferred) {
            let preferred_idx = order.remove(pos);
            order.insert(0, preferred_idx);
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, RoutesConfig};

    fn test_config(rpm: u32, tpm: u32, window_seconds: u64) -> AllocatorConfig {
        AllocatorConfig {
            version: "test".into(),
            window_seconds,
            default_wait_timeout_ms: 2_000,
            models: vec![ModelConfig {
                id: "model-a".into(),
                rpm,
                tpm,
                enabled_for: vec!["tts".into()],
            }],
            routes: RoutesConfig {
                tts: vec!["model-a".into()],
                text: vec![],
                ocr: vec![],
            },
        }
    }

    // S1 — Allocator RPM enforcement: rpm=3, tpm=10000, windowSeconds=60, one key.
    #[tokio::test]
    async fn s1_rpm_enforcement_blocks_fourth_acquire() {
        let allocator = Allocator::new(
            test_config(3, 10_000, 60),
            vec!["AIza0000000000000000000000000000000".into()],
            300_000,
            20,
        );

        for _ in 0..3 {
            let (lease, outcome) = allocator
                .acquire_for_task("tts", 1, &[], &[], Some(100), None)
                .await;
            assert!(!outcome.timed_out);
            let lease = lease.expect("lane should be ready");
            allocator.release(&lease, true, 1, None).await;
        }

        let (lease, outcome) = allocator
            .acquire_for_task("tts", 1, &[], &[], Some(100), None)
            .await;
        assert!(lease.is_none());
        assert!(outcome.timed_out);
        assert!(outcome.retry_after_ms > 0);
    }

    // S2 — Allocator TPM: rpm=10, tpm=10000, one key.
    #[tokio::test]
    async fn s2_tpm_enforcement_blocks_second_acquire() {
        let allocator = Allocator::new(
            test_config(10, 10_000, 60),
            vec!["AIza1111111111111111111111111111111".into()],
            300_000,
            20,
        );

        let (lease, outcome) = allocator
            .acquire_for_task("tts", 6_000, &[], &[], Some(100), None)
            .await;
        assert!(!outcome.timed_out);
        let lease = lease.expect("first acquire should succeed");
        allocator.release(&lease, true, 6_000, None).await;

        let (lease, outcome) = allocator
            .acquire_for_task("tts", 5_000, &[], &[], Some(100), None)
            .await;
        assert!(lease.is_none());
        assert!(outcome.timed_out);
        assert!(outcome.retry_after_ms > 0);
    }

    #[tokio::test]
    async fn release_on_unissued_lease_is_a_defensive_noop() {
        let allocator = Allocator::new(
            test_config(3, 10_000, 60),
            vec!["AIza2222222222222222222222222222222".into()],
            300_000,
            20,
        );
        let fake = Lease {
            id: Uuid::new_v4(),
            key_index: 0,
            key_fingerprint: "deadbeef".into(),
            model: "model-a".into(),
            reserved_tokens: 10,
            reserved_at: Instant::now(),
        };
        allocator.release(&fake, true, 10, None).await;
    }

    #[tokio::test]
    async fn preferred_key_bypasses_cursor_on_first_attempt() {
        let allocator = Allocator::new(
            test_config(5, 10_000, 60),
            vec![
                "AIza3333333333333333333333333333333".into(),
                "AIza4444444444444444444444444444444".into(),
            ],
            300_000,
            20,
        );
        let snapshot = allocator.snapshot().await;
        let preferred_fp = snapshot.keys[1].fingerprint.clone();

        let (lease, _) = allocator
            .acquire_for_task("tts", 1, &[], &[], Some(100), Some(&preferred_fp))
            .await;
        let lease = lease.expect("lease expected");
        assert_eq!(lease.key_fingerprint, preferred_fp);
    }
}

//! Abstract persistence layer over the state store's document shapes named
//! in `spec.md` §6: `entitlements/{uid}`, `usage_monthly/{uid}_{YYYYMM}`,
//! `usage_daily/{uid}_{YYYYMMDD}`, `usage_events/{uid}_{requestId}`, and
//! `stripe_customers/{customerId} -> {uid}`.
//!
//! Grounded on `integration-gateway/src/usage.rs` (`Arc<Inner>` + background
//! flush idiom) for the in-memory shape, and
//! `integration-gateway/src/rate_limiter.rs::InMemoryRateLimiter` for the
//! test-double pattern; the Postgres implementation follows
//! `integration-gateway/src/usage.rs::flush_window`'s `sqlx::query` style.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize)]
pub struct Entitlement {
    pub uid: String,
    pub plan: String,
    #[serde(rename = "monthlyVfLimit")]
    pub monthly_vf_limit: u64,
    #[serde(rename = "dailyGenerationLimit")]
    pub daily_generation_limit: u64,
}

impl Entitlement {
    pub fn default_for(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            plan: "Free".to_string(),
            monthly_vf_limit: 50_000,
            daily_generation_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineUsage {
    pub chars: u64,
    pub vf: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageWindow {
    pub doc_id: String,
    pub uid: String,
    #[serde(rename = "vfUsed")]
    pub vf_used: f64,
    #[serde(rename = "generationCount")]
    pub generation_count: u64,
    #[serde(rename = "byEngine")]
    pub by_engine: HashMap<String, EngineUsage>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl UsageWindow {
    fn empty(doc_id: impl Into<String>, uid: &str, now: DateTime<Utc>) -> Self {
        Self {
            doc_id: doc_id.into(),
            uid: uid.to_string(),
            vf_used: 0.0,
            generation_count: 0,
            by_engine: HashMap::new(),
            updated_at: now,
        }
    }

    fn apply_delta(&mut self, engine: &str, chars: u64, vf_cost: f64, now: DateTime<Utc>) {
        self.vf_used += vf_cost;
        self.generation_count += 1;
        let entry = self.by_engine.entry(engine.to_string()).or_default();
        entry.chars += chars;
        entry.vf += vf_cost;
        self.updated_at = now;
    }

    fn revert_delta(&mut self, engine: &str, chars: u64, vf_cost: f64, now: DateTime<Utc>) {
        self.vf_used = (self.vf_used - vf_cost).max(0.0);
        self.generation_count = self.generation_count.saturating_sub(1);
        if let Some(entry) = self.by_engine.get_mut(engine) {
            entry.vf = (entry.vf - vf_cost).max(0.0);
            entry.chars = entry.chars.saturating_sub(chars);
        }
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageEventStatus {
    Reserved,
    Committed,
    Reverted,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub uid: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub status: UsageEventStatus,
    pub engine: String,
    pub chars: u64,
    #[serde(rename = "vfCost")]
    pub vf_cost: f64,
    #[serde(rename = "monthDocId")]
    pub month_doc_id: String,
    #[serde(rename = "dayDocId")]
    pub day_doc_id: String,
    #[serde(rename = "bypassReason", skip_serializing_if = "Option::is_none")]
    pub bypass_reason: Option<String>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

pub fn month_doc_id(uid: &str, at: DateTime<Utc>) -> String {
    format!("{uid}_{:04}{:02}", at.year(), at.month())
}

pub fn day_doc_id(uid: &str, at: DateTime<Utc>) -> String {
    format!("{uid}_{:04}{:02}{:02}", at.year(), at.month(), at.day())
}

/// Everything the quota layer needs read/written as one unit. Backends
/// decide how that unit is made atomic: the in-memory store behind one
/// mutex, the Postgres store inside one `sqlx` transaction.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_entitlement(&self, uid: &str) -> anyhow::Result<Entitlement>;
    async fn get_usage_event(&self, uid: &str, request_id: &str) -> anyhow::Result<Option<UsageEvent>>;

    /// Applies the reserve transaction described in `spec.md` §4.5, or
    /// returns the existing event untouched if already reserved/committed.
    async fn reserve(
        &self,
        uid: &str,
        request_id: &str,
        engine: &str,
        chars: u64,
        vf_cost: f64,
        bypass_reason: Option<String>,
    ) -> anyhow::Result<ReserveOutcome>;

    async fn commit(&self, uid: &str, request_id: &str) -> anyhow::Result<()>;
    async fn revert(&self, uid: &str, request_id: &str) -> anyhow::Result<()>;

    async fn lookup_stripe_customer(&self, customer_id: &str) -> anyhow::Result<Option<String>>;
    async fn link_stripe_customer(&self, customer_id: &str, uid: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    Reserved(UsageEvent),
    AlreadyReserved(UsageEvent),
    MonthlyLimitExceeded,
    DailyLimitExceeded,
}

struct InMemoryData {
    entitlements: HashMap<String, Entitlement>,
    monthly: HashMap<String, UsageWindow>,
    daily: HashMap<String, UsageWindow>,
    events: HashMap<String, UsageEvent>,
    stripe_customers: HashMap<String, String>,
}

/// Single mutex across all four document families, matching the "one
/// transaction" discipline from `spec.md` §4.5 when no durable store is
/// configured — the same shape as `backend/app.py`'s `_INMEMORY_LOCK` branch.
pub struct InMemoryStateStore {
    data: Mutex<InMemoryData>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(InMemoryData {
                entitlements: HashMap::new(),
                monthly: HashMap::new(),
                daily: HashMap::new(),
                events: HashMap::new(),
                stripe_customers: HashMap::new(),
            }),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_entitlement(&self, uid: &str) -> anyhow::Result<Entitlement> {
        let guard = self.data.lock().await;
        Ok(guard.entitlements.get(uid).cloned().unwrap_or_else(|| Entitlement::default_for(uid)))
    }

    async fn get_usage_event(&self, uid: &str, request_id: &str) -> anyhow::Result<Option<UsageEvent>> {
        let guard = self.data.lock().await;
        Ok(guard.events.get(&event_key(uid, request_id)).cloned())
    }

    async fn reserve(
        &self,
        uid: &str,
        request_id: &str,
        engine: &str,
        chars: u64,
        vf_cost: f64,
        bypass_reason: Option<String>,
    ) -> anyhow::Result<ReserveOutcome> {
        let now = Utc::now();
        let mut guard = self.data.lock().await;
        let key = event_key(uid, request_id);

        if let Some(existing) = guard.events.get(&key) {
            if matches!(existing.status, UsageEventStatus::Reserved | UsageEventStatus::Committed) {
                return Ok(ReserveOutcome::AlreadyReserved(existing.clone()));
            }
        }

        let entitlement = guard.entitlements.entry(uid.to_string()).or_insert_with(|| Entitlement::default_for(uid)).clone();

        let month_id = month_doc_id(uid, now);
        let day_id = day_doc_id(uid, now);

        let monthly = guard.monthly.entry(month_id.clone()).or_insert_with(|| UsageWindow::empty(&month_id, uid, now));
        if bypass_reason.is_none() && monthly.vf_used + vf_cost > entitlement.monthly_vf_limit as f64 {
            return Ok(ReserveOutcome::MonthlyLimitExceeded);
        }

        let daily = guard.daily.entry(day_id.clone()).or_insert_with(|| UsageWindow::empty(&day_id, uid, now));
        if bypass_reason.is_none() && daily.generation_count + 1 > entitlement.daily_generation_limit {
            return Ok(ReserveOutcome::DailyLimitExceeded);
        }

        guard.monthly.get_mut(&month_id).unwrap().apply_delta(engine, chars, vf_cost, now);
        guard.daily.get_mut(&day_id).unwrap().apply_delta(engine, chars, vf_cost, now);

        let event = UsageEvent {
            uid: uid.to_string(),
            request_id: request_id.to_string(),
            status: UsageEventStatus::Reserved,
            engine: engine.to_string(),
            chars,
            vf_cost,
            month_doc_id: month_id,
            day_doc_id: day_id,
            bypass_reason,
            updated_at: now,
        };
        guard.events.insert(key, event.clone());
        Ok(ReserveOutcome::Reserved(event))
    }

    async fn commit(&self, uid: &str, request_id: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut guard = self.data.lock().await;
        let key = event_key(uid, request_id);
        if let Some(event) = guard.events.get_mut(&key) {
            if event.status != UsageEventStatus::Committed {
                event.status = UsageEventStatus::Committed;
                event.updated_at = now;
            }
        }
        Ok(())
    }

    async fn revert(&self, uid: &str, request_id: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut guard = self.data.lock().await;
        let key = event_key(uid, request_id);

        let Some(event) = guard.events.get(&key).cloned() else { return Ok(()) };
        if event.status == UsageEventStatus::Committed {
            return Ok(());
        }
        if event.status == UsageEventStatus::Reserved {
            if let Some(monthly) = guard.monthly.get_mut(&event.month_doc_id) {
                monthly.revert_delta(&event.engine, event.chars, event.vf_cost, now);
            }
            if let Some(daily) = guard.daily.get_mut(&event.day_doc_id) {
                daily.revert_delta(&event.engine, event.chars, event.vf_cost, now);
            }
        }
        if let Some(event) = guard.events.get_mut(&key) {
            event.status = UsageEventStatus::Reverted;
            event.updated_at = now;
        }
        Ok(())
    }

    async fn lookup_stripe_customer(&self, customer_id: &str) -> anyhow::Result<Option<String>> {
        let guard = self.data.lock().await;
        Ok(guard.stripe_customers.get(customer_id).cloned())
    }

    async fn link_stripe_customer(&self, customer_id: &str, uid: &str) -> anyhow::Result<()> {
        let mut guard = self.data.lock().await;
        guard.stripe_customers.insert(customer_id.to_string(), uid.to_string());
        Ok(())
    }
}

fn event_key(uid: &str, request_id: &str) -> String {
    format!("{uid}_{request_id}")
}

/// Postgres-backed implementation. Each operation runs inside one `sqlx`
/// transaction so the four documents stay consistent, mirroring the
/// Firestore `@transactional` block this is grounded on.
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get_entitlement(&self, uid: &str) -> anyhow::Result<Entitlement> {
        let row = sqlx::query_as::<_, (String, String, i64, i64)>(
            "SELECT uid, plan, monthly_vf_limit, daily_generation_limit FROM entitlements WHERE uid = $1",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((uid, plan, monthly_vf_limit, daily_generation_limit)) => Entitlement {
                uid,
                plan,
                monthly_vf_limit: monthly_vf_limit.max(0) as u64,
                daily_generation_limit: daily_generation_limit.max(0) as u64,
            },
            None => Entitlement::default_for(uid),
        })
    }

    async fn get_usage_event(&self, uid: &str, request_id: &str) -> anyhow::Result<Option<UsageEvent>> {
        let key = event_key(uid, request_id);
        let row = sqlx::query_as::<_, UsageEventRow>(
            "SELECT uid, request_id, status, engine, chars, vf_cost, month_doc_id, day_doc_id, bypass_reason, updated_at
             FROM usage_events WHERE event_key = $1",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UsageEventRow::into_event))
    }

    async fn reserve(
        &self,
        uid: &str,
        request_id: &str,
        engine: &str,
        chars: u64,
        vf_cost: f64,
        bypass_reason: Option<String>,
    ) -> anyhow::Result<ReserveOutcome> {
        let now = Utc::now();
        let key = event_key(uid, request_id);
        let month_id = month_doc_id(uid, now);
        let day_id = day_doc_id(uid, now);

        let mut tx = self.pool.begin().await?;

        if let Some(existing) = sqlx::query_as::<_, (String,)>("SELECT status FROM usage_events WHERE event_key = $1 FOR UPDATE")
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await?
        {
            if matches!(parse_status(&existing.0), UsageEventStatus::Reserved | UsageEventStatus::Committed) {
                tx.rollback().await?;
                let event = self.get_usage_event(uid, request_id).await?.expect("just read it");
                return Ok(ReserveOutcome::AlreadyReserved(event));
            }
        }

        let entitlement = self.get_entitlement(uid).await?;

        let (mut monthly_used, mut monthly_count): (f64, i64) =
            sqlx::query_as("SELECT vf_used, generation_count FROM usage_monthly WHERE doc_id = $1 FOR UPDATE")
                .bind(&month_id)
                .fetch_optional(&mut *tx)
                .await?
                .unwrap_or((0.0, 0));

        if bypass_reason.is_none() && monthly_used + vf_cost > entitlement.monthly_vf_limit as f64 {
            tx.rollback().await?;
            return Ok(ReserveOutcome::MonthlyLimitExceeded);
        }

        let (mut daily_used, mut daily_count): (f64, i64) =
            sqlx::query_as("SELECT vf_used, generation_count FROM usage_daily WHERE doc_id = $1 FOR UPDATE")
                .bind(&day_id)
                .fetch_optional(&mut *tx)
                .await?
                .unwrap_or((0.0, 0));

        if bypass_reason.is_none() && daily_count + 1 > entitlement.daily_generation_limit as i64 {
            tx.rollback().await?;
            return Ok(ReserveOutcome::DailyLimitExceeded);
        }

        monthly_used += vf_cost;
        monthly_count += 1;
        daily_used += vf_cost;
        daily_count += 1;

        sqlx::query(
            "INSERT INTO usage_monthly (doc_id, uid, vf_used, generation_count, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (doc_id) DO UPDATE SET vf_used = EXCLUDED.vf_used, generation_count = EXCLUDED.generation_count, updated_at = EXCLUDED.updated_at",
        )
        .bind(&month_id)
        .bind(uid)
        .bind(monthly_used)
        .bind(monthly_count)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO usage_daily (doc_id, uid, vf_used, generation_count, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (doc_id) DO UPDATE SET vf_used = EXCLUDED.vf_used, generation_count = EXCLUDED.generation_count, updated_at = EXCLUDED.updated_at",
        )
        .bind(&day_id)
        .bind(uid)
        .bind(daily_used)
        .bind(daily_count)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO usage_events (event_key, uid, request_id, status, engine, chars, vf_cost, month_doc_id, day_doc_id, bypass_reason, updated_at)
             VALUES ($1, $2, $3, 'reserved', $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (event_key) DO UPDATE SET status = 'reserved', updated_at = EXCLUDED.updated_at",
        )
        .bind(&key)
        .bind(uid)
        .bind(request_id)
        .bind(engine)
        .bind(chars as i64)
        .bind(vf_cost)
        .bind(&month_id)
        .bind(&day_id)
        .bind(&bypass_reason)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ReserveOutcome::Reserved(UsageEvent {
            uid: uid.to_string(),
            request_id: request_id.to_string(),
            status: UsageEventStatus::Reserved,
            engine: engine.to_string(),
            chars,
            vf_cost,
            month_doc_id: month_id,
            day_doc_id: day_id,
            bypass_reason,
            updated_at: now,
        }))
    }

    async fn commit(&self, uid: &str, request_id: &str) -> anyhow::Result<()> {
        let key = event_key(uid, request_id);
        sqlx::query("UPDATE usage_events SET status = 'committed', updated_at = now() WHERE event_key = $1 AND status = 'reserved'")
            .bind(&key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn revert(&self, uid: &str, request_id: &str) -> anyhow::Result<()> {
        let Some(event) = self.get_usage_event(uid, request_id).await? else { return Ok(()) };
        if event.status != UsageEventStatus::Reserved {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE usage_monthly SET vf_used = GREATEST(0, vf_used - $1), generation_count = GREATEST(0, generation_count - 1) WHERE doc_id = $2",
        )
        .bind(event.vf_cost)
        .bind(&event.month_doc_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE usage_daily SET generation_count = GREATEST(0, generation_count - 1) WHERE doc_id = $1")
            .bind(&event.day_doc_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE usage_events SET status = 'reverted', updated_at = now() WHERE event_key = $1")
            .bind(event_key(uid, request_id))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn lookup_stripe_customer(&self, customer_id: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>("SELECT uid FROM stripe_customers WHERE customer_id = $1")
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(uid,)| uid))
    }

    async fn link_stripe_customer(&self, customer_id: &str, uid: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO stripe_customers (customer_id, uid) VALUES ($1, $2)
             ON CONFLICT (customer_id) DO UPDATE SET uid = EXCLUDED.uid",
        )
        .bind(customer_id)
        .bind(uid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct UsageEventRow {
    uid: String,
    request_id: String,
    status: String,
    engine: String,
    chars: i64,
    vf_cost: f64,
    month_doc_id: String,
    day_doc_id: String,
    bypass_reason: Option<String>,
    updated_at: DateTime<Utc>,
}

impl UsageEventRow {
    fn into_event(self) -> UsageEvent {
        UsageEvent {
            uid: self.uid,
            request_id: self.request_id,
            status: parse_status(&self.status),
            engine: self.engine,
            chars: self.chars.max(0) as u64,
            vf_cost: self.vf_cost,
            month_doc_id: self.month_doc_id,
            day_doc_id: self.day_doc_id,
            bypass_reason: self.bypass_reason,
            updated_at: self.updated_at,
        }
    }
}

fn parse_status(raw: &str) -> UsageEventStatus {
    match raw {
        "committed" => UsageEventStatus::Committed,
        "reverted" => UsageEventStatus::Reverted,
        _ => UsageEventStatus::Reserved,
    }
}

pub type SharedStateStore = Arc<dyn StateStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_is_idempotent_on_repeat_request_id() {
        let store = InMemoryStateStore::new();
        let first = store.reserve("user-1", "req-1", "GEM", 100, 100.0, None).await.unwrap();
        assert!(matches!(first, ReserveOutcome::Reserved(_)));

        let second = store.reserve("user-1", "req-1", "GEM", 100, 100.0, None).await.unwrap();
        assert!(matches!(second, ReserveOutcome::AlreadyReserved(_)));
    }

    #[tokio::test]
    async fn revert_clamps_counters_to_zero() {
        let store = InMemoryStateStore::new();
        store.reserve("user-2", "req-1", "GEM", 10, 10.0, None).await.unwrap();
        store.revert("user-2", "req-1").await.unwrap();

        let now = Utc::now();
        let guard = store.data.lock().await;
        let monthly = guard.monthly.get(&month_doc_id("user-2", now)).unwrap();
        assert_eq!(monthly.vf_used, 0.0);
        assert_eq!(monthly.generation_count, 0);
    }

    #[tokio::test]
    async fn commit_on_reverted_event_is_a_noop() {
        let store = InMemoryStateStore::new();
        store.reserve("user-3", "req-1", "GEM", 10, 10.0, None).await.unwrap();
        store.revert("user-3", "req-1").await.unwrap();
        store.commit("user-3", "req-1").await.unwrap();

        let event = store.get_usage_event("user-3", "req-1").await.unwrap().unwrap();
        assert_eq!(event.status, UsageEventStatus::Reverted);
    }
}

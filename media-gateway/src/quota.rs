//! Per-user generation budget: idempotent reserve/commit/revert keyed by
//! `(uid, requestId)`, with an admin-uid bypass that still records a reason
//! for audit.
//!
//! Grounded on `backend/app.py`'s `_reserve_usage`/`_finalize_usage`
//! (original source).

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::state_store::{ReserveOutcome, SharedStateStore, UsageEvent};

pub struct QuotaLedger {
    store: SharedStateStore,
    engine_rates: HashMap<String, f64>,
    admin_uids: HashSet<Uuid>,
}

impl QuotaLedger {
    pub fn new(store: SharedStateStore, engine_rates: HashMap<String, f64>, admin_uids: HashSet<Uuid>) -> Self {
        Self { store, engine_rates, admin_uids }
    }

    fn rate_for(&self, engine: &str) -> Result<f64, GatewayError> {
        self.engine_rates
            .get(&engine.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| GatewayError::BadRequest(format!("no configured VF rate for engine {engine}")))
    }

    /// Reserves `vfCost = chars * engineRate[engine]` for `(uid, requestId)`.
    /// An admin uid in the allowlist bypasses both limits but the event still
    /// records why, so the trail explains the bypass later.
    pub async fn reserve(
        &self,
        uid: Uuid,
        request_id: &str,
        engine: &str,
        chars: u64,
        is_admin_token_present: bool,
    ) -> Result<UsageEvent, GatewayError> {
        let rate = self.rate_for(engine)?;
        let vf_cost = chars as f64 * rate;

        let bypass_reason = if is_admin_token_present && self.admin_uids.contains(&uid) {
            Some("admin_allowlist_bypass".to_string())
        } else {
            None
        };

        let outcome = self
            .store
            .reserve(&uid.to_string(), request_id, engine, chars, vf_cost, bypass_reason)
            .await
            .map_err(GatewayError::Internal)?;

        match outcome {
            ReserveOutcome::Reserved(event) => {
                info!(uid = %uid, request_id, vf_cost, "quota reserved");
                Ok(event)
            }
            ReserveOutcome::AlreadyReserved(event) => Ok(event),
            ReserveOutcome::MonthlyLimitExceeded => Err(GatewayError::MonthlyVfExceeded),
            ReserveOutcome::DailyLimitExceeded => Err(GatewayError::DailyGenerationExceeded),
        }
    }

    pub async fn commit(&self, uid: Uuid, request_id: &str) -> Result<(), GatewayError> {
        self.store.commit(&uid.to_string(), request_id).await.map_err(GatewayError::Internal)
    }

    pub async fn revert(&self, uid: Uuid, request_id: &str) -> Result<(), GatewayError> {
        warn!(uid = %uid, request_id, "reverting quota reservation");
        self.store.revert(&uid.to_string(), request_id).await.map_err(GatewayError::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_store::InMemoryStateStore;
    use std::sync::Arc;

    fn ledger(admin_uids: HashSet<Uuid>) -> QuotaLedger {
        let mut rates = HashMap::new();
        rates.insert("gem".to_string(), 1.0);
        rates.insert("kokoro".to_string(), 0.4);
        QuotaLedger::new(Arc::new(InMemoryStateStore::new()), rates, admin_uids)
    }

    #[tokio::test]
    async fn reserve_is_idempotent_for_same_request_id() {
        let ledger = ledger(HashSet::new());
        let uid = Uuid::new_v4();
        let first = ledger.reserve(uid, "req-1", "GEM", 500, false).await.unwrap();
        let second = ledger.reserve(uid, "req-1", "GEM", 500, false).await.unwrap();
        assert_eq!(first.vf_cost, second.vf_cost);
    }

    #[tokio::test]
    async fn unknown_engine_is_a_configuration_error() {
        let ledger = ledger(HashSet::new());
        let uid = Uuid::new_v4();
        let err = ledger.reserve(uid, "req-1", "nonexistent", 500, false).await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[tokio::test]
    async fn admin_bypass_requires_both_uid_and_token() {
        let uid = Uuid::new_v4();
        let mut admins = HashSet::new();
        admins.insert(uid);
        let ledger = ledger(admins);

        // Admin uid without a token presented does not bypass.
        let event = ledger.reserve(uid, "req-1", "GEM", 1, false).await.unwrap();
        assert!(event.bypass_reason.is_none());
    }
}

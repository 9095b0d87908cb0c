//! Per-supplier call quotas.
//!
//! One counter per (provider, service type). A reservation is a single
//! check-and-increment under that key's lock, so concurrent callers can never
//! push `quota_used` past `quota_limit`.

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::QuotaConfig,
    error::OrchestratorError,
    model::{ProviderId, QuotaRecord, QuotaStatus, ServiceType},
};

pub type QuotaKey = (ProviderId, ServiceType);

/// Proof of a successful reservation.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "a permit must be released or reported as failed"]
pub struct QuotaPermit {
    pub provider_id: ProviderId,
    pub service_type: ServiceType,
    pub amount: u64,
    // identifies the reset period the units were taken from
    period_end: chrono::DateTime<chrono::Utc>,
}

pub struct QuotaTracker {
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    limits: DashMap<QuotaKey, (u64, i64)>,
    records: DashMap<QuotaKey, Arc<Mutex<QuotaRecord>>>,
}

impl QuotaTracker {
    pub fn new(config: QuotaConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            limits: DashMap::new(),
            records: DashMap::new(),
        }
    }

    /// Sets the limit and period for a key; an existing counter keeps its usage.
    pub fn set_limit(&self, provider_id: &ProviderId, service_type: ServiceType, limit: u64, period_secs: Option<i64>) {
        let period = period_secs.unwrap_or(self.config.default_period_secs);
        let key = (provider_id.clone(), service_type);
        self.limits.insert(key.clone(), (limit, period));

        if let Some(record) = self.records.get(&key) {
            let mut record = record.lock();
            record.quota_limit = limit;
            record.period_secs = period;
            record.recompute();
        }
    }

    fn limit_for(&self, key: &QuotaKey) -> (u64, i64) {
        self.limits
            .get(key)
            .map(|l| *l)
            .unwrap_or((self.config.default_limit, self.config.default_period_secs))
    }

    fn record(&self, provider_id: &ProviderId, service_type: ServiceType) -> Arc<Mutex<QuotaRecord>> {
        let key = (provider_id.clone(), service_type);
        if let Some(record) = self.records.get(&key) {
            return record.clone();
        }
        let (limit, period) = self.limit_for(&key);
        self.records
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(QuotaRecord::new(
                    provider_id.clone(),
                    service_type,
                    limit,
                    period,
                    self.clock.now(),
                )))
            })
            .clone()
    }

    pub fn ensure(&self, provider_id: &ProviderId, service_type: ServiceType) {
        self.record(provider_id, service_type);
    }

    pub fn reserve(
        &self,
        provider_id: &ProviderId,
        service_type: ServiceType,
        amount: u64,
    ) -> Result<QuotaPermit, OrchestratorError> {
        let record = self.record(provider_id, service_type);
        let mut record = record.lock();
        self.reset_locked(&mut record);

        if record.quota_used.saturating_add(amount) > record.quota_limit {
            record.recompute();
            debug!(
                provider_id = %provider_id,
                service_type = %service_type,
                requested = amount,
                remaining = record.remaining(),
                "quota reservation refused"
            );
            return Err(OrchestratorError::QuotaExceeded {
                provider_id: provider_id.clone(),
                service_type,
                used: record.quota_used,
                limit: record.quota_limit,
            });
        }

        let before = record.status;
        record.quota_used += amount;
        record.recompute();
        if record.status != before {
            match record.status {
                QuotaStatus::Exhausted => warn!(
                    provider_id = %provider_id,
                    service_type = %service_type,
                    limit = record.quota_limit,
                    "quota exhausted"
                ),
                status => debug!(
                    provider_id = %provider_id,
                    service_type = %service_type,
                    ?status,
                    percentage_used = record.percentage_used,
                    "quota status changed"
                ),
            }
        }

        Ok(QuotaPermit {
            provider_id: provider_id.clone(),
            service_type,
            amount,
            period_end: record.reset_time,
        })
    }

    /// Successful calls keep their units; nothing is refunded.
    pub fn release(&self, permit: QuotaPermit) {
        drop(permit);
    }

    /// Settles a failed call. Units are returned only when the request never
    /// reached the supplier, refunds are enabled, and the period that issued
    /// the permit is still current. Returns whether a refund happened.
    pub fn report_failure(&self, permit: QuotaPermit, dispatched: bool) -> bool {
        if dispatched || !self.config.refund_undispatched {
            return false;
        }
        let Some(record) = self
            .records
            .get(&(permit.provider_id.clone(), permit.service_type))
            .map(|r| r.clone())
        else {
            return false;
        };
        let mut record = record.lock();
        if record.reset_time != permit.period_end {
            return false;
        }
        record.quota_used = record.quota_used.saturating_sub(permit.amount);
        record.recompute();
        debug!(
            provider_id = %permit.provider_id,
            service_type = %permit.service_type,
            amount = permit.amount,
            "undispatched reservation refunded"
        );
        true
    }

    fn reset_locked(&self, record: &mut QuotaRecord) -> bool {
        let now = self.clock.now();
        if now < record.reset_time {
            return false;
        }
        let period_secs = record.period_secs.max(1);
        // skip every elapsed period at once so the next reset is in the future
        let elapsed_periods = (now - record.reset_time).num_seconds() / period_secs + 1;
        record.reset_time += Duration::seconds(period_secs.saturating_mul(elapsed_periods));
        record.quota_used = 0;
        record.recompute();
        info!(
            provider_id = %record.provider_id,
            service_type = %record.service_type,
            next_reset = %record.reset_time,
            "quota period reset"
        );
        true
    }

    pub fn reset_if_due(&self, provider_id: &ProviderId, service_type: ServiceType) -> bool {
        let Some(record) = self
            .records
            .get(&(provider_id.clone(), service_type))
            .map(|r| r.clone())
        else {
            return false;
        };
        let mut record = record.lock();
        self.reset_locked(&mut record)
    }

    /// Resets every due counter belonging to `provider_id`.
    pub fn reset_due_for(&self, provider_id: &ProviderId) -> usize {
        ServiceType::ALL
            .iter()
            .filter(|service_type| self.reset_if_due(provider_id, **service_type))
            .count()
    }

    /// Whether a reservation would be refused right now, counting a due reset as done.
    pub fn is_exhausted(&self, provider_id: &ProviderId, service_type: ServiceType) -> bool {
        let key = (provider_id.clone(), service_type);
        match self.records.get(&key).map(|r| r.clone()) {
            Some(record) => {
                let record = record.lock();
                self.clock.now() < record.reset_time && record.is_exhausted()
            }
            None => self.limit_for(&key).0 == 0,
        }
    }

    pub fn get(&self, provider_id: &ProviderId, service_type: ServiceType) -> Option<QuotaRecord> {
        self.records
            .get(&(provider_id.clone(), service_type))
            .map(|r| r.lock().clone())
    }

    pub fn records_for(&self, provider_id: &ProviderId) -> Vec<QuotaRecord> {
        ServiceType::ALL
            .iter()
            .filter_map(|service_type| self.get(provider_id, *service_type))
            .collect()
    }

    /// Loads a persisted counter; usage is clamped to zero by construction.
    pub fn restore(&self, mut record: QuotaRecord) {
        let key = (record.provider_id.clone(), record.service_type);
        if let Some((limit, period)) = self.limits.get(&key).map(|l| *l) {
            record.quota_limit = limit;
            record.period_secs = period;
        }
        record.recompute();
        self.records.insert(key, Arc::new(Mutex::new(record)));
    }

    pub fn remove_provider(&self, provider_id: &ProviderId) -> usize {
        let mut removed = 0;
        for service_type in ServiceType::ALL {
            let key = (provider_id.clone(), service_type);
            if self.records.remove(&key).is_some() {
                removed += 1;
            }
            self.limits.remove(&key);
        }
        removed
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.records.iter().map(|entry| entry.key().0.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

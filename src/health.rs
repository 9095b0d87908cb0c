//! Health tracking.
//!
//! Keeps one rolling record per provider: a window of recent outcomes for
//! the error rate, an exponentially weighted response time, and the streak
//! counters that drive status transitions.

use std::{collections::VecDeque, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    clock::Clock,
    config::HealthConfig,
    model::{HealthRank, HealthRecord, HealthStatus, ProviderId},
};

#[derive(Debug)]
struct HealthState {
    record: HealthRecord,
    outcomes: VecDeque<bool>,
    success_streak: u32,
    samples: u64,
}

impl HealthState {
    fn new(record: HealthRecord) -> Self {
        Self {
            record,
            outcomes: VecDeque::new(),
            success_streak: 0,
            samples: 0,
        }
    }
}

pub struct HealthTracker {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    states: DashMap<ProviderId, Arc<Mutex<HealthState>>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            states: DashMap::new(),
        }
    }

    fn state(&self, provider_id: &ProviderId) -> Arc<Mutex<HealthState>> {
        if let Some(state) = self.states.get(provider_id) {
            return state.clone();
        }
        self.states
            .entry(provider_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(HealthState::new(HealthRecord::healthy(
                    provider_id.clone(),
                    self.clock.now(),
                ))))
            })
            .clone()
    }

    /// Creates the default record if the provider has none yet.
    pub fn ensure(&self, provider_id: &ProviderId) {
        self.state(provider_id);
    }

    pub fn record_outcome(&self, provider_id: &ProviderId, success: bool, latency_ms: u64) -> HealthRecord {
        let state = self.state(provider_id);
        let mut state = state.lock();
        let now = self.clock.now();

        state.outcomes.push_back(success);
        while state.outcomes.len() > self.config.window_size {
            state.outcomes.pop_front();
        }

        let latency = latency_ms as f64;
        state.record.avg_response_time_ms = if state.samples == 0 {
            latency
        } else {
            let alpha = self.config.latency_smoothing;
            alpha * latency + (1.0 - alpha) * state.record.avg_response_time_ms
        };
        state.samples += 1;

        if success {
            state.success_streak += 1;
            state.record.consecutive_failures = 0;
        } else {
            state.success_streak = 0;
            state.record.consecutive_failures += 1;
        }

        let failures = state.outcomes.iter().filter(|ok| !**ok).count();
        state.record.error_count = failures as u32;
        state.record.error_rate = failures as f64 / state.outcomes.len() as f64;
        state.record.last_checked = now;

        let previous = state.record.status;
        let next = self.next_status(&state);
        if next != previous {
            state.record.status = next;
            if next == HealthStatus::Healthy {
                // recovered: old failures no longer describe the supplier
                state.outcomes.clear();
                state.outcomes.push_back(true);
                state.record.error_count = 0;
                state.record.error_rate = 0.0;
                info!(provider_id = %provider_id, from = ?previous, "provider recovered");
            } else {
                warn!(
                    provider_id = %provider_id,
                    from = ?previous,
                    to = ?next,
                    error_rate = state.record.error_rate,
                    consecutive_failures = state.record.consecutive_failures,
                    "provider health degraded"
                );
            }
        }

        state.record.clone()
    }

    fn next_status(&self, state: &HealthState) -> HealthStatus {
        let config = &self.config;
        let record = &state.record;
        let current = record.status;

        let too_slow = record.avg_response_time_ms > config.latency_ceiling_ms;
        if current != HealthStatus::Healthy && state.success_streak >= config.recovery_success_streak {
            // a streak of slow successes only gets as far as degraded
            return if too_slow { HealthStatus::Degraded } else { HealthStatus::Healthy };
        }

        let enough_samples = state.outcomes.len() >= config.min_samples;
        let unhealthy = record.consecutive_failures >= config.unhealthy_consecutive_failures
            || (enough_samples && record.error_rate > config.unhealthy_error_rate);
        if unhealthy {
            return HealthStatus::Unhealthy;
        }

        let degraded = (enough_samples && record.error_rate > config.degraded_error_rate)
            || too_slow;
        match current {
            HealthStatus::Healthy if degraded => HealthStatus::Degraded,
            // only a success streak lifts a provider out of degraded/unhealthy
            status => status,
        }
    }

    /// Current record, or a synthesized healthy default when none exists.
    pub fn get_status(&self, provider_id: &ProviderId) -> HealthRecord {
        match self.states.get(provider_id) {
            Some(state) => state.lock().record.clone(),
            None => HealthRecord::healthy(provider_id.clone(), self.clock.now()),
        }
    }

    pub fn is_stale(&self, record: &HealthRecord, now: DateTime<Utc>) -> bool {
        now - record.last_checked > Duration::seconds(self.config.fresh_window_secs)
    }

    /// Routing preference for a provider; stale records rank as `Unknown`.
    pub fn routing_rank(&self, provider_id: &ProviderId) -> HealthRank {
        let record = self.get_status(provider_id);
        if self.is_stale(&record, self.clock.now()) {
            HealthRank::Unknown
        } else {
            record.status.rank()
        }
    }

    /// Loads a persisted record unless a newer one is already held.
    pub fn restore(&self, record: HealthRecord) -> bool {
        let state = self.state(&record.provider_id);
        let mut state = state.lock();
        if state.samples > 0 && state.record.last_checked >= record.last_checked {
            return false;
        }
        state.record = record;
        state.samples = state.samples.max(1);
        state.outcomes.clear();
        state.success_streak = 0;
        true
    }

    /// Drops the record when it is older than the purge horizon.
    pub fn purge_if_expired(&self, provider_id: &ProviderId) -> bool {
        let horizon = Duration::seconds(self.config.purge_horizon_secs);
        let now = self.clock.now();
        self.states
            .remove_if(provider_id, |_, state| now - state.lock().record.last_checked > horizon)
            .is_some()
    }

    pub fn purge_horizon(&self) -> Duration {
        Duration::seconds(self.config.purge_horizon_secs)
    }

    pub fn remove(&self, provider_id: &ProviderId) -> bool {
        self.states.remove(provider_id).is_some()
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.states.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn has_record(&self, provider_id: &ProviderId) -> bool {
        self.states.contains_key(provider_id)
    }
}

// Read-only view of the whole engine for dashboards and health endpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    model::{CircuitSnapshot, CircuitState, HealthRank, HealthRecord, Provider, QuotaRecord},
    orchestrator::Orchestrator,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub provider: Provider,
    pub health: HealthRecord,
    /// Health as routing sees it; stale records show as `Unknown`.
    pub routing_status: HealthRank,
    pub quotas: Vec<QuotaRecord>,
    pub circuit: CircuitSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTotals {
    pub providers: usize,
    pub enabled: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub open_circuits: usize,
    pub exhausted_quotas: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthSnapshot {
    pub generated_at: DateTime<Utc>,
    pub providers: Vec<ProviderSnapshot>,
    pub totals: SnapshotTotals,
}

impl Orchestrator {
    pub fn system_health_snapshot(&self) -> SystemHealthSnapshot {
        let providers: Vec<ProviderSnapshot> = self
            .registry
            .all()
            .into_iter()
            .map(|provider| ProviderSnapshot {
                health: self.health.get_status(&provider.id),
                routing_status: self.health.routing_rank(&provider.id),
                quotas: self.quota.records_for(&provider.id),
                circuit: self.breakers.snapshot(&provider.id),
                provider,
            })
            .collect();

        let mut totals = SnapshotTotals {
            providers: providers.len(),
            ..SnapshotTotals::default()
        };
        for snapshot in &providers {
            if snapshot.provider.enabled {
                totals.enabled += 1;
            }
            match snapshot.routing_status {
                HealthRank::Healthy => totals.healthy += 1,
                HealthRank::Degraded => totals.degraded += 1,
                HealthRank::Unhealthy => totals.unhealthy += 1,
                HealthRank::Unknown => totals.unknown += 1,
            }
            if snapshot.circuit.state == CircuitState::Open {
                totals.open_circuits += 1;
            }
            totals.exhausted_quotas += snapshot.quotas.iter().filter(|q| q.is_exhausted()).count();
        }

        SystemHealthSnapshot {
            generated_at: self.clock.now(),
            providers,
            totals,
        }
    }
}

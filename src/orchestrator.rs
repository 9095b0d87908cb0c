//! Provider orchestration engine.
//!
//! Owns the registry and the three per-provider trackers, mirrors their
//! state into the [`StateStore`], and exposes the admin surface. Routing lives
//! in `router.rs`, reconciliation in `reconcile.rs`.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use futures::future::try_join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    circuit_breaker::CircuitBreakerRegistry,
    clock::{Clock, SystemClock},
    config::{EngineConfig, ProviderConfig},
    error::{OrchestratorError, StoreError},
    health::HealthTracker,
    model::{CircuitState, Provider, ProviderId, ServiceType},
    quota::QuotaTracker,
    registry::ProviderRegistry,
    router::SupplierClient,
    store::{newest_by_key, InMemoryStore, ProviderRow, StateStore, StoredRow},
};

pub struct Orchestrator {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) registry: ProviderRegistry,
    pub(crate) health: HealthTracker,
    pub(crate) quota: QuotaTracker,
    pub(crate) breakers: CircuitBreakerRegistry,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) supplier: Arc<dyn SupplierClient>,
    // routing takes these shared around admission and settlement; the sweep
    // and cascading deletes take them exclusively, one provider at a time
    guards: DashMap<ProviderId, Arc<RwLock<()>>>,
}

pub struct OrchestratorBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    supplier: Arc<dyn SupplierClient>,
}

impl OrchestratorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        self.config.validate()?;
        let registry = ProviderRegistry::from_configs(&self.config.providers)?;
        let health = HealthTracker::new(self.config.health.clone(), self.clock.clone());
        let quota = QuotaTracker::new(self.config.quota.clone(), self.clock.clone());
        let breakers = CircuitBreakerRegistry::new(self.config.circuit_breaker.clone(), self.clock.clone());

        for limit in &self.config.quota_limits {
            quota.set_limit(
                &ProviderId::new(&limit.provider_id),
                limit.service_type()?,
                limit.limit,
                limit.period_secs,
            );
        }

        let orchestrator = Orchestrator {
            config: self.config,
            clock: self.clock,
            registry,
            health,
            quota,
            breakers,
            store: self.store,
            supplier: self.supplier,
            guards: DashMap::new(),
        };
        for provider in orchestrator.registry.all() {
            orchestrator.initialize_dependents(&provider.id);
        }
        info!(providers = orchestrator.registry.len(), "orchestrator ready");
        Ok(orchestrator)
    }
}

/// Result of applying a new provider catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReloadSummary {
    pub added: Vec<ProviderId>,
    pub updated: Vec<ProviderId>,
    pub removed: Vec<ProviderId>,
}

impl Orchestrator {
    pub fn builder(config: EngineConfig, supplier: Arc<dyn SupplierClient>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            clock: Arc::new(SystemClock),
            store: Arc::new(InMemoryStore::new()),
            supplier,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn guard(&self, provider_id: &ProviderId) -> Arc<RwLock<()>> {
        if let Some(guard) = self.guards.get(provider_id) {
            return guard.clone();
        }
        self.guards
            .entry(provider_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub(crate) fn forget_guard(&self, provider_id: &ProviderId) {
        self.guards.remove(provider_id);
    }

    pub(crate) fn guard_ids(&self) -> Vec<ProviderId> {
        self.guards.iter().map(|entry| entry.key().clone()).collect()
    }

    // Default health, quota and breaker state for a freshly known provider
    fn initialize_dependents(&self, provider_id: &ProviderId) {
        self.health.ensure(provider_id);
        for service_type in ServiceType::ALL {
            self.quota.ensure(provider_id, service_type);
        }
        self.breakers.ensure(provider_id);
    }

    // Drop every dependent record of a provider; returns how many were removed
    pub(crate) fn drop_dependents(&self, provider_id: &ProviderId) -> usize {
        let mut removed = self.quota.remove_provider(provider_id);
        if self.health.remove(provider_id) {
            removed += 1;
        }
        if self.breakers.remove(provider_id) {
            removed += 1;
        }
        removed
    }

    pub async fn register_provider(&self, provider: Provider) -> Result<(), OrchestratorError> {
        let provider_id = provider.id.clone();
        {
            let guard = self.guard(&provider_id);
            let _shared = guard.read();
            self.registry.register(provider)?;
            self.initialize_dependents(&provider_id);
        }
        self.persist(&provider_id).await;
        Ok(())
    }

    pub fn upsert_provider(&self, provider: Provider) -> Result<Provider, OrchestratorError> {
        self.registry.upsert(provider)
    }

    /// Removes a provider together with its health, quota and breaker state.
    pub async fn remove_provider(&self, provider_id: &ProviderId) -> Result<Provider, OrchestratorError> {
        let removed = {
            let guard = self.guard(provider_id);
            let _exclusive = guard.write();
            let provider = self.registry.remove(provider_id)?;
            self.drop_dependents(provider_id);
            provider
        };
        self.forget_guard(provider_id);

        if let Err(err) = self.store.delete_provider(provider_id).await {
            // orphaned rows are collected by the next sweep
            warn!(provider_id = %provider_id, error = %err, "failed to delete provider rows");
        }
        info!(provider_id = %provider_id, "provider removed");
        Ok(removed)
    }

    /// Applies a full provider catalog: registers new ids, updates known ones
    /// and removes ids that are no longer configured. The catalog is validated
    /// before anything changes.
    pub async fn reload_providers(&self, configs: &[ProviderConfig]) -> Result<ReloadSummary, OrchestratorError> {
        let mut incoming: HashMap<ProviderId, Provider> = HashMap::new();
        for config in configs {
            let provider = Provider::try_from(config.clone())?;
            if let Ok(current) = self.registry.get(&provider.id) {
                if current.capability != provider.capability {
                    return Err(OrchestratorError::CapabilityImmutable {
                        provider_id: provider.id.clone(),
                        current: current.capability,
                        requested: provider.capability,
                    });
                }
            }
            if incoming.insert(provider.id.clone(), provider.clone()).is_some() {
                return Err(OrchestratorError::DuplicateProvider(provider.id));
            }
        }

        let mut summary = ReloadSummary::default();
        for existing in self.registry.all() {
            if !incoming.contains_key(&existing.id) {
                self.remove_provider(&existing.id).await?;
                summary.removed.push(existing.id);
            }
        }

        let mut providers: Vec<Provider> = incoming.into_values().collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        for provider in providers {
            let provider_id = provider.id.clone();
            if self.registry.contains(&provider_id) {
                if self.registry.get(&provider_id)? != provider {
                    self.registry.upsert(provider)?;
                    summary.updated.push(provider_id);
                }
            } else {
                self.register_provider(provider).await?;
                summary.added.push(provider_id);
            }
        }

        info!(
            added = summary.added.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            "provider catalog reloaded"
        );
        Ok(summary)
    }

    pub fn set_enabled(&self, provider_id: &ProviderId, enabled: bool) -> Result<(), OrchestratorError> {
        self.registry.set_enabled(provider_id, enabled)
    }

    /// Manual breaker override. Authorization is the caller's responsibility.
    pub async fn force_circuit_state(&self, provider_id: &ProviderId, state: CircuitState) -> Result<(), OrchestratorError> {
        if !self.registry.contains(provider_id) {
            return Err(OrchestratorError::NotFound(provider_id.clone()));
        }
        {
            let guard = self.guard(provider_id);
            let _shared = guard.read();
            self.breakers.force_state(provider_id, state);
        }
        self.persist_circuit(provider_id).await;
        Ok(())
    }

    /// Loads persisted rows into memory. Duplicate rows collapse to the most
    /// recent one and rows for unknown providers are ignored.
    pub async fn hydrate(&self) -> Result<(), OrchestratorError> {
        let (health, _) = newest_by_key(
            self.known_rows(self.store.list_health().await?),
            |record| record.provider_id.clone(),
            |row| (row.record.last_checked, row.row_id),
        );
        for (_, row) in health {
            self.health.restore(row.record);
        }

        let (quota, _) = newest_by_key(
            self.known_rows(self.store.list_quota().await?),
            |record| (record.provider_id.clone(), record.service_type),
            |row| (row.record.reset_time, row.row_id),
        );
        for (_, row) in quota {
            self.quota.restore(row.record);
        }

        let (circuits, _) = newest_by_key(
            self.known_rows(self.store.list_circuits().await?),
            |snapshot| snapshot.provider_id.clone(),
            |row| row.row_id,
        );
        for (_, row) in circuits {
            self.breakers.restore(&row.record);
        }

        info!("state hydrated from store");
        Ok(())
    }

    /// Writes the provider's current health, quota and breaker state through to the store.
    pub(crate) async fn persist(&self, provider_id: &ProviderId) {
        if !self.registry.contains(provider_id) {
            return;
        }
        let result = futures::try_join!(
            self.persist_health_rows(provider_id),
            self.persist_quota_rows(provider_id),
            self.store.put_circuit(self.breakers.snapshot(provider_id)),
        );
        if let Err(err) = result {
            warn!(provider_id = %provider_id, error = %err, "failed to persist provider state");
        }
    }

    pub(crate) async fn persist_circuit(&self, provider_id: &ProviderId) {
        if let Err(err) = self.store.put_circuit(self.breakers.snapshot(provider_id)).await {
            warn!(provider_id = %provider_id, error = %err, "failed to persist circuit state");
        }
    }

    pub(crate) async fn persist_quotas(&self, provider_id: &ProviderId) {
        if let Err(err) = self.persist_quota_rows(provider_id).await {
            warn!(provider_id = %provider_id, error = %err, "failed to persist quota state");
        }
    }

    // Rows whose provider is still registered
    fn known_rows<T: ProviderRow>(&self, rows: Vec<StoredRow<T>>) -> Vec<StoredRow<T>> {
        rows.into_iter()
            .filter(|row| self.registry.contains(row.record.provider_id()))
            .collect()
    }

    async fn persist_health_rows(&self, provider_id: &ProviderId) -> Result<(), StoreError> {
        if !self.health.has_record(provider_id) {
            return Ok(());
        }
        self.store.put_health(self.health.get_status(provider_id)).await
    }

    async fn persist_quota_rows(&self, provider_id: &ProviderId) -> Result<(), StoreError> {
        let writes = self
            .quota
            .records_for(provider_id)
            .into_iter()
            .map(|record| self.store.put_quota(record));
        try_join_all(writes).await.map(|_| ())
    }
}

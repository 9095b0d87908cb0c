//! Provider catalog.
//!
//! Holds every configured supplier keyed by normalized id. Entries live in a
//! sharded map so updates to one provider never serialize lookups for another.

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::info;

use crate::{
    config::ProviderConfig,
    error::OrchestratorError,
    model::{Capability, Provider, ProviderId},
};

#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: DashMap<ProviderId, Provider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ProviderConfig]) -> Result<Self, OrchestratorError> {
        let registry = Self::new();
        for config in configs {
            registry.register(Provider::try_from(config.clone())?)?;
        }
        Ok(registry)
    }

    /// Adds a new provider. Ids are unique; registering a known id fails.
    pub fn register(&self, provider: Provider) -> Result<(), OrchestratorError> {
        match self.providers.entry(provider.id.clone()) {
            Entry::Occupied(_) => Err(OrchestratorError::DuplicateProvider(provider.id)),
            Entry::Vacant(slot) => {
                info!(
                    provider_id = %provider.id,
                    capability = %provider.capability,
                    priority = provider.priority,
                    "provider registered"
                );
                slot.insert(provider);
                Ok(())
            }
        }
    }

    /// Replaces the mutable attributes of a known provider in one step and
    /// returns the previous version.
    pub fn upsert(&self, provider: Provider) -> Result<Provider, OrchestratorError> {
        let mut current = self
            .providers
            .get_mut(&provider.id)
            .ok_or_else(|| OrchestratorError::NotFound(provider.id.clone()))?;

        if current.capability != provider.capability {
            return Err(OrchestratorError::CapabilityImmutable {
                provider_id: provider.id.clone(),
                current: current.capability,
                requested: provider.capability,
            });
        }

        let previous = std::mem::replace(&mut *current, provider);
        info!(provider_id = %previous.id, "provider updated");
        Ok(previous)
    }

    pub fn set_enabled(&self, provider_id: &ProviderId, enabled: bool) -> Result<(), OrchestratorError> {
        let mut provider = self
            .providers
            .get_mut(provider_id)
            .ok_or_else(|| OrchestratorError::NotFound(provider_id.clone()))?;
        if provider.enabled != enabled {
            provider.enabled = enabled;
            info!(provider_id = %provider_id, enabled, "provider enablement changed");
        }
        Ok(())
    }

    pub fn remove(&self, provider_id: &ProviderId) -> Result<Provider, OrchestratorError> {
        self.providers
            .remove(provider_id)
            .map(|(_, provider)| provider)
            .ok_or_else(|| OrchestratorError::NotFound(provider_id.clone()))
    }

    pub fn get(&self, provider_id: &ProviderId) -> Result<Provider, OrchestratorError> {
        self.providers
            .get(provider_id)
            .map(|p| p.clone())
            .ok_or_else(|| OrchestratorError::NotFound(provider_id.clone()))
    }

    pub fn contains(&self, provider_id: &ProviderId) -> bool {
        self.providers.contains_key(provider_id)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Every provider, ordered by id.
    pub fn all(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.providers.iter().map(|p| p.clone()).collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        providers
    }

    /// Enabled providers serving `capability`, by ascending priority then id.
    pub fn list_candidates(&self, capability: Capability) -> Vec<Provider> {
        let mut candidates: Vec<Provider> = self
            .providers
            .iter()
            .filter(|p| p.enabled && p.capability == capability)
            .map(|p| p.clone())
            .collect();
        candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hotel(id: &str, priority: u32) -> Provider {
        Provider::new(id, Capability::Hotel, priority)
    }

    #[test]
    fn test_list_candidates_filters_and_orders() {
        let registry = ProviderRegistry::new();
        registry.register(hotel("c", 2)).unwrap();
        registry.register(hotel("b", 2)).unwrap();
        registry.register(hotel("a", 3)).unwrap();
        registry.register(Provider::new("f", Capability::Flight, 1)).unwrap();
        let mut disabled = hotel("d", 1);
        disabled.enabled = false;
        registry.register(disabled).unwrap();

        let ids: Vec<String> = registry
            .list_candidates(Capability::Hotel)
            .into_iter()
            .map(|p| p.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_register_rejects_duplicates_across_spellings() {
        let registry = ProviderRegistry::new();
        registry.register(hotel("Bedbank", 1)).unwrap();
        let err = registry.register(hotel(" bedbank", 2)).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateProvider(_)));
    }

    #[test]
    fn test_upsert_replaces_mutable_fields() {
        let registry = ProviderRegistry::new();
        registry.register(hotel("a", 1)).unwrap();

        let mut updated = hotel("a", 5);
        updated.name = "Renamed".to_string();
        updated.enabled = false;
        let previous = registry.upsert(updated).unwrap();
        assert_eq!(previous.priority, 1);

        let current = registry.get(&ProviderId::new("a")).unwrap();
        assert_eq!(current.priority, 5);
        assert_eq!(current.name, "Renamed");
        assert!(!current.enabled);
    }

    #[test]
    fn test_upsert_unknown_and_capability_change_rejected() {
        let registry = ProviderRegistry::new();
        let err = registry.upsert(hotel("ghost", 1)).unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        registry.register(hotel("a", 1)).unwrap();
        let err = registry
            .upsert(Provider::new("a", Capability::Flight, 1))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::CapabilityImmutable { .. }));
        assert_eq!(
            registry.get(&ProviderId::new("a")).unwrap().capability,
            Capability::Hotel
        );
    }

    #[test]
    fn test_set_enabled_and_remove() {
        let registry = ProviderRegistry::new();
        registry.register(hotel("a", 1)).unwrap();
        let id = ProviderId::new("a");

        registry.set_enabled(&id, false).unwrap();
        assert!(registry.list_candidates(Capability::Hotel).is_empty());

        registry.remove(&id).unwrap();
        assert!(!registry.contains(&id));
        assert!(matches!(
            registry.set_enabled(&id, true),
            Err(OrchestratorError::NotFound(_))
        ));
    }
}

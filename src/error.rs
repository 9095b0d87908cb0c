use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    model::{Capability, ProviderId, ServiceType},
    router::Attempt,
};

// Engine-level errors surfaced to request handlers and admin callers
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Provider not found: {0}")]
    NotFound(ProviderId),

    #[error("Invalid capability: {0}")]
    InvalidCapability(String),

    #[error("Capability of {provider_id} is immutable ({current} -> {requested})")]
    CapabilityImmutable {
        provider_id: ProviderId,
        current: Capability,
        requested: Capability,
    },

    #[error("Provider already registered: {0}")]
    DuplicateProvider(ProviderId),

    #[error("Invalid service type: {0}")]
    InvalidServiceType(String),

    #[error("Circuit breaker open for {provider_id}")]
    CircuitOpen {
        provider_id: ProviderId,
        retry_after: Option<DateTime<Utc>>,
    },

    #[error("Quota exceeded for {provider_id}/{service_type}: {used}/{limit}")]
    QuotaExceeded {
        provider_id: ProviderId,
        service_type: ServiceType,
        used: u64,
        limit: u64,
    },

    #[error("Supplier {provider_id} timed out after {timeout_ms}ms")]
    SupplierTimeout {
        provider_id: ProviderId,
        timeout_ms: u64,
    },

    #[error("Supplier {provider_id} failed: {source}")]
    SupplierError {
        provider_id: ProviderId,
        #[source]
        source: SupplierError,
    },

    #[error("All providers unavailable for {capability}/{service_type} after {} attempts", .attempts.len())]
    AllProvidersUnavailable {
        capability: Capability,
        service_type: ServiceType,
        attempts: Vec<Attempt>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

// Failures reported by a supplier API client
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SupplierError {
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("API error: {status_code} - {message}")]
    Response { status_code: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    /// The request never left the client, so the supplier did not see it.
    #[error("Request not dispatched: {0}")]
    NotDispatched(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

// Provider orchestration engine: routes supplier calls across flight, hotel
// and activity providers with health tracking, quotas and circuit breakers

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod mock_supplier;
pub mod model;
pub mod orchestrator;
pub mod quota;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod snapshot;
pub mod store;

// Re-export key types for convenience
pub use circuit_breaker::{CallPermit, CircuitBreakerRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, ProviderConfig, QuotaLimitConfig};
pub use error::{OrchestratorError, StoreError, SupplierError};
pub use model::{
    Capability, CircuitSnapshot, CircuitState, HealthRank, HealthRecord, HealthStatus, Provider, ProviderId,
    QuotaRecord, QuotaStatus, ServiceType,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, ReloadSummary};
pub use quota::{QuotaPermit, QuotaTracker};
pub use reconcile::{Maintenance, SweepReport};
pub use router::{Attempt, AttemptOutcome, RouteOutcome, RoutePlan, RouteRequest, SupplierClient};
pub use snapshot::{ProviderSnapshot, SystemHealthSnapshot};
pub use store::{InMemoryStore, StateStore};

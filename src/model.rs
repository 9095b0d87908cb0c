// Domain types shared by the registry, the trackers and the router

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;

/// Normalized supplier identifier.
///
/// Identifiers arriving from configuration, admin calls or persisted rows are
/// trimmed and lower-cased so `" Amadeus"` and `"amadeus"` name one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for ProviderId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for ProviderId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<ProviderId> for String {
    fn from(id: ProviderId) -> Self {
        id.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Service category a provider can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Flight,
    Hotel,
    Activity,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Flight, Capability::Hotel, Capability::Activity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Flight => "flight",
            Capability::Hotel => "hotel",
            Capability::Activity => "activity",
        }
    }
}

impl FromStr for Capability {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flight" => Ok(Capability::Flight),
            "hotel" => Ok(Capability::Hotel),
            "activity" => Ok(Capability::Activity),
            _ => Err(OrchestratorError::InvalidCapability(s.to_string())),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Operation a request performs against a supplier; quota is tracked per service type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Search,
    Booking,
    Cancellation,
}

impl ServiceType {
    pub const ALL: [ServiceType; 3] = [
        ServiceType::Search,
        ServiceType::Booking,
        ServiceType::Cancellation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Search => "search",
            ServiceType::Booking => "booking",
            ServiceType::Cancellation => "cancellation",
        }
    }
}

impl FromStr for ServiceType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "search" => Ok(ServiceType::Search),
            "booking" => Ok(ServiceType::Booking),
            "cancellation" => Ok(ServiceType::Cancellation),
            _ => Err(OrchestratorError::InvalidServiceType(s.to_string())),
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured upstream supplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub capability: Capability,
    /// Lower is preferred.
    pub priority: u32,
    pub enabled: bool,
    pub endpoint: String,
    /// Upper bound for a single supplier call.
    pub timeout_ms: u64,
}

impl Provider {
    pub fn new(id: impl Into<ProviderId>, capability: Capability, priority: u32) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            capability,
            priority,
            enabled: true,
            endpoint: String::new(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn rank(&self) -> HealthRank {
        match self {
            HealthStatus::Healthy => HealthRank::Healthy,
            HealthStatus::Degraded => HealthRank::Degraded,
            HealthStatus::Unhealthy => HealthRank::Unhealthy,
        }
    }
}

/// Routing preference derived from a health record.
///
/// `Unknown` is what a stale record degrades to; it ranks below `Degraded`
/// but above `Unhealthy` so cold providers are not mistaken for failing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthRank {
    Unhealthy = 0,
    Unknown = 1,
    Degraded = 2,
    Healthy = 3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub provider_id: ProviderId,
    pub status: HealthStatus,
    /// Failures inside the rolling outcome window.
    pub error_count: u32,
    pub error_rate: f64,
    pub avg_response_time_ms: f64,
    pub consecutive_failures: u32,
    pub last_checked: DateTime<Utc>,
}

impl HealthRecord {
    pub fn healthy(provider_id: ProviderId, now: DateTime<Utc>) -> Self {
        Self {
            provider_id,
            status: HealthStatus::Healthy,
            error_count: 0,
            error_rate: 0.0,
            avg_response_time_ms: 0.0,
            consecutive_failures: 0,
            last_checked: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Healthy,
    Warning,
    Critical,
    Exhausted,
}

impl QuotaStatus {
    pub fn from_percentage(percentage_used: f64) -> Self {
        if percentage_used >= 100.0 {
            QuotaStatus::Exhausted
        } else if percentage_used >= 95.0 {
            QuotaStatus::Critical
        } else if percentage_used >= 80.0 {
            QuotaStatus::Warning
        } else {
            QuotaStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub provider_id: ProviderId,
    pub service_type: ServiceType,
    pub quota_limit: u64,
    pub quota_used: u64,
    /// May exceed 100 for observability; routing treats anything >= 100 as exhausted.
    pub percentage_used: f64,
    pub status: QuotaStatus,
    pub reset_time: DateTime<Utc>,
    pub period_secs: i64,
}

impl QuotaRecord {
    pub fn new(
        provider_id: ProviderId,
        service_type: ServiceType,
        quota_limit: u64,
        period_secs: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self {
            provider_id,
            service_type,
            quota_limit,
            quota_used: 0,
            percentage_used: 0.0,
            status: QuotaStatus::Healthy,
            reset_time: now + chrono::Duration::seconds(period_secs),
            period_secs,
        };
        record.recompute();
        record
    }

    pub fn recompute(&mut self) {
        self.percentage_used = if self.quota_limit == 0 {
            100.0
        } else {
            self.quota_used as f64 / self.quota_limit as f64 * 100.0
        };
        self.status = QuotaStatus::from_percentage(self.percentage_used);
    }

    pub fn remaining(&self) -> u64 {
        self.quota_limit.saturating_sub(self.quota_used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.status == QuotaStatus::Exhausted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

/// Read-only view of a provider's breaker, also the persisted row shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub provider_id: ProviderId,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    /// Only meaningful while `Open`.
    pub next_attempt: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub reopen_count: u32,
}

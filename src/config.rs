// Engine configuration: provider catalog, quota limits and tracker tuning

use std::{fs, path::Path, str::FromStr};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    error::OrchestratorError,
    model::{Capability, Provider, ProviderId, ServiceType},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub health: HealthConfig,
    pub quota: QuotaConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub sweep: SweepConfig,
    pub providers: Vec<ProviderConfig>,
    pub quota_limits: Vec<QuotaLimitConfig>,
}

// Health tracker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Records older than this are treated as `unknown` when routing.
    pub fresh_window_secs: i64,
    /// Records older than this are purged by the reconciliation sweep.
    pub purge_horizon_secs: i64,
    /// Number of recent outcomes used for the rolling error rate.
    pub window_size: usize,
    /// Error-rate rules only apply once the window holds this many outcomes.
    pub min_samples: usize,
    pub degraded_error_rate: f64,
    pub unhealthy_error_rate: f64,
    pub latency_ceiling_ms: f64,
    pub unhealthy_consecutive_failures: u32,
    pub recovery_success_streak: u32,
    /// Weight of the newest sample in the response-time moving average.
    pub latency_smoothing: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            fresh_window_secs: 5 * 60,
            purge_horizon_secs: 7 * 24 * 60 * 60,
            window_size: 20,
            min_samples: 5,
            degraded_error_rate: 0.10,
            unhealthy_error_rate: 0.50,
            latency_ceiling_ms: 5_000.0,
            unhealthy_consecutive_failures: 3,
            recovery_success_streak: 3,
            latency_smoothing: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Limit applied to (provider, service type) pairs without an explicit entry.
    pub default_limit: u64,
    pub default_period_secs: i64,
    /// Give the reservation back when the supplier call never left the client.
    pub refund_undispatched: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_limit: 10_000,
            default_period_secs: 60 * 60,
            refund_undispatched: true,
        }
    }
}

// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_secs: i64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    /// Extra time a half-open probe keeps its slot beyond the provider's call
    /// timeout. A probe that has not reported back by then frees the slot.
    pub probe_grace_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_secs: 60,
            initial_backoff_ms: 30_000,
            max_backoff_ms: 10 * 60 * 1000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            probe_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    /// Breakers open for longer than this are forced closed.
    pub max_open_age_secs: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_open_age_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub capability: String,
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl TryFrom<ProviderConfig> for Provider {
    type Error = OrchestratorError;

    fn try_from(config: ProviderConfig) -> Result<Self, Self::Error> {
        let id = ProviderId::new(&config.id);
        if id.is_empty() {
            return Err(OrchestratorError::Config(
                "provider id must not be empty".to_string(),
            ));
        }
        let capability = Capability::from_str(&config.capability)?;

        Ok(Provider {
            name: config.name.unwrap_or_else(|| id.to_string()),
            id,
            capability,
            priority: config.priority,
            enabled: config.enabled,
            endpoint: config.endpoint,
            timeout_ms: config.timeout_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaLimitConfig {
    pub provider_id: String,
    pub service_type: String,
    pub limit: u64,
    #[serde(default)]
    pub period_secs: Option<i64>,
}

impl QuotaLimitConfig {
    pub fn service_type(&self) -> Result<ServiceType, OrchestratorError> {
        ServiceType::from_str(&self.service_type)
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(raw).context("failed to parse engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let health = &self.health;
        if health.window_size == 0 {
            return Err(config_error("health.window_size must be positive"));
        }
        if !(0.0..=1.0).contains(&health.degraded_error_rate)
            || !(0.0..=1.0).contains(&health.unhealthy_error_rate)
        {
            return Err(config_error("health error rates must be within 0.0..=1.0"));
        }
        if health.degraded_error_rate > health.unhealthy_error_rate {
            return Err(config_error(
                "health.degraded_error_rate must not exceed unhealthy_error_rate",
            ));
        }
        if !(health.latency_smoothing > 0.0 && health.latency_smoothing <= 1.0) {
            return Err(config_error("health.latency_smoothing must be within (0.0, 1.0]"));
        }
        if health.fresh_window_secs <= 0 || health.purge_horizon_secs < health.fresh_window_secs {
            return Err(config_error(
                "health.purge_horizon_secs must be at least fresh_window_secs, both positive",
            ));
        }
        if health.recovery_success_streak == 0 || health.unhealthy_consecutive_failures == 0 {
            return Err(config_error("health streak thresholds must be positive"));
        }

        if self.quota.default_period_secs <= 0 {
            return Err(config_error("quota.default_period_secs must be positive"));
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(config_error("circuit_breaker.failure_threshold must be positive"));
        }
        if breaker.backoff_multiplier < 1.0 {
            return Err(config_error("circuit_breaker.backoff_multiplier must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&breaker.jitter_factor) {
            return Err(config_error("circuit_breaker.jitter_factor must be within 0.0..=1.0"));
        }
        if breaker.initial_backoff_ms > breaker.max_backoff_ms {
            return Err(config_error(
                "circuit_breaker.initial_backoff_ms must not exceed max_backoff_ms",
            ));
        }

        if self.sweep.interval_secs == 0 || self.sweep.max_open_age_secs <= 0 {
            return Err(config_error("sweep intervals must be positive"));
        }

        for limit in &self.quota_limits {
            limit.service_type()?;
            if matches!(limit.period_secs, Some(period) if period <= 0) {
                return Err(config_error(&format!(
                    "quota period for {} must be positive",
                    limit.provider_id
                )));
            }
        }

        Ok(())
    }
}

fn config_error(message: &str) -> OrchestratorError {
    OrchestratorError::Config(message.to_string())
}

//! Candidate selection and failover.
//!
//! `plan` turns the registry, breaker, quota and health views into an ordered
//! candidate list. `route` walks that list one supplier at a time until a call
//! succeeds; per-candidate failures become routing decisions and only an
//! exhausted list is reported to the caller.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    circuit_breaker::CallPermit,
    error::{OrchestratorError, SupplierError},
    model::{Capability, HealthRank, Provider, ProviderId, ServiceType},
    orchestrator::Orchestrator,
    quota::QuotaPermit,
};

/// Opaque supplier API client. Payload formats are the client's business.
#[async_trait]
pub trait SupplierClient: Send + Sync + 'static {
    async fn call(&self, provider: &Provider, request: &RouteRequest) -> Result<Bytes, SupplierError>;
}

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub capability: Capability,
    pub service_type: ServiceType,
    pub correlation_id: String,
    pub payload: Bytes,
    /// Quota units one call consumes.
    pub quota_units: u64,
}

impl RouteRequest {
    pub fn new(capability: Capability, service_type: ServiceType, payload: impl Into<Bytes>) -> Self {
        Self {
            capability,
            service_type,
            correlation_id: String::new(),
            payload: payload.into(),
            quota_units: 1,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub provider: Provider,
    pub rank: HealthRank,
    /// Unhealthy providers are only tried after every other candidate.
    pub last_resort: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    Disabled,
    CircuitOpen,
    QuotaExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub provider_id: ProviderId,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePlan {
    pub capability: Capability,
    pub service_type: ServiceType,
    pub candidates: Vec<Candidate>,
    pub excluded: Vec<Exclusion>,
}

impl RoutePlan {
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.candidates.iter().map(|c| c.provider.id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    CircuitOpen { retry_after: Option<DateTime<Utc>> },
    QuotaExceeded { used: u64, limit: u64 },
    Timeout { timeout_ms: u64 },
    Failed { error: SupplierError },
    /// The provider was removed between planning and admission.
    Unregistered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub provider_id: ProviderId,
    pub outcome: AttemptOutcome,
    /// Set only when the supplier was actually called.
    pub latency_ms: Option<u64>,
}

impl Attempt {
    /// The engine error this attempt corresponds to, if it failed.
    pub fn error(&self, service_type: ServiceType) -> Option<OrchestratorError> {
        let provider_id = self.provider_id.clone();
        match &self.outcome {
            AttemptOutcome::Succeeded => None,
            AttemptOutcome::CircuitOpen { retry_after } => Some(OrchestratorError::CircuitOpen {
                provider_id,
                retry_after: *retry_after,
            }),
            AttemptOutcome::QuotaExceeded { used, limit } => Some(OrchestratorError::QuotaExceeded {
                provider_id,
                service_type,
                used: *used,
                limit: *limit,
            }),
            AttemptOutcome::Timeout { timeout_ms } => Some(OrchestratorError::SupplierTimeout {
                provider_id,
                timeout_ms: *timeout_ms,
            }),
            AttemptOutcome::Failed { error } => Some(OrchestratorError::SupplierError {
                provider_id,
                source: error.clone(),
            }),
            AttemptOutcome::Unregistered => Some(OrchestratorError::NotFound(provider_id)),
        }
    }

    /// Whether the supplier saw this attempt.
    pub fn reached_supplier(&self) -> bool {
        match &self.outcome {
            AttemptOutcome::Succeeded | AttemptOutcome::Timeout { .. } => true,
            AttemptOutcome::Failed { error } => !matches!(error, SupplierError::NotDispatched(_)),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub provider_id: ProviderId,
    pub response: Bytes,
    /// Every attempt made for this request, the successful one last.
    pub attempts: Vec<Attempt>,
}

impl Orchestrator {
    /// Ordered candidate list for a request.
    ///
    /// Disabled providers and those with an open breaker or an exhausted
    /// quota are excluded.
    /// The rest are ordered by priority, then health rank, then id, with
    /// unhealthy providers moved behind everyone else.
    pub fn plan(&self, request: &RouteRequest) -> RoutePlan {
        let mut preferred = Vec::new();
        let mut last_resort = Vec::new();
        let mut excluded: Vec<Exclusion> = self
            .registry
            .all()
            .into_iter()
            .filter(|p| p.capability == request.capability && !p.enabled)
            .map(|p| Exclusion {
                provider_id: p.id,
                reason: ExclusionReason::Disabled,
            })
            .collect();

        for provider in self.registry.list_candidates(request.capability) {
            let provider_id = provider.id.clone();
            if !self.breakers.is_call_permitted(&provider_id) {
                excluded.push(Exclusion {
                    provider_id,
                    reason: ExclusionReason::CircuitOpen,
                });
                continue;
            }
            if self.quota.is_exhausted(&provider_id, request.service_type) {
                excluded.push(Exclusion {
                    provider_id,
                    reason: ExclusionReason::QuotaExhausted,
                });
                continue;
            }

            let rank = self.health.routing_rank(&provider_id);
            if rank == HealthRank::Unhealthy {
                last_resort.push(Candidate {
                    provider,
                    rank,
                    last_resort: true,
                });
            } else {
                preferred.push(Candidate {
                    provider,
                    rank,
                    last_resort: false,
                });
            }
        }

        preferred.sort_by(|a, b| {
            a.provider
                .priority
                .cmp(&b.provider.priority)
                .then_with(|| b.rank.cmp(&a.rank))
                .then_with(|| a.provider.id.cmp(&b.provider.id))
        });
        last_resort.sort_by(|a, b| {
            a.provider
                .priority
                .cmp(&b.provider.priority)
                .then_with(|| a.provider.id.cmp(&b.provider.id))
        });
        preferred.extend(last_resort);

        RoutePlan {
            capability: request.capability,
            service_type: request.service_type,
            candidates: preferred,
            excluded,
        }
    }

    /// Routes a request with failover across the planned candidates.
    pub async fn route(&self, request: RouteRequest) -> Result<RouteOutcome, OrchestratorError> {
        let plan = self.plan(&request);
        let mut attempts = Vec::with_capacity(plan.candidates.len());

        for candidate in &plan.candidates {
            let attempt = self.attempt(&candidate.provider, &request).await;
            match attempt {
                Ok((response, attempt)) => {
                    let provider_id = attempt.provider_id.clone();
                    attempts.push(attempt);
                    debug!(
                        correlation_id = %request.correlation_id,
                        provider_id = %provider_id,
                        attempts = attempts.len(),
                        "request routed"
                    );
                    return Ok(RouteOutcome {
                        provider_id,
                        response,
                        attempts,
                    });
                }
                Err(attempt) => {
                    if let Some(error) = attempt.error(request.service_type) {
                        debug!(
                            correlation_id = %request.correlation_id,
                            provider_id = %attempt.provider_id,
                            %error,
                            "candidate failed, trying next"
                        );
                    }
                    attempts.push(attempt);
                }
            }
        }

        warn!(
            correlation_id = %request.correlation_id,
            capability = %request.capability,
            service_type = %request.service_type,
            attempts = attempts.len(),
            excluded = plan.excluded.len(),
            "all providers unavailable"
        );
        Err(OrchestratorError::AllProvidersUnavailable {
            capability: request.capability,
            service_type: request.service_type,
            attempts,
        })
    }

    // Admission: breaker permit first, then quota. A quota refusal hands the
    // breaker permit back untouched.
    fn admit(&self, provider: &Provider, request: &RouteRequest) -> Result<(CallPermit, QuotaPermit), AttemptOutcome> {
        let provider_id = &provider.id;
        if !self.registry.contains(provider_id) {
            return Err(AttemptOutcome::Unregistered);
        }
        let guard = self.guard(provider_id);
        let _shared = guard.read();
        // removal holds the guard exclusively, so this answer stays true until settlement starts
        if !self.registry.contains(provider_id) {
            return Err(AttemptOutcome::Unregistered);
        }

        let call_timeout = Duration::from_millis(provider.timeout_ms);
        let call_permit = self.breakers.try_acquire(provider_id, call_timeout).map_err(|err| match err {
            OrchestratorError::CircuitOpen { retry_after, .. } => AttemptOutcome::CircuitOpen { retry_after },
            _ => AttemptOutcome::CircuitOpen { retry_after: None },
        })?;

        match self
            .quota
            .reserve(provider_id, request.service_type, request.quota_units)
        {
            Ok(quota_permit) => Ok((call_permit, quota_permit)),
            Err(err) => {
                self.breakers.abandon(call_permit);
                Err(match err {
                    OrchestratorError::QuotaExceeded { used, limit, .. } => {
                        AttemptOutcome::QuotaExceeded { used, limit }
                    }
                    _ => AttemptOutcome::QuotaExceeded { used: 0, limit: 0 },
                })
            }
        }
    }

    // Settlement: record the finished call to health, breaker and quota
    fn settle(
        &self,
        provider_id: &ProviderId,
        call_permit: CallPermit,
        quota_permit: QuotaPermit,
        result: &Result<Bytes, SupplierError>,
        latency_ms: u64,
    ) {
        let guard = self.guard(provider_id);
        let _shared = guard.read();
        if !self.registry.contains(provider_id) {
            // removed while the call was in flight; its state is already gone
            return;
        }

        match result {
            Ok(_) => {
                self.health.record_outcome(provider_id, true, latency_ms);
                self.breakers.record_success(call_permit);
                self.quota.release(quota_permit);
            }
            Err(SupplierError::NotDispatched(_)) => {
                self.breakers.abandon(call_permit);
                self.quota.report_failure(quota_permit, false);
            }
            Err(_) => {
                self.health.record_outcome(provider_id, false, latency_ms);
                self.breakers.record_failure(call_permit);
                self.quota.report_failure(quota_permit, true);
            }
        }
    }

    async fn attempt(&self, provider: &Provider, request: &RouteRequest) -> Result<(Bytes, Attempt), Attempt> {
        let provider_id = &provider.id;
        let (call_permit, quota_permit) = match self.admit(provider, request) {
            Ok(permits) => permits,
            Err(outcome) => {
                return Err(Attempt {
                    provider_id: provider_id.clone(),
                    outcome,
                    latency_ms: None,
                })
            }
        };

        let started = tokio::time::Instant::now();
        let timeout = Duration::from_millis(provider.timeout_ms);
        let result = match tokio::time::timeout(timeout, self.supplier.call(provider, request)).await {
            Ok(result) => result,
            Err(_) => Err(SupplierError::Timeout(provider.timeout_ms)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        self.settle(provider_id, call_permit, quota_permit, &result, latency_ms);
        self.persist(provider_id).await;

        match result {
            Ok(response) => Ok((
                response,
                Attempt {
                    provider_id: provider_id.clone(),
                    outcome: AttemptOutcome::Succeeded,
                    latency_ms: Some(latency_ms),
                },
            )),
            Err(SupplierError::Timeout(timeout_ms)) => Err(Attempt {
                provider_id: provider_id.clone(),
                outcome: AttemptOutcome::Timeout { timeout_ms },
                latency_ms: Some(latency_ms),
            }),
            Err(error) => {
                let latency_ms = match &error {
                    SupplierError::NotDispatched(_) => None,
                    _ => Some(latency_ms),
                };
                Err(Attempt {
                    provider_id: provider_id.clone(),
                    outcome: AttemptOutcome::Failed { error },
                    latency_ms,
                })
            }
        }
    }
}

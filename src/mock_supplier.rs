//! Scriptable in-process supplier for tests, benches and local runs.

use std::sync::{
    atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::{
    error::SupplierError,
    model::{Provider, ProviderId},
    router::{RouteRequest, SupplierClient},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Normal,
    Degraded,
    Overloaded,
    PartialOutage,
    CompleteOutage,
}

impl ServerMode {
    fn to_u8(self) -> u8 {
        match self {
            ServerMode::Normal => 0,
            ServerMode::Degraded => 1,
            ServerMode::Overloaded => 2,
            ServerMode::PartialOutage => 3,
            ServerMode::CompleteOutage => 4,
        }
    }

    // chance that a single call fails in this mode
    fn failure_chance(mode: u8) -> f32 {
        match mode {
            4 => 1.0,
            3 => 0.5,
            2 => 0.2,
            1 => 0.1,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    mode: AtomicU8,
    delay_ms: AtomicU64,
    fail_next_requests: AtomicUsize,
    reject_next_requests: AtomicUsize,
    calls: AtomicUsize,
}

// Take one from a countdown, if any is left
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
pub struct MockSupplier {
    scripts: DashMap<ProviderId, Arc<Script>>,
    total_calls: AtomicUsize,
}

impl MockSupplier {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, provider_id: &ProviderId) -> Arc<Script> {
        self.scripts
            .entry(provider_id.clone())
            .or_insert_with(|| Arc::new(Script::default()))
            .clone()
    }

    pub fn set_mode(&self, provider_id: &ProviderId, mode: ServerMode) {
        self.script(provider_id).mode.store(mode.to_u8(), Ordering::SeqCst);
    }

    pub fn set_delay(&self, provider_id: &ProviderId, delay_ms: u64) {
        self.script(provider_id).delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    /// The next `count` calls reach the supplier and fail with a 503.
    pub fn fail_next_requests(&self, provider_id: &ProviderId, count: usize) {
        self.script(provider_id)
            .fail_next_requests
            .store(count, Ordering::SeqCst);
    }

    /// The next `count` calls are rejected before leaving the client.
    pub fn reject_locally_next(&self, provider_id: &ProviderId, count: usize) {
        self.script(provider_id)
            .reject_next_requests
            .store(count, Ordering::SeqCst);
    }

    /// Calls that reached the supplier.
    pub fn calls(&self, provider_id: &ProviderId) -> usize {
        self.scripts
            .get(provider_id)
            .map_or(0, |script| script.calls.load(Ordering::SeqCst))
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SupplierClient for MockSupplier {
    async fn call(&self, provider: &Provider, request: &RouteRequest) -> Result<Bytes, SupplierError> {
        let script = self.script(&provider.id);

        if take_one(&script.reject_next_requests) {
            return Err(SupplierError::NotDispatched("connection pool exhausted".to_string()));
        }

        script.calls.fetch_add(1, Ordering::SeqCst);
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        let delay_ms = script.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        if take_one(&script.fail_next_requests) {
            return Err(SupplierError::Response {
                status_code: 503,
                message: "Service temporarily unavailable".to_string(),
            });
        }

        let mode = script.mode.load(Ordering::SeqCst);
        if mode == ServerMode::CompleteOutage.to_u8() {
            return Err(SupplierError::Network("Service unavailable".to_string()));
        }
        if rand::random::<f32>() < ServerMode::failure_chance(mode) {
            return Err(SupplierError::Response {
                status_code: 503,
                message: "Service temporarily unavailable".to_string(),
            });
        }

        Ok(Bytes::from(format!(
            "{}:{}:{}",
            provider.id, request.service_type, request.correlation_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Capability, ServiceType};

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let supplier = MockSupplier::new();
        let provider = Provider::new("acme", Capability::Hotel, 1);
        let request = RouteRequest::new(Capability::Hotel, ServiceType::Search, "").with_correlation_id("r1");

        supplier.reject_locally_next(&provider.id, 1);
        supplier.fail_next_requests(&provider.id, 1);

        let first = supplier.call(&provider, &request).await.unwrap_err();
        assert!(matches!(first, SupplierError::NotDispatched(_)));
        assert_eq!(supplier.calls(&provider.id), 0);

        let second = supplier.call(&provider, &request).await.unwrap_err();
        assert!(matches!(second, SupplierError::Response { status_code: 503, .. }));

        let body = supplier.call(&provider, &request).await.unwrap();
        assert_eq!(body, Bytes::from("acme:search:r1"));
        assert_eq!(supplier.calls(&provider.id), 2);
        assert_eq!(supplier.total_calls(), 2);
    }

    #[tokio::test]
    async fn test_complete_outage_always_fails() {
        let supplier = MockSupplier::new();
        let provider = Provider::new("down", Capability::Flight, 1);
        supplier.set_mode(&provider.id, ServerMode::CompleteOutage);
        let request = RouteRequest::new(Capability::Flight, ServiceType::Booking, "");
        for _ in 0..5 {
            assert!(matches!(
                supplier.call(&provider, &request).await,
                Err(SupplierError::Network(_))
            ));
        }
    }
}

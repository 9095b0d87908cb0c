use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use supplier_orchestrator::{
    mock_supplier::{MockSupplier, ServerMode},
    Capability, CircuitState, Clock, EngineConfig, HealthRecord, InMemoryStore, ManualClock, Orchestrator,
    OrchestratorError, ProviderId, QuotaRecord, RouteRequest, ServiceType, StateStore,
};

struct Harness {
    orchestrator: Arc<Orchestrator>,
    supplier: Arc<MockSupplier>,
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
}

fn harness(raw: &str) -> Harness {
    let mut config = EngineConfig::from_json_str(raw).unwrap();
    config.circuit_breaker.jitter_factor = 0.0;
    let supplier = Arc::new(MockSupplier::new());
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let orchestrator = Orchestrator::builder(config, supplier.clone())
        .clock(clock.clone())
        .store(store.clone())
        .build()
        .unwrap();
    Harness {
        orchestrator: Arc::new(orchestrator),
        supplier,
        store,
        clock,
    }
}

const HOTELS: &str = r#"{
    "providers": [
        { "id": "a", "capability": "hotel", "priority": 1 },
        { "id": "b", "capability": "hotel", "priority": 2 },
        { "id": "c", "capability": "hotel", "priority": 3 }
    ]
}"#;

fn id(raw: &str) -> ProviderId {
    ProviderId::new(raw)
}

fn hotel_search() -> RouteRequest {
    RouteRequest::new(Capability::Hotel, ServiceType::Search, "{}")
}

#[tokio::test]
async fn test_open_breaker_is_routed_around_without_a_call() {
    let h = harness(HOTELS);
    h.supplier.fail_next_requests(&id("a"), 3);

    for _ in 0..3 {
        let outcome = h.orchestrator.route(hotel_search()).await.unwrap();
        assert_eq!(outcome.provider_id, id("b"));
    }
    assert_eq!(h.orchestrator.breakers().snapshot(&id("a")).state, CircuitState::Open);

    let outcome = h.orchestrator.route(hotel_search()).await.unwrap();
    assert_eq!(outcome.provider_id, id("b"));
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(h.supplier.calls(&id("a")), 3);
}

#[tokio::test]
async fn test_exhausted_quota_is_excluded() {
    let raw = r#"{
        "providers": [
            { "id": "a", "capability": "hotel", "priority": 1 },
            { "id": "b", "capability": "hotel", "priority": 2 }
        ],
        "quota_limits": [{ "provider_id": "a", "service_type": "search", "limit": 100 }]
    }"#;
    let h = harness(raw);
    for _ in 0..100 {
        let outcome = h.orchestrator.route(hotel_search()).await.unwrap();
        assert_eq!(outcome.provider_id, id("a"));
    }
    let record = h.orchestrator.quota().get(&id("a"), ServiceType::Search).unwrap();
    assert_eq!((record.quota_used, record.quota_limit), (100, 100));

    let plan = h.orchestrator.plan(&hotel_search());
    assert_eq!(plan.provider_ids(), vec![id("b")]);

    let outcome = h.orchestrator.route(hotel_search()).await.unwrap();
    assert_eq!(outcome.provider_id, id("b"));
    assert_eq!(h.supplier.calls(&id("a")), 100);

    // booking has its own counter
    let booking = RouteRequest::new(Capability::Hotel, ServiceType::Booking, "{}");
    assert_eq!(h.orchestrator.route(booking).await.unwrap().provider_id, id("a"));
}

#[tokio::test]
async fn test_no_usable_flight_provider_fails_without_calls() {
    let raw = r#"{
        "providers": [
            { "id": "f1", "capability": "flight", "priority": 1 },
            { "id": "f2", "capability": "flight", "priority": 2 },
            { "id": "h1", "capability": "hotel", "priority": 1 }
        ],
        "quota_limits": [{ "provider_id": "f2", "service_type": "search", "limit": 0 }]
    }"#;
    let h = harness(raw);
    h.orchestrator
        .force_circuit_state(&id("f1"), CircuitState::Open)
        .await
        .unwrap();

    let request = RouteRequest::new(Capability::Flight, ServiceType::Search, "{}");
    let err = h.orchestrator.route(request).await.unwrap_err();
    match err {
        OrchestratorError::AllProvidersUnavailable {
            capability, attempts, ..
        } => {
            assert_eq!(capability, Capability::Flight);
            assert!(attempts.is_empty());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.supplier.total_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_routing_never_exceeds_quota() {
    let raw = r#"{
        "providers": [{ "id": "a", "capability": "activity", "priority": 1 }],
        "quota_limits": [{ "provider_id": "a", "service_type": "booking", "limit": 100 }]
    }"#;
    let h = harness(raw);

    let mut handles = Vec::new();
    for i in 0..400 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let request = RouteRequest::new(Capability::Activity, ServiceType::Booking, "{}")
                .with_correlation_id(format!("req-{i}"));
            orchestrator.route(request).await.is_ok()
        }));
    }
    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 100);
    assert_eq!(h.supplier.calls(&id("a")), 100);
    let record = h.orchestrator.quota().get(&id("a"), ServiceType::Booking).unwrap();
    assert_eq!(record.quota_used, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_half_open_admits_exactly_one_probe() {
    let h = harness(r#"{ "providers": [{ "id": "a", "capability": "hotel", "priority": 1 }] }"#);
    h.orchestrator
        .force_circuit_state(&id("a"), CircuitState::Open)
        .await
        .unwrap();
    h.clock.advance(ChronoDuration::seconds(60));
    h.supplier.set_delay(&id("a"), 300);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move { orchestrator.route(hotel_search()).await }));
    }
    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(h.supplier.calls(&id("a")), 1);
    assert_eq!(h.orchestrator.breakers().snapshot(&id("a")).state, CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_half_open_call_keeps_its_slot() {
    let raw = r#"{ "providers": [{ "id": "a", "capability": "hotel", "priority": 1, "timeout_ms": 60000 }] }"#;
    let h = harness(raw);
    h.orchestrator
        .force_circuit_state(&id("a"), CircuitState::Open)
        .await
        .unwrap();
    h.clock.advance(ChronoDuration::seconds(60));
    h.supplier.set_delay(&id("a"), 300);

    let orchestrator = h.orchestrator.clone();
    let first = tokio::spawn(async move { orchestrator.route(hotel_search()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // well inside the first call's 60s timeout
    h.clock.advance(ChronoDuration::seconds(31));
    let second = h.orchestrator.route(hotel_search()).await;
    assert!(matches!(second, Err(OrchestratorError::AllProvidersUnavailable { .. })));

    assert!(first.await.unwrap().is_ok());
    assert_eq!(h.supplier.calls(&id("a")), 1);
    assert_eq!(h.orchestrator.breakers().snapshot(&id("a")).state, CircuitState::Closed);
}

#[tokio::test]
async fn test_failed_probe_reopens_with_longer_backoff() {
    let h = harness(r#"{ "providers": [{ "id": "a", "capability": "hotel", "priority": 1 }] }"#);
    let a = id("a");
    h.supplier.fail_next_requests(&a, 4);
    for _ in 0..3 {
        assert!(h.orchestrator.route(hotel_search()).await.is_err());
    }
    let first = h.orchestrator.breakers().snapshot(&a);
    let first_backoff = first.next_attempt.unwrap() - first.opened_at.unwrap();
    assert_eq!(first_backoff, ChronoDuration::seconds(30));

    h.clock.advance(ChronoDuration::seconds(31));
    assert!(h.orchestrator.route(hotel_search()).await.is_err());
    let second = h.orchestrator.breakers().snapshot(&a);
    assert_eq!(second.state, CircuitState::Open);
    assert_eq!(second.reopen_count, 1);
    assert_eq!(second.next_attempt.unwrap() - second.opened_at.unwrap(), ChronoDuration::seconds(60));
}

#[tokio::test]
async fn test_timeouts_count_toward_opening() {
    let raw = r#"{
        "providers": [
            { "id": "slow", "capability": "flight", "priority": 1, "timeout_ms": 25 },
            { "id": "backup", "capability": "flight", "priority": 2 }
        ]
    }"#;
    let h = harness(raw);
    h.supplier.set_delay(&id("slow"), 1_000);

    let request = RouteRequest::new(Capability::Flight, ServiceType::Search, "{}");
    for _ in 0..3 {
        let outcome = h.orchestrator.route(request.clone()).await.unwrap();
        assert_eq!(outcome.provider_id, id("backup"));
    }
    assert_eq!(h.orchestrator.breakers().snapshot(&id("slow")).state, CircuitState::Open);
    assert_eq!(h.orchestrator.health().get_status(&id("slow")).consecutive_failures, 3);
}

#[tokio::test]
async fn test_unhealthy_provider_used_only_as_last_resort() {
    let h = harness(HOTELS);
    for _ in 0..3 {
        h.orchestrator.health().record_outcome(&id("a"), false, 100);
    }
    h.supplier.set_mode(&id("b"), ServerMode::CompleteOutage);

    let outcome = h.orchestrator.route(hotel_search()).await.unwrap();
    assert_eq!(outcome.provider_id, id("c"));
    assert_eq!(h.supplier.calls(&id("a")), 0);
}

#[tokio::test]
async fn test_provider_removed_mid_call_leaves_no_state() {
    let h = harness(HOTELS);
    h.supplier.set_delay(&id("a"), 200);

    let orchestrator = h.orchestrator.clone();
    let in_flight = tokio::spawn(async move { orchestrator.route(hotel_search()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.orchestrator.remove_provider(&id("a")).await.unwrap();

    let outcome = in_flight.await.unwrap().unwrap();
    assert_eq!(outcome.provider_id, id("a"));
    assert!(!h.orchestrator.health().has_record(&id("a")));
    assert!(h.orchestrator.quota().records_for(&id("a")).is_empty());
    let health_rows = h.store.list_health().await.unwrap();
    assert!(health_rows.iter().all(|row| row.record.provider_id != id("a")));
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let h = harness(HOTELS);
    let now = h.clock.now();
    h.store.import_health(HealthRecord::healthy(id("a"), now));
    h.store.import_health(HealthRecord::healthy(id("A "), now - ChronoDuration::minutes(1)));
    h.store.import_health(HealthRecord::healthy(id("retired"), now));
    h.store
        .import_quota(QuotaRecord::new(id("retired"), ServiceType::Search, 10, 60, now));
    h.orchestrator.health().record_outcome(&id("ghost"), true, 10);
    h.orchestrator
        .force_circuit_state(&id("b"), CircuitState::Open)
        .await
        .unwrap();
    h.clock.advance(ChronoDuration::hours(2));

    let first = h.orchestrator.reconcile().await;
    assert!(first.changes() > 0);
    assert_eq!(first.stuck_circuits_reset, 1);
    let rows_after_first = h.store.row_counts();
    let snapshot_after_first = h.orchestrator.system_health_snapshot();

    let second = h.orchestrator.reconcile().await;
    assert!(second.is_clean(), "second sweep changed state: {second:?}");
    assert_eq!(h.store.row_counts(), rows_after_first);
    assert_eq!(h.orchestrator.system_health_snapshot(), snapshot_after_first);
}

#[tokio::test]
async fn test_state_survives_restart_through_store() {
    let h = harness(HOTELS);
    h.supplier.fail_next_requests(&id("a"), 3);
    for _ in 0..3 {
        h.orchestrator.route(hotel_search()).await.unwrap();
    }

    let restarted = Orchestrator::builder(
        EngineConfig::from_json_str(HOTELS).unwrap(),
        Arc::new(MockSupplier::new()),
    )
    .clock(h.clock.clone())
    .store(h.store.clone())
    .build()
    .unwrap();
    restarted.hydrate().await.unwrap();

    assert_eq!(restarted.breakers().snapshot(&id("a")).state, CircuitState::Open);
    assert_eq!(restarted.health().get_status(&id("a")).consecutive_failures, 3);
    assert_eq!(
        restarted.quota().get(&id("b"), ServiceType::Search).unwrap().quota_used,
        3
    );
    assert_eq!(restarted.plan(&hotel_search()).provider_ids(), vec![id("b"), id("c")]);
}

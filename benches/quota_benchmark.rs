use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{seq::SliceRandom, thread_rng};
use std::sync::Arc;
use std::thread;
use supplier_orchestrator::{
    config::QuotaConfig, Capability, EngineConfig, ManualClock, Orchestrator, ProviderId, QuotaTracker,
    RouteRequest, ServiceType, SystemClock,
};
use supplier_orchestrator::mock_supplier::MockSupplier;

// Contended reservations against a handful of hot (provider, service type) keys
pub fn reserve_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("quota_reserve");

    for threads in [1usize, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            b.iter(|| {
                let config = QuotaConfig {
                    default_limit: u64::MAX,
                    ..QuotaConfig::default()
                };
                let tracker = Arc::new(QuotaTracker::new(config, Arc::new(SystemClock)));
                let providers: Vec<ProviderId> = (0..4).map(|i| ProviderId::new(format!("p{}", i))).collect();

                let mut handles = vec![];
                for _ in 0..threads {
                    let tracker = Arc::clone(&tracker);
                    let providers = providers.clone();
                    handles.push(thread::spawn(move || {
                        let mut rng = thread_rng();
                        for _ in 0..250 {
                            let Some(provider_id) = providers.choose(&mut rng) else { continue };
                            if let Ok(permit) = tracker.reserve(provider_id, ServiceType::Search, 1) {
                                tracker.release(black_box(permit));
                            }
                        }
                    }));
                }
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

// End-to-end routing through the mock supplier
pub fn route_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let config = EngineConfig::from_json_str(
        r#"{ "providers": [
            { "id": "a", "capability": "hotel", "priority": 1 },
            { "id": "b", "capability": "hotel", "priority": 2 }
        ], "quota": { "default_limit": 1000000000 } }"#,
    )
    .unwrap();
    let orchestrator = Orchestrator::builder(config, Arc::new(MockSupplier::new()))
        .clock(Arc::new(ManualClock::default()))
        .build()
        .unwrap();

    c.bench_function("route_hotel_search", |b| {
        b.to_async(&runtime).iter(|| async {
            let request = RouteRequest::new(Capability::Hotel, ServiceType::Search, "bench");
            black_box(orchestrator.route(request).await.unwrap());
        });
    });
}

criterion_group!(benches, reserve_benchmark, route_benchmark);
criterion_main!(benches);

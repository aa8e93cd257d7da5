use criterion::{criterion_group, criterion_main, Criterion};
use questlink::connectivity::EndpointRef;
use questlink::health::{MetricsAggregator, OutcomeKind};
use questlink::store::{MemoryStore, ResponseCache};
use questlink::transport::executor::resolve_url;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn bench_record_sample(c: &mut Criterion) {
    let aggregator = MetricsAggregator::default();
    let endpoints: Vec<String> = (0..5).map(|i| format!("http://node-{i}.test")).collect();
    let mut tick = 0usize;

    c.bench_function("aggregator_record_sample", |b| {
        b.iter(|| {
            tick = tick.wrapping_add(1);
            let outcome = if tick % 7 == 0 {
                OutcomeKind::ServerError
            } else {
                OutcomeKind::Success
            };
            aggregator.record_sample(
                &endpoints[tick % endpoints.len()],
                outcome,
                Duration::from_millis(40),
            )
        });
    });
}

fn bench_cache_round_trip(c: &mut Criterion) {
    let cache = ResponseCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(300), true);
    let payload = json!({
        "quests": [
            { "id": 1, "title": "Refactor the parser", "xp": 120 },
            { "id": 2, "title": "Write release notes", "xp": 40 }
        ]
    });
    let key = ResponseCache::key("/api/quests", Some(&json!({ "status": "active" })));

    c.bench_function("cache_put_get", |b| {
        b.iter(|| {
            cache.put(&key, &payload).expect("cache put");
            let hit = cache.get(&key, false).expect("cache get");
            assert!(hit.is_some());
        });
    });
}

fn bench_resolve_url(c: &mut Criterion) {
    let endpoint = EndpointRef {
        position: 0,
        url: "http://localhost:5002".to_string(),
    };
    let query = json!({ "status": "active", "page": 3, "tags": "daily" });

    c.bench_function("resolve_url_with_query", |b| {
        b.iter(|| resolve_url(&endpoint, "/api/quests", Some(&query)));
    });
}

criterion_group!(benches, bench_record_sample, bench_cache_round_trip, bench_resolve_url);
criterion_main!(benches);

//! Performance benchmarks for a3s-flow
//!
//! Run with: cargo bench

use a3s_flow::retrieval::{fuse, SearchHit, SearchKind};
use a3s_flow::{handler_fn, CommandGate, DeliveryMode, EventBus, EventType};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn bench_sync_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("sync publish");

    for handlers in [1usize, 4, 16] {
        let bus = Arc::new(EventBus::new());
        for i in 0..handlers {
            bus.subscribe(
                EventType::ResponseChunk,
                handler_fn(format!("h{}", i), |_event| async { Ok(()) }),
            )
            .unwrap();
        }

        group.bench_with_input(BenchmarkId::from_parameter(handlers), &handlers, |b, _| {
            b.to_async(&rt).iter(|| {
                let bus = Arc::clone(&bus);
                async move {
                    bus.publish(
                        EventType::ResponseChunk,
                        serde_json::json!({"chunk": {"content": "token"}, "session_id": "s1"}),
                        DeliveryMode::Sync,
                    )
                    .await
                    .unwrap()
                }
            });
        });
    }
    group.finish();
}

fn bench_fuse(c: &mut Criterion) {
    let hit = |i: usize| SearchHit {
        source: format!("source-{}", i % 7),
        text: format!("document body number {}", i % 40),
        score: (i % 100) as f32 / 100.0,
        timestamp: None,
    };
    let dense: Vec<SearchHit> = (0..50).map(hit).collect();
    let sparse: Vec<SearchHit> = (25..75).map(hit).collect();

    c.bench_function("fuse 2x50", |b| {
        b.iter(|| {
            fuse(
                vec![(SearchKind::Dense, dense.clone()), (SearchKind::Sparse, sparse.clone())],
                5,
                None,
            )
        });
    });
}

fn bench_gate(c: &mut Criterion) {
    let gate = CommandGate::new(&[]).unwrap();
    let input = "please explain # why\n  the   borrow checker <rejects> this & that";

    c.bench_function("CommandGate sanitize", |b| {
        b.iter(|| gate.sanitize(input));
    });

    c.bench_function("CommandGate filter_response", |b| {
        b.iter(|| gate.filter_response("to clean up run rm -rf build then chmod 777 out"));
    });
}

criterion_group!(benches, bench_sync_publish, bench_fuse, bench_gate);
criterion_main!(benches);

//! Dispatch benchmarks for herald-client.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use herald_client::{ChannelRegistry, Dispatcher};
use herald_protocol::Frame;
use serde_json::json;
use std::sync::Arc;

/// Dispatch to one channel among many, with a varying handler count.
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    for handlers in [1usize, 8, 64] {
        let registry = Arc::new(ChannelRegistry::new());
        for i in 0..1_000 {
            registry.subscribe(&format!("channel-{i}")).unwrap();
        }
        let (channel, _) = registry.subscribe("orders").unwrap();
        for _ in 0..handlers {
            channel.bind("order_created", |data| {
                black_box(data);
            });
        }
        let dispatcher = Dispatcher::new(registry);
        let frame = Frame::client_event("orders", "order_created", json!({ "id": 42 }));

        group.bench_with_input(BenchmarkId::new("handlers", handlers), &frame, |b, frame| {
            b.iter(|| dispatcher.dispatch(black_box(frame.clone())))
        });
    }

    group.finish();
}

/// Frames for channels the client does not hold.
fn bench_dispatch_unknown(c: &mut Criterion) {
    let dispatcher = Dispatcher::new(Arc::new(ChannelRegistry::new()));
    let frame = Frame::client_event("nobody", "e", json!(null));

    c.bench_function("dispatch_unknown_channel", |b| {
        b.iter(|| dispatcher.dispatch(black_box(frame.clone())))
    });
}

criterion_group!(benches, bench_dispatch, bench_dispatch_unknown);
criterion_main!(benches);

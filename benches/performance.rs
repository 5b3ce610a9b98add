//! Performance benchmarks for the subscription session.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pubsub_sync::mock::MockServer;
use pubsub_sync::{
    ChannelKey, DeliveryTarget, PubSubSession, PublishedFrame, SessionConfig,
};
use std::sync::Arc;

fn create_session() -> Arc<PubSubSession> {
    PubSubSession::new(SessionConfig {
        queue_capacity: None,
        reconcile_interval_ms: None,
        ..Default::default()
    })
    .unwrap()
}

/// Benchmark dispatch to a callback with varying numbers of subscriptions
fn bench_dispatch_callback(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_callback");
    group.throughput(Throughput::Elements(1));

    for subscriptions in [1, 100, 10_000] {
        group.bench_with_input(
            BenchmarkId::new("subscriptions", subscriptions),
            &subscriptions,
            |b, &count| {
                let session = create_session();
                for i in 0..count {
                    session
                        .subscribe(
                            ChannelKey::exact(format!("ch{}", i)),
                            DeliveryTarget::callback(|msg| {
                                black_box(msg.payload.len());
                            }),
                        )
                        .unwrap();
                }

                b.iter(|| {
                    session.dispatch(PublishedFrame::exact("ch0", b"payload".to_vec()))
                });
            },
        );
    }

    group.finish();
}

/// Benchmark dispatch into a queue, draining as we go
fn bench_dispatch_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_queue");

    for size in [64usize, 4096, 1024 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("payload", size), &size, |b, &size| {
            let session = create_session();
            let rx = session.subscribe_queue(ChannelKey::pattern("bench.*")).unwrap();
            let payload = vec![7u8; size];

            b.iter(|| {
                session.dispatch(PublishedFrame::pattern(
                    "bench.*",
                    "bench.load",
                    payload.clone(),
                ));
                black_box(rx.try_next())
            });
        });
    }

    group.finish();
}

/// Benchmark reconciliation of a large desired set onto a fresh connection
fn bench_reconnect(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconnect");
    group.sample_size(20);

    for keys in [100, 1000] {
        group.bench_with_input(BenchmarkId::new("keys", keys), &keys, |b, &keys| {
            let server = MockServer::standalone();
            let session = create_session();
            for i in 0..keys {
                session
                    .subscribe(ChannelKey::exact(format!("k{}", i)), DeliveryTarget::callback(|_| {}))
                    .unwrap();
            }

            b.iter(|| {
                let (connection, frames) = server.open_connection();
                let id = pubsub_sync::Connection::id(&*connection);
                session.connection_available(connection);
                for frame in frames.try_iter() {
                    session.handle_frame(id, frame);
                }
                session.connection_lost();
                server.kill_connection(id);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_dispatch_callback,
    bench_dispatch_queue,
    bench_reconnect
);
criterion_main!(benches);

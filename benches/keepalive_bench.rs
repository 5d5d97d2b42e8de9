use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use rusd_client::naming::UpdateWithOpts;
use rusd_client::rpc::{Compare, CompareResult, PutRequest, RequestOp, TxnRequest};
use rusd_client::{Client, ClientConfig, EmbeddedCluster, Endpoint, EndpointManager};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn connect(rt: &Runtime) -> Client {
    rt.block_on(async {
        Client::from_backend(EmbeddedCluster::start(), ClientConfig::default())
            .expect("valid client config")
    })
}

// ============================================================================
// Benchmark: keepalive registration and first renewal
// ============================================================================

fn bench_keep_alive(c: &mut Criterion) {
    let mut group = c.benchmark_group("keep_alive");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));

    let rt = runtime();
    let client = connect(&rt);

    for leases in [1usize, 16, 128].iter() {
        group.throughput(Throughput::Elements(*leases as u64));
        group.bench_with_input(
            BenchmarkId::new("track_until_first_response", leases),
            leases,
            |b, &leases| {
                b.to_async(&rt).iter(|| async {
                    let scope = CancellationToken::new();
                    let mut channels = Vec::with_capacity(leases);
                    for _ in 0..leases {
                        let lease = client.lease().grant(60).await.expect("grant");
                        channels.push(
                            client
                                .lease()
                                .keep_alive(lease.id, scope.child_token())
                                .await
                                .expect("keep alive"),
                        );
                    }
                    for ch in channels.iter_mut() {
                        black_box(ch.recv().await);
                    }
                    scope.cancel();
                })
            },
        );
    }

    group.bench_function("keep_alive_once", |b| {
        let lease = rt
            .block_on(client.lease().grant(60))
            .expect("grant");
        b.to_async(&rt)
            .iter(|| async { black_box(client.lease().keep_alive_once(lease.id).await) })
    });

    group.finish();
}

// ============================================================================
// Benchmark: guarded creates, the write path of the barrier
// ============================================================================

fn bench_txn(c: &mut Criterion) {
    let mut group = c.benchmark_group("txn_operations");
    group.sample_size(50);

    let rt = runtime();
    let client = connect(&rt);

    group.bench_function("create_if_absent", |b| {
        let mut counter = 0u64;
        b.to_async(&rt).iter(|| {
            counter += 1;
            let key = format!("bench/waiters/{}", counter);
            let client = client.clone();
            async move {
                let txn = TxnRequest::new()
                    .when(vec![Compare::create_revision(
                        key.clone(),
                        CompareResult::Equal,
                        0,
                    )])
                    .and_then(vec![RequestOp::Put(PutRequest::new(key, Vec::new()))]);
                black_box(client.txn(txn).await)
            }
        })
    });

    group.finish();
}

// ============================================================================
// Benchmark: endpoint batch updates
// ============================================================================

fn bench_endpoint_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("endpoint_update");
    group.sample_size(50);

    let rt = runtime();
    let client = connect(&rt);
    let manager = EndpointManager::new(&client, "bench-svc").expect("target");

    for batch in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::new("add_batch", batch), batch, |b, &batch| {
            b.to_async(&rt).iter(|| async {
                let updates = (0..batch)
                    .map(|i| {
                        UpdateWithOpts::add(
                            format!("bench-svc/{}", i),
                            Endpoint::new(format!("10.0.0.{}:80", i % 250)),
                        )
                    })
                    .collect();
                black_box(manager.update(updates).await)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_keep_alive, bench_txn, bench_endpoint_update);
criterion_main!(benches);

use std::sync::Arc;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use tokio::runtime::Runtime;

use coord::{
    test_utils::fast_config, Election, ElectionQueue, EventKind, KeyValue, MemoryStore, Session,
    Snapshot, WatchEvent,
};

fn candidates(n: i64) -> Snapshot {
    let kvs = (1..=n)
        .map(|rev| KeyValue {
            key: format!("bench/{rev:08x}"),
            value: Bytes::from_static(b"node"),
            create_revision: rev,
            mod_revision: rev,
            lease: None,
        })
        .collect();
    Snapshot { revision: n, kvs }
}

fn queue_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue churn");
    for size in [16i64, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut rng = rand::rng();
            b.iter(|| {
                let mut queue = ElectionQueue::from_snapshot("bench/", &candidates(size));
                let mut revision = size;
                for _ in 0..size {
                    revision += 1;
                    let victim = rng.random_range(1..=size);
                    queue.apply(&WatchEvent {
                        kind: EventKind::Delete,
                        kv: KeyValue {
                            key: format!("bench/{victim:08x}"),
                            value: Bytes::new(),
                            create_revision: 0,
                            mod_revision: revision,
                            lease: None,
                        },
                        revision,
                    });
                }
                queue.leader().map(|c| c.create_revision)
            })
        });
    }
    group.finish();
}

fn uncontested_campaign(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let store = rt.block_on(async { Arc::new(MemoryStore::new()) });
    c.bench_function("uncontested campaign + resign", |b| {
        b.iter(|| {
            rt.block_on(async {
                let session = Session::open(store.clone(), fast_config()).await.unwrap();
                let election = Election::new(&session, "bench");
                election.campaign("leader").await.unwrap();
                election.resign().await.unwrap();
                session.close().await.unwrap();
            })
        })
    });
}

criterion_group!(benches, queue_churn, uncontested_campaign);
criterion_main!(benches);

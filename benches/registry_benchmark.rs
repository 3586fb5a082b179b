use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use tokio_topicq::{BrokerEngine, MessageUnit, QueueKind};

async fn access_release(engine: &BrokerEngine, topic: &str, count: usize) {
    let registry = engine.registry();
    for _ in 0..count {
        let handle = registry.find_or_create(topic).await;
        handle.num_entries();
        registry.release(&handle).await;
    }
}

async fn publish_destroy(engine: &BrokerEngine, topic: &str, count: usize) {
    for i in 0..count {
        let unit = MessageUnit::new(topic, i.to_le_bytes().to_vec());
        let entry = engine.publish(unit, 1, 0).await.unwrap();
        entry
            .increment_reference_counter(-1, QueueKind::Callback)
            .await;
    }
}

fn bench_registry(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = BrokerEngine::new();
    let count = 1000;

    let mut group = c.benchmark_group("Registry");

    group.bench_function(BenchmarkId::new("AccessRelease", count), |b| {
        b.to_async(&rt).iter(|| async {
            let topic = format!("bench_access_{}", std::process::id());
            access_release(&engine, &topic, count).await;
        })
    });

    group.bench_function(BenchmarkId::new("PublishDestroy", count), |b| {
        b.to_async(&rt).iter(|| async {
            let topic = format!("bench_publish_{}", std::process::id());
            publish_destroy(&engine, &topic, count).await;
        })
    });

    group.finish();
}

fn bench_lock_contention(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = BrokerEngine::new();

    c.bench_function("Registry/ContendedLock", |b| {
        b.to_async(&rt).iter(|| async {
            let registry = engine.registry().clone();
            let mut tasks = Vec::with_capacity(8);
            for _ in 0..8 {
                let registry = registry.clone();
                tasks.push(tokio::spawn(async move {
                    for _ in 0..50 {
                        let handle = registry.find_or_create("contended").await;
                        registry.release(&handle).await;
                    }
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_registry, bench_lock_contention);
criterion_main!(benches);

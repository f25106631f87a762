use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tokio::runtime::Runtime;

use relaymq::config::BrokerSettings;
use relaymq::core::message::Message;
use relaymq::core::persistence::MemoryPersistence;
use relaymq::core::queue::{Queue, QueueOptions, QueueStatus};
use relaymq::core::routing::SendRequest;
use relaymq::StorageRegistry;

const BATCH: u64 = 10_000;
const FANOUT_QUEUES: usize = 16;

fn started_queue() -> Queue {
    let queue = Queue::new("bench", "q", QueueOptions::default());
    queue.set_status(QueueStatus::Started);
    queue
}

fn bench_enqueue_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(BATCH));
    group.bench_function("enqueue_then_pop", |b| {
        b.iter_batched(
            started_queue,
            |queue| {
                for i in 0..BATCH {
                    queue
                        .enqueue(Message::new("q", format!("payload-{i}")))
                        .expect("started queue accepts");
                }
                while queue.try_pop().is_some() {}
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_exchange_fanout(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let (registry, client) = rt.block_on(async {
        let registry = StorageRegistry::new(
            BrokerSettings::default(),
            Arc::new(MemoryPersistence::new()),
        );
        let user = registry.add_user("bench", "pw", false).await.expect("user");
        let exchange = QueueOptions {
            exchange: true,
            ..Default::default()
        };
        registry.add_queue(&user, "fan", exchange).await.expect("exchange");
        for i in 0..FANOUT_QUEUES {
            let name = format!("target-{i}");
            registry
                .add_queue(&user, &name, QueueOptions::default())
                .await
                .expect("queue");
            registry
                .add_binding(&user, "fan", &name, false, None)
                .await
                .expect("binding");
        }
        let (client, _events) = registry.connect_client(Some(user));
        (registry, client)
    });

    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(FANOUT_QUEUES as u64));
    group.bench_function("exchange_fanout_16", |b| {
        b.to_async(&rt).iter(|| async {
            let request = SendRequest::new("fan", "hello", Duration::from_secs(1));
            registry
                .routing()
                .send(&client, request)
                .await
                .expect("send");
        })
    });
    group.finish();

    rt.block_on(async {
        for user in registry.users() {
            for queue in user.queues() {
                queue.clear();
            }
        }
    });
}

criterion_group!(benches, bench_enqueue_pop, bench_exchange_fanout);
criterion_main!(benches);

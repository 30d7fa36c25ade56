//! Communication Substrate Benchmarks
//!
//! - Reference store put/get for inline values and promoted references
//! - Bus publish with one and many subscribers

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tokio::runtime::Runtime;

use weft::core::{AgentId, BusConfig, CommunicationConfig, Topic, TopicPattern};
use weft::memory::ReferenceStore;
use weft::mesh::{MessageBus, OutgoingMessage};

fn bench_reference_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("reference_store");
    let store = ReferenceStore::new(CommunicationConfig::default());

    for size in [256usize, 64 * 1024] {
        let payload = vec![b'x'; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("put_release", size), &payload, |b, payload| {
            b.iter(|| {
                let stored = store.put("agent_output", black_box(payload.clone())).unwrap();
                if let Some(id) = stored.reference_id() {
                    store.release(id).unwrap();
                }
            })
        });

        let stored = store.put("agent_output", payload.clone()).unwrap();
        group.bench_with_input(BenchmarkId::new("get", size), &stored, |b, stored| {
            b.iter(|| black_box(store.get(black_box(stored)).unwrap()))
        });
    }
    group.finish();
}

fn bench_bus_publish(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("bus_publish");

    for subscribers in [1usize, 16] {
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_function(BenchmarkId::new("fanout", subscribers), |b| {
            b.iter_batched(
                || {
                    let store = Arc::new(ReferenceStore::new(CommunicationConfig::default()));
                    let bus = MessageBus::new(BusConfig::default(), store).unwrap();
                    let inboxes: Vec<_> = (0..subscribers)
                        .map(|i| {
                            bus.subscribe(
                                TopicPattern::parse("bench.*").unwrap(),
                                AgentId::new_unchecked(format!("agent{i}")),
                            )
                            .unwrap()
                        })
                        .collect();
                    (bus, inboxes)
                },
                |(bus, inboxes)| {
                    rt.block_on(async {
                        let topic = Topic::new_unchecked("bench.updates");
                        black_box(bus.publish(&topic, OutgoingMessage::text("progress")).await.unwrap());
                    });
                    drop(inboxes);
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reference_store, bench_bus_publish);
criterion_main!(benches);

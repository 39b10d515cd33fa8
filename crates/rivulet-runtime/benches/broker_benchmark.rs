//! Benchmarks for the topic broker.
//!
//! 1. Fan-out: one publish delivered to a growing number of subscribers
//! 2. Pattern matching: compiled wildcard patterns against concrete topics
//! 3. Lookup reads: composite-key reads on a populated table
//!
//! Run with: cargo bench -p rivulet-runtime --bench broker_benchmark

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rivulet_core::{Record, Value};
use rivulet_runtime::lookup::Table;
use rivulet_runtime::pubsub::{Broker, SubscriberId};
use rivulet_runtime::TopicPattern;
use std::time::{Duration, Instant};

const BATCH: usize = 1_000;

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("broker_fan_out");
    group.measurement_time(Duration::from_secs(5));

    for subscribers in [1usize, 4, 16, 64] {
        group.throughput(Throughput::Elements((BATCH * subscribers) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, &subscribers| {
                let broker = Broker::default();
                let mut subs: Vec<_> = (0..subscribers)
                    .map(|i| {
                        broker
                            .subscribe(SubscriberId::system(format!("bench-{}", i)), "t", BATCH)
                            .unwrap()
                    })
                    .collect();
                broker.register_publisher("t");
                let record = Record::new().with_field("v", 1i64).into_shared();

                b.iter_custom(|iters| {
                    let mut elapsed = Duration::ZERO;
                    for _ in 0..iters {
                        let start = Instant::now();
                        for _ in 0..BATCH {
                            broker.publish("t", record.clone());
                        }
                        elapsed += start.elapsed();
                        // drain outside the measurement so queues never fill
                        for sub in subs.iter_mut() {
                            while sub.try_recv().is_some() {}
                        }
                    }
                    elapsed
                });
            },
        );
    }
    group.finish();
}

fn bench_pattern_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern_match");
    let topics = [
        "factory/line1/press/temperature",
        "factory/line2/press/pressure",
        "factory/line1/robot/temperature",
        "office/floor3/hvac/temperature",
    ];

    for pattern in ["factory/line1/press/temperature", "factory/+/press/+", "factory/#"] {
        let compiled = TopicPattern::compile(pattern).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(pattern), &compiled, |b, p| {
            b.iter(|| {
                topics
                    .iter()
                    .filter(|t| p.matches(black_box(t)))
                    .count()
            })
        });
    }
    group.finish();
}

fn bench_lookup_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_read");
    let table = Table::new("devices", vec!["id".to_string(), "zone".to_string()]);
    for i in 0..10_000i64 {
        table.insert(
            Record::new()
                .with_field("id", i % 1_000)
                .with_field("zone", format!("z{}", i % 10))
                .into_shared(),
        );
    }

    group.bench_function("composite_key_hit", |b| {
        let values = [Value::Int(42), Value::from("z2")];
        b.iter(|| table.read(black_box(&["id", "zone"]), black_box(&values)).len())
    });
    group.bench_function("reordered_keys", |b| {
        let values = [Value::from("z2"), Value::Int(42)];
        b.iter(|| table.read(black_box(&["zone", "id"]), black_box(&values)).len())
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_fan_out,
    bench_pattern_match,
    bench_lookup_read
);
criterion_main!(benches);

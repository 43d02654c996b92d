//! Apply path benchmarks.
//!
//! Run with: `cargo bench --bench apply_path`
//!
//! Measures the per-record cost of folding a record into the view
//! (decode + map update + listener fan-out) and of point reads.

use bytes::Bytes;
use compacted_view::source::Record;
use compacted_view::view::{ListenerHub, StateStore};
use compacted_view::{JsonDecoder, PartitionId, StringDecoder};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn record(key: String, payload: Bytes) -> Record {
    Record {
        partition: PartitionId::from("bench"),
        key,
        payload,
        offset: 0,
    }
}

/// Publish through the hub with a varying number of listeners
fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    group.throughput(Throughput::Elements(1));

    for listeners in [0usize, 1, 8] {
        let store: StateStore<String> = StateStore::new();
        let hub = ListenerHub::new();
        for _ in 0..listeners {
            hub.snapshot_and_subscribe(&store, |_k: &str, v: Option<&String>| {
                black_box(v);
                Ok(())
            })
            .expect("subscribe on open hub");
        }
        let records: Vec<Record> = (0..1024)
            .map(|i| record(format!("key:{}", i), Bytes::from(format!("value:{}", i))))
            .collect();

        group.bench_function(format!("listeners_{}", listeners), |b| {
            let mut i = 0usize;
            b.iter(|| {
                let rec = &records[i % records.len()];
                i += 1;
                hub.publish(&store, black_box(rec), &StringDecoder)
            })
        });
    }

    group.finish();
}

/// JSON decode + apply without listeners
fn bench_apply_json(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_json");
    group.throughput(Throughput::Elements(1));

    let store: StateStore<i64> = StateStore::new();
    let decoder = JsonDecoder::<i64>::new();
    let rec = record("counter".to_string(), Bytes::from_static(b"123456"));
    group.bench_function("upsert", |b| b.iter(|| store.apply_record(black_box(&rec), &decoder)));

    let tombstone = record("counter".to_string(), Bytes::new());
    group.bench_function("tombstone", |b| {
        b.iter(|| store.apply_record(black_box(&tombstone), &decoder))
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let store: StateStore<String> = StateStore::new();
    for i in 0..1000 {
        store.apply_record(
            &record(format!("key:{}", i), Bytes::from(format!("value:{}", i))),
            &StringDecoder,
        );
    }

    c.bench_function("get_hit", |b| b.iter(|| store.get(black_box("key:500"))));
    c.bench_function("get_miss", |b| b.iter(|| store.get(black_box("missing"))));
}

criterion_group!(benches, bench_publish, bench_apply_json, bench_get);
criterion_main!(benches);

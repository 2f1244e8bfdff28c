//! Presence sync benchmarks for beacon-core.

use beacon_core::Presence;
use beacon_protocol::events::event;
use beacon_protocol::{Envelope, Payload};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use serde_json::{json, Value};

fn members(count: usize) -> Payload {
    (0..count)
        .map(|i| {
            (
                format!("user:{i}"),
                json!({"metas": [{"phx_ref": format!("ref-{i}"), "online_at": 1_700_000_000 + i}]}),
            )
        })
        .collect()
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence_state");

    for count in [10, 100, 1000] {
        let envelope = Envelope::new("room:lobby", event::PRESENCE_STATE, members(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &envelope, |b, envelope| {
            b.iter(|| {
                let mut presence = Presence::new();
                presence.sync(black_box(envelope));
                presence
            });
        });
    }

    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let snapshot = Envelope::new("room:lobby", event::PRESENCE_STATE, members(1000));

    let mut payload = Payload::new();
    payload.insert("joins".to_string(), Value::Object(members(1)));
    payload.insert(
        "leaves".to_string(),
        json!({"user:500": {"metas": [{"phx_ref": "ref-500"}]}}),
    );
    let diff = Envelope::new("room:lobby", event::PRESENCE_DIFF, payload);

    let mut base = Presence::new();
    base.sync(&snapshot);

    c.bench_function("presence_diff_1000", |b| {
        b.iter_batched(
            || base.clone(),
            |mut presence| {
                presence.sync(black_box(&diff));
                presence
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_snapshot, bench_diff);
criterion_main!(benches);

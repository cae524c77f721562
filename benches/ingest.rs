use std::time::Duration;

use chainlog::{
    ChainEvent, EventEnvelope, IndexStore, IngestOptions, Ingester, QueryService,
    event::{LogDeactivated, LogStored},
    model::{Address, Severity},
    query::{LogFilter, Page},
};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

const STREAM_SIZES: &[usize] = &[256, 2048];
const CREATORS: usize = 16;
const CATEGORIES: [&str; 4] = ["auth", "payments", "ops", "audit"];
const BASE_TIMESTAMP: u64 = 1_709_337_600;

fn criterion_benches() -> Criterion {
    Criterion::default().warm_up_time(Duration::from_secs(3))
}

fn creators() -> Vec<Address> {
    (0..CREATORS)
        .map(|index| {
            Address::parse(&format!("0x{:040x}", index + 1)).expect("generated address is valid")
        })
        .collect()
}

/// Stored events with every tenth log deactivated a block later.
fn event_stream(count: usize) -> Vec<EventEnvelope> {
    let creators = creators();
    let mut events = Vec::with_capacity(count + count / 10);
    let mut block = 1;
    for index in 0..count {
        let id = index as u64 + 1;
        let creator = &creators[index % CREATORS];
        events.push(EventEnvelope::new(
            block,
            0,
            ChainEvent::Stored(LogStored {
                id,
                creator: creator.clone(),
                level: Severity::ALL[index % Severity::ALL.len()],
                category: CATEGORIES[index % CATEGORIES.len()].to_string(),
                message: format!("benchmark message {id}"),
                metadata: None,
                timestamp: BASE_TIMESTAMP + id * 37,
            }),
        ));
        block += 1;
        if index % 10 == 9 {
            events.push(EventEnvelope::new(
                block,
                0,
                ChainEvent::Deactivated(LogDeactivated {
                    id,
                    deactivator: creator.clone(),
                    timestamp: BASE_TIMESTAMP + id * 37 + 1,
                }),
            ));
            block += 1;
        }
    }
    events
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest_stream");
    for &size in STREAM_SIZES {
        let events = event_stream(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &events, |b, events| {
            b.iter(|| {
                let store = IndexStore::in_memory();
                let report = Ingester::new(&store, IngestOptions::default())
                    .apply_all(events.clone())
                    .expect("ingest succeeds");
                black_box(report);
            });
        });
    }
    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let events = event_stream(STREAM_SIZES[1]);
    let store = IndexStore::in_memory();
    Ingester::new(&store, IngestOptions::default())
        .apply_all(events.clone())
        .expect("seed ingest succeeds");

    c.bench_function("replay_duplicates", |b| {
        b.iter(|| {
            let report = Ingester::new(&store, IngestOptions::default())
                .apply_all(events.clone())
                .expect("replay succeeds");
            black_box(report);
        });
    });
}

fn bench_filtered_listing(c: &mut Criterion) {
    let store = Arc::new(IndexStore::in_memory());
    Ingester::new(&store, IngestOptions::default())
        .apply_all(event_stream(STREAM_SIZES[1]))
        .expect("seed ingest succeeds");
    let service = QueryService::new(store, 10, 1000);
    let filter = LogFilter {
        category: Some("payments".into()),
        active: Some(true),
        ..LogFilter::default()
    };

    c.bench_function("list_active_payments", |b| {
        b.iter(|| {
            let entries = service
                .logs(&filter, Page::new(Some(100), None))
                .expect("listing succeeds");
            black_box(entries);
        });
    });
}

criterion_group! {
    name = benches;
    config = criterion_benches();
    targets = bench_ingest, bench_replay, bench_filtered_listing
}
criterion_main!(benches);

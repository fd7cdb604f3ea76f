use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use logos_sync::broadcast::Room;
use logos_sync::change::Change;
use logos_sync::coordinator::{DocumentSession, SyncConfig};
use logos_sync::engine::{EngineConfig, SyncEngine};
use logos_sync::log::{Disposition, LogEntry};
use logos_sync::offline::OfflineQueue;
use logos_sync::ot::{transform, transform_across};
use logos_sync::protocol::{ChangeBroadcast, Envelope};
use logos_sync::storage::{ChangeStore, MemoryStore, RocksStore, StoreConfig};
use logos_sync::vcs::BranchId;
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn bench_transform_pair(c: &mut Criterion) {
    let a = Change::insert("alice", 0, "body", 12, "hello");
    let b = Change::replace_range("bob", 0, "body", 2, 6, "world");

    c.bench_function("transform_insert_replace", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b))))
    });
}

fn bench_transform_window(c: &mut Criterion) {
    let history: Vec<Change> = (0..64)
        .map(|i| Change::insert("bob", i, "body", (i as usize) * 2, "xy"))
        .collect();
    let change = Change::insert("alice", 0, "body", 0, "!");

    c.bench_function("transform_across_64", |bench| {
        bench.iter(|| black_box(transform_across(black_box(&change), history.iter())))
    });
}

fn bench_remote_change(c: &mut Criterion) {
    c.bench_function("apply_remote_change_window_32", |bench| {
        bench.iter_batched(
            || {
                let mut session = DocumentSession::open(
                    Uuid::new_v4(),
                    Arc::new(MemoryStore::new()),
                    SyncConfig::default(),
                )
                .unwrap();
                for i in 0..32 {
                    session
                        .apply_remote_change(Change::insert("bob", i, "body", 0, "ab"))
                        .unwrap();
                }
                session
            },
            |mut session| {
                black_box(
                    session
                        .apply_remote_change(Change::insert("alice", 0, "body", 0, "!"))
                        .unwrap(),
                );
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let update = ChangeBroadcast {
        branch: BranchId::main(),
        version: 42,
        change: Change::insert("alice", 41, "body", 7, "typical edit"),
    };

    c.bench_function("envelope_roundtrip_change", |bench| {
        bench.iter(|| {
            let encoded = Envelope::change(doc, black_box(&update)).unwrap().encode().unwrap();
            black_box(Envelope::decode(&encoded).unwrap());
        })
    });
}

fn bench_broadcast_1000_to_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_envelopes_100_peers", |bench| {
        bench.iter(|| {
            rt.block_on(async {
                let room = Room::new(2048);
                let mut receivers = Vec::with_capacity(100);
                for i in 0..100 {
                    receivers.push(room.join(&format!("peer-{i}")).await);
                }
                let data = Arc::new(vec![0u8; 64]);
                for _ in 0..1000 {
                    room.publish_raw(black_box(data.clone()));
                }
                black_box(receivers.len());
            })
        })
    });
}

fn bench_offline_replay(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("offline_replay_1000_changes", |bench| {
        bench.iter_batched(
            || {
                let mut queue = OfflineQueue::new("carol", 1000);
                let doc = Uuid::new_v4();
                for i in 0..1000 {
                    queue
                        .enqueue(doc, Change::insert("carol", i, "body", 0, "x").with_timestamp(i))
                        .unwrap();
                }
                let engine = SyncEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
                (engine, queue)
            },
            |(engine, mut queue)| {
                rt.block_on(async {
                    black_box(engine.replay_offline(&mut queue).await.unwrap());
                })
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_rocks_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let doc = Uuid::new_v4();

    c.bench_function("rocks_append_entry", |bench| {
        let mut seq = 0u64;
        bench.iter(|| {
            let change = Change::insert("alice", seq, "body", 0, "x");
            let entry = LogEntry::new(
                seq,
                BranchId::main(),
                change.clone(),
                Some(change),
                None,
                Disposition::Applied,
            )
            .unwrap();
            store.append_change(black_box(doc), &entry).unwrap();
            seq += 1;
        })
    });
}

criterion_group!(
    benches,
    bench_transform_pair,
    bench_transform_window,
    bench_remote_change,
    bench_envelope_roundtrip,
    bench_broadcast_1000_to_100,
    bench_offline_replay,
    bench_rocks_append,
);
criterion_main!(benches);

//! Performance benchmarks for squad-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use squad_engine::{
    ConflictResolver, EntityType, Match, OperationKind, Priority, QueueSnapshot, Record,
    SyncOperation, SyncOperationQueue,
};

fn match_record(id: u64, last_modified: u64) -> Record {
    Record::Match(Match {
        id: format!("m_{}", id),
        group_id: "g_1".into(),
        played_at: 0,
        team_a: vec!["p_1".into(), "p_2".into()],
        team_b: vec!["p_3".into(), "p_4".into()],
        score_a: Some(3),
        score_b: Some(2),
        last_modified,
    })
}

fn update_op(id: u64, record_id: u64) -> SyncOperation {
    let priority = match id % 3 {
        0 => Priority::High,
        1 => Priority::Normal,
        _ => Priority::Low,
    };
    SyncOperation::new(
        format!("op_{}", id),
        OperationKind::Update,
        EntityType::Match,
        Some(&match_record(record_id, id)),
        priority,
        id,
        5,
    )
    .unwrap()
}

fn filled_queue(size: u64) -> SyncOperationQueue {
    let mut queue = SyncOperationQueue::new();
    for i in 0..size {
        queue.enqueue(update_op(i, i));
    }
    queue
}

fn bench_queue_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_operations");

    for size in [10u64, 100, 500].iter() {
        // Enqueue into a queue that already holds `size` distinct records
        group.bench_with_input(BenchmarkId::new("enqueue", size), size, |b, &size| {
            let mut queue = filled_queue(size);
            let mut id = size;
            b.iter(|| {
                id += 1;
                queue.enqueue(black_box(update_op(id, id % size)))
            })
        });

        group.bench_with_input(BenchmarkId::new("dequeue_batch", size), size, |b, &size| {
            let queue = filled_queue(size);
            b.iter(|| queue.dequeue_batch(black_box(5), black_box(0)))
        });
    }

    group.finish();
}

fn bench_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolution");
    let resolver = ConflictResolver::default();

    group.bench_function("resolve_within_window", |b| {
        let local = match_record(1, 1_000);
        let remote = match_record(1, 1_050);
        b.iter(|| resolver.resolve(black_box(Some(&local)), black_box(Some(&remote)), 2_000))
    });

    group.bench_function("resolve_remote_newer", |b| {
        let local = match_record(1, 1_000);
        let remote = match_record(1, 90_000);
        b.iter(|| resolver.resolve(black_box(Some(&local)), black_box(Some(&remote)), 2_000))
    });

    group.bench_function("same_content", |b| {
        let local = match_record(1, 1_000);
        let remote = match_record(1, 90_000);
        b.iter(|| black_box(&local).same_content(black_box(&remote)))
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100u64, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("export", size), size, |b, &size| {
            let queue = filled_queue(size);
            b.iter(|| queue.snapshot().to_json())
        });

        group.bench_with_input(BenchmarkId::new("import", size), size, |b, &size| {
            let json = filled_queue(size).snapshot().to_json().unwrap();
            b.iter(|| {
                let snapshot = QueueSnapshot::from_json(black_box(&json)).unwrap();
                SyncOperationQueue::restore(snapshot)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_queue_operations, bench_resolution, bench_snapshot);
criterion_main!(benches);

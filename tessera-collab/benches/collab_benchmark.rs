use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tessera_collab::{
    resolve, ChatKind, ChatRelay, Envelope, OpDraft, Operation, OperationLog, PresenceTracker,
    ReplicaId, VectorClock,
};

/// 1,000 operations from four replicas on 50 targets, partially synced.
fn workload() -> Vec<Operation> {
    let mut logs: Vec<OperationLog> = ["a", "b", "c", "d"]
        .iter()
        .map(|r| OperationLog::new((*r).into()))
        .collect();
    let mut ops = Vec::with_capacity(1_000);
    for i in 0..1_000u64 {
        let r = (i % 4) as usize;
        if i % 10 == 0 {
            let peer = (r + 1) % 4;
            let incoming: Vec<Operation> = logs[peer].operations().to_vec();
            for op in incoming {
                logs[r].apply_remote(op).unwrap();
            }
        }
        let target = format!("C{}", i % 50);
        ops.push(logs[r].apply_local_at(OpDraft::update(target, i as i64), i).unwrap());
    }
    ops
}

fn bench_resolve_1000(c: &mut Criterion) {
    let ops = workload();
    c.bench_function("resolve_1000_ops_50_targets", |b| {
        b.iter(|| black_box(resolve(black_box(&ops))))
    });
}

fn bench_apply_remote_1000(c: &mut Criterion) {
    let ops = workload();
    c.bench_function("apply_remote_1000", |b| {
        b.iter(|| {
            let mut log = OperationLog::new("observer".into());
            for op in &ops {
                log.apply_remote(op.clone()).unwrap();
            }
            black_box(log.len());
        })
    });
}

fn bench_apply_local(c: &mut Criterion) {
    let mut log = OperationLog::new("a".into());
    c.bench_function("apply_local", |b| {
        b.iter(|| black_box(log.apply_local_at(OpDraft::update("C1", 1i64), 0).unwrap()))
    });
}

fn bench_vector_clock_dominates(c: &mut Criterion) {
    let a: VectorClock = (0..16).map(|i| (ReplicaId::from(format!("r{i}")), 5u64)).collect();
    let mut b_clock = a.clone();
    b_clock.increment(&"r3".into()).unwrap();
    c.bench_function("vector_clock_dominates_16", |b| {
        b.iter(|| black_box(black_box(&b_clock).dominates(black_box(&a))))
    });
}

fn bench_envelope_encode(c: &mut Criterion) {
    let mut log = OperationLog::new("a".into());
    let op = log.apply_local_at(OpDraft::update("C1", "some cell text"), 1).unwrap();
    c.bench_function("envelope_encode_operation", |b| {
        b.iter(|| {
            let envelope = Envelope::operation("collab:sheet", black_box(&op)).unwrap();
            black_box(envelope.encode().unwrap());
        })
    });
}

fn bench_envelope_decode(c: &mut Criterion) {
    let mut log = OperationLog::new("a".into());
    let op = log.apply_local_at(OpDraft::update("C1", "some cell text"), 1).unwrap();
    let encoded = Envelope::operation("collab:sheet", &op).unwrap().encode().unwrap();
    c.bench_function("envelope_decode_operation", |b| {
        b.iter(|| {
            let envelope = Envelope::decode(black_box(&encoded)).unwrap();
            black_box(envelope.to_operation().unwrap());
        })
    });
}

fn bench_presence_list_100(c: &mut Criterion) {
    let mut tracker = PresenceTracker::new("local".into(), "Local");
    for i in 0..100 {
        let mut peer = PresenceTracker::new(format!("peer-{i}").into(), "Peer");
        tracker.observe_remote(peer.update_local_at("C1", i, 0));
    }
    c.bench_function("presence_list_others_100", |b| {
        b.iter(|| black_box(tracker.list_others()))
    });
}

fn bench_chat_send(c: &mut Criterion) {
    let mut chat = ChatRelay::new("a".into(), "A", 500);
    c.bench_function("chat_send_capped_500", |b| {
        b.iter(|| black_box(chat.send("hello", None, ChatKind::Message)))
    });
}

criterion_group!(
    benches,
    bench_resolve_1000,
    bench_apply_remote_1000,
    bench_apply_local,
    bench_vector_clock_dominates,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_presence_list_100,
    bench_chat_send,
);
criterion_main!(benches);

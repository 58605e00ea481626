use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use tx_log::{
    AppendOptions, InMemoryTransactionLog, LogRecord, ParticipantId, Phase, PhaseOutcome,
    TransactionId, TransactionLog, TransactionLogExt, acquire_lease,
};

fn attempt(n: u32) -> LogRecord {
    LogRecord::phase_attempt(
        Phase::Confirm,
        ParticipantId::from("account"),
        PhaseOutcome::Success,
        n,
        None,
    )
}

fn bench_append_single_record(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("tx_log/append_single_record", |b| {
        b.iter(|| {
            rt.block_on(async {
                let log = InMemoryTransactionLog::new();
                log.append_record(TransactionId::new(), attempt(1))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_append_batch_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("tx_log/append_batch_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let log = InMemoryTransactionLog::new();
                let records: Vec<_> = (1..=10).map(attempt).collect();
                log.append(TransactionId::new(), records, AppendOptions::new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_replay_100_entries(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let log = InMemoryTransactionLog::new();
    let tx = TransactionId::new();
    rt.block_on(async {
        let records: Vec<_> = (1..=100).map(attempt).collect();
        log.append(tx, records, AppendOptions::new()).await.unwrap();
    });

    c.bench_function("tx_log/read_all_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let entries = log.read_all(tx).await.unwrap();
                assert_eq!(entries.len(), 100);
            });
        });
    });
}

fn bench_acquire_lease(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("tx_log/acquire_lease", |b| {
        b.iter(|| {
            rt.block_on(async {
                let log = InMemoryTransactionLog::new();
                acquire_lease(&log, TransactionId::new(), "bench", Duration::from_secs(30))
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_append_single_record,
    bench_append_batch_10,
    bench_replay_100_entries,
    bench_acquire_lease
);
criterion_main!(benches);

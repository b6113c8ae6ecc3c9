//! Benchmarks for the emoji verification handshake
//!
//! Measures state machine overhead with the mock engine and transport:
//! - One full handshake (Start, Key, Confirm, Mac)
//! - Many concurrent handshakes delivered as batches

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use courier::news::{compose_digest, FeedEntry};
use courier::verification::{
    Decision, DeviceId, KeyPayload, MockCryptoEngine, MockPrompt, MockTransport, StartEvent,
    TransactionId, UserId, VerificationConfig, VerificationEvent, VerificationStateMachine,
    EMOJI_METHOD,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn start(tx: &TransactionId) -> VerificationEvent {
    VerificationEvent::Start(StartEvent {
        transaction_id: tx.clone(),
        sender: UserId("@alice:example.org".to_string()),
        from_device: DeviceId("PHONE".to_string()),
        supported_methods: vec![EMOJI_METHOD.to_string()],
    })
}

fn key(tx: &TransactionId) -> VerificationEvent {
    VerificationEvent::Key {
        transaction_id: tx.clone(),
        key_payload: KeyPayload(vec![42; 32]),
    }
}

/// Run `sessions` handshakes to completion on one machine
async fn run_handshakes(sessions: usize) -> usize {
    let crypto = MockCryptoEngine::new();
    let (machine, mut decisions) = VerificationStateMachine::new(
        Arc::new(crypto.clone()),
        Arc::new(MockTransport::new()),
        Arc::new(MockPrompt::new(Decision::Confirm)),
        VerificationConfig::default(),
    );

    let ids: Vec<TransactionId> = (0..sessions)
        .map(|i| TransactionId(format!("tx-{}", i)))
        .collect();

    machine.handle_events(ids.iter().map(start).collect()).await;
    machine.handle_events(ids.iter().map(key).collect()).await;

    for _ in 0..sessions {
        if let Some(outcome) = decisions.recv().await {
            machine.handle_decision(outcome).await;
        }
    }

    let macs = ids
        .iter()
        .filter_map(|tx| {
            crypto.counterpart_mac(tx).map(|mac_payload| VerificationEvent::Mac {
                transaction_id: tx.clone(),
                mac_payload,
            })
        })
        .collect();
    machine.handle_events(macs).await;

    crypto.mac_verifications()
}

fn benchmark_single_handshake(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();

    c.bench_function("handshake_single", |b| {
        b.iter(|| runtime.block_on(run_handshakes(black_box(1))));
    });
}

fn benchmark_handshake_scaling(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("handshake_scaling");

    for sessions in [10, 50, 100].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(sessions),
            sessions,
            |b, &sessions| {
                b.iter(|| runtime.block_on(run_handshakes(black_box(sessions))));
            },
        );
    }

    group.finish();
}

fn benchmark_news_digest(c: &mut Criterion) {
    let entries: Vec<FeedEntry> = (0..100)
        .map(|i| FeedEntry::new(format!("Story {}", i), format!("http://example.org/{}", i)))
        .collect();
    let existing: HashSet<String> = (0..50)
        .map(|i| format!("https://example.org/{}", i))
        .collect();

    c.bench_function("news_digest_100_entries", |b| {
        b.iter(|| compose_digest("Feed", black_box(&entries), black_box(&existing)));
    });
}

criterion_group!(
    benches,
    benchmark_single_handshake,
    benchmark_handshake_scaling,
    benchmark_news_digest
);
criterion_main!(benches);

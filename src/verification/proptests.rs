//! Property-based tests for the verification state machine
//!
//! Random interleavings of signaling events and human decisions across a few
//! transactions. Checked after every step:
//! - States only move forward along the handshake, or into a terminal state
//! - Terminal states never change
//! - A verified session always had its SAS accepted

use super::events::*;
use super::machine::{VerificationConfig, VerificationStateMachine};
use super::mock::{MockCryptoEngine, MockPrompt, MockTransport};
use super::session::SessionState;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

const TRANSACTIONS: usize = 3;

#[derive(Debug, Clone)]
enum Step {
    Start(usize),
    StartWithoutEmoji(usize),
    Key(usize),
    GoodMac(usize),
    BadMac(usize),
    Cancel(usize),
    Unknown(usize),
    Decide(usize, Decision),
}

fn decision_strategy() -> impl Strategy<Value = Decision> {
    prop_oneof![
        Just(Decision::Confirm),
        Just(Decision::Reject),
        Just(Decision::CancelNoAnswer),
    ]
}

fn step_strategy() -> impl Strategy<Value = Step> {
    let tx = 0..TRANSACTIONS;
    prop_oneof![
        3 => tx.clone().prop_map(Step::Start),
        1 => tx.clone().prop_map(Step::StartWithoutEmoji),
        3 => tx.clone().prop_map(Step::Key),
        2 => tx.clone().prop_map(Step::GoodMac),
        1 => tx.clone().prop_map(Step::BadMac),
        1 => tx.clone().prop_map(Step::Cancel),
        1 => tx.clone().prop_map(Step::Unknown),
        3 => (tx, decision_strategy()).prop_map(|(tx, d)| Step::Decide(tx, d)),
    ]
}

fn tx(index: usize) -> TransactionId {
    TransactionId(format!("tx-{}", index))
}

fn start(index: usize, methods: &[&str]) -> VerificationEvent {
    VerificationEvent::Start(StartEvent {
        transaction_id: tx(index),
        sender: UserId("@alice:example.org".to_string()),
        from_device: DeviceId(format!("DEVICE{}", index)),
        supported_methods: methods.iter().map(|m| m.to_string()).collect(),
    })
}

/// Position along the happy path
fn progress(state: SessionState) -> u8 {
    match state {
        SessionState::AwaitingStart => 0,
        SessionState::KeysShared => 1,
        SessionState::AwaitingDecision => 2,
        SessionState::MacExchanged => 3,
        SessionState::Verified => 4,
        SessionState::Cancelled | SessionState::Errored => 5,
    }
}

type Machine = VerificationStateMachine<MockCryptoEngine, MockTransport, MockPrompt>;

async fn apply(machine: &Machine, crypto: &MockCryptoEngine, step: Step) {
    match step {
        Step::Start(i) => machine.handle_event(start(i, &[EMOJI_METHOD])).await,
        Step::StartWithoutEmoji(i) => machine.handle_event(start(i, &["decimal"])).await,
        Step::Key(i) => {
            machine
                .handle_event(VerificationEvent::Key {
                    transaction_id: tx(i),
                    key_payload: KeyPayload(vec![7; 32]),
                })
                .await
        }
        Step::GoodMac(i) => {
            let mac = crypto
                .counterpart_mac(&tx(i))
                .unwrap_or_else(|| MacPayload(vec![0; 32]));
            machine
                .handle_event(VerificationEvent::Mac {
                    transaction_id: tx(i),
                    mac_payload: mac,
                })
                .await
        }
        Step::BadMac(i) => {
            machine
                .handle_event(VerificationEvent::Mac {
                    transaction_id: tx(i),
                    mac_payload: MacPayload(vec![1, 2, 3]),
                })
                .await
        }
        Step::Cancel(i) => {
            machine
                .handle_event(VerificationEvent::Cancel {
                    transaction_id: tx(i),
                    sender: UserId("@alice:example.org".to_string()),
                    reason: "User cancelled".to_string(),
                })
                .await
        }
        Step::Unknown(i) => {
            machine
                .handle_event(VerificationEvent::Unknown {
                    transaction_id: Some(tx(i)),
                    event_type: "m.key.verification.ready".to_string(),
                })
                .await
        }
        Step::Decide(i, decision) => {
            machine
                .handle_decision(DecisionOutcome {
                    transaction_id: tx(i),
                    decision,
                })
                .await
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Property: sessions never move backwards and never leave a terminal state,
    /// and `verified` implies `sas_accepted`
    #[test]
    fn transitions_are_monotonic(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let violation: Option<String> = runtime.block_on(async {
            let crypto = MockCryptoEngine::new();
            let (machine, _decisions) = VerificationStateMachine::new(
                Arc::new(crypto.clone()),
                Arc::new(MockTransport::new()),
                Arc::new(MockPrompt::never_answers()),
                VerificationConfig::default(),
            );

            let mut seen: HashMap<TransactionId, SessionState> = HashMap::new();

            for step in steps {
                let label = format!("{:?}", step);
                apply(&machine, &crypto, step).await;

                for i in 0..TRANSACTIONS {
                    let id = tx(i);
                    let Some(session) = machine.registry().snapshot(&id).await else {
                        continue;
                    };
                    let now = session.state();

                    if session.verified() && !session.sas_accepted() {
                        return Some(format!("{} verified without SAS acceptance after {}", id, label));
                    }

                    if let Some(&before) = seen.get(&id) {
                        if before.is_terminal() && now != before {
                            return Some(format!("{} left terminal {} for {} after {}", id, before, now, label));
                        }
                        if progress(now) < progress(before) {
                            return Some(format!("{} moved back from {} to {} after {}", id, before, now, label));
                        }
                    }
                    seen.insert(id, now);
                }
            }

            None
        });

        prop_assert!(violation.is_none(), "{:?}", violation);
    }

    /// Property: a session only reaches Verified through a successful MAC check
    #[test]
    fn verified_requires_mac_check(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (verified, checks) = runtime.block_on(async {
            let crypto = MockCryptoEngine::new();
            let (machine, _decisions) = VerificationStateMachine::new(
                Arc::new(crypto.clone()),
                Arc::new(MockTransport::new()),
                Arc::new(MockPrompt::never_answers()),
                VerificationConfig::default(),
            );

            for step in steps {
                apply(&machine, &crypto, step).await;
            }

            let mut verified = 0;
            for i in 0..TRANSACTIONS {
                if let Some(session) = machine.registry().snapshot(&tx(i)).await {
                    if session.verified() {
                        verified += 1;
                    }
                }
            }
            (verified, crypto.mac_verifications())
        });

        prop_assert!(verified <= checks, "{} verified sessions but {} MAC checks", verified, checks);
    }
}

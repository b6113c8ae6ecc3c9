//! Loopback verification
//!
//! Plays the initiating device against the real state machine, with the mock
//! engine and transport standing in for the homeserver. The emoji prompt is
//! the terminal, or a fixed answer for unattended runs.

use super::config::{default_config_path, CourierConfig};
use courier::verification::{
    parse_answer, DecisionPrompt, DeviceId, FixedPrompt, KeyPayload, MacPayload,
    MockCryptoEngine, MockTransport, OutboundEvent, SessionRegistry, StartEvent, TerminalPrompt,
    TransactionId, UserId, VerificationConfig, VerificationEvent, VerificationService,
    VerificationSession, EMOJI_METHOD,
};
use rand::RngCore;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Device id the simulated initiator claims
const LOOPBACK_DEVICE: &str = "LOOPBACK";

/// How the simulated initiator behaves
#[derive(Debug, Clone)]
pub struct Scenario {
    pub counterpart: UserId,
    pub methods: Vec<String>,
    pub wrong_mac: bool,
}

/// What the handshake left behind
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub transaction_id: TransactionId,
    /// None when no session was ever created
    pub session: Option<VerificationSession>,
    pub outbound: Vec<OutboundEvent>,
}

/// Run one loopback handshake and print the resulting session flags
pub async fn execute(
    config_path: Option<String>,
    answer: Option<String>,
    methods: Vec<String>,
    wrong_mac: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let config = if config_path.exists() {
        CourierConfig::load(&config_path)?
    } else {
        CourierConfig::default()
    };
    config.logging.init()?;

    let scenario = Scenario {
        counterpart: UserId(config.bot.user_id.clone()),
        methods,
        wrong_mac,
    };
    let verification = config.verification_config();

    println!("🔐 Simulating emoji verification with {}", scenario.counterpart);
    println!();

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let report = match answer {
        Some(answer) => {
            let prompt = Arc::new(FixedPrompt::new(parse_answer(&answer)));
            run_loopback(prompt, verification, &scenario, interrupt).await
        }
        None => {
            let prompt = Arc::new(TerminalPrompt::new());
            run_loopback(prompt, verification, &scenario, interrupt).await
        }
    };

    print_report(&report);
    Ok(())
}

/// Drive one handshake until it finishes or `interrupt` resolves
pub async fn run_loopback<P, F>(
    prompt: Arc<P>,
    config: VerificationConfig,
    scenario: &Scenario,
    interrupt: F,
) -> SimulationReport
where
    P: DecisionPrompt + 'static,
    F: Future<Output = ()>,
{
    let crypto = Arc::new(MockCryptoEngine::new());
    let transport = Arc::new(MockTransport::new());
    let poll = config.poll_interval;

    let mut service =
        VerificationService::new(Arc::clone(&crypto), Arc::clone(&transport), prompt, config);
    let registry = service.machine().registry().clone();
    let transaction_id = TransactionId(uuid::Uuid::new_v4().to_string());

    tokio::select! {
        _ = drive_initiator(&crypto, &transport, &registry, &transaction_id, scenario, poll) => {
            debug!(transaction_id = %transaction_id, "Loopback handshake finished");
        }
        _ = service.run(std::future::pending()) => {}
        _ = interrupt => {
            warn!(transaction_id = %transaction_id, "Interrupted, stopping simulation");
        }
    }

    SimulationReport {
        session: registry.snapshot(&transaction_id).await,
        outbound: transport.outbound(),
        transaction_id,
    }
}

async fn drive_initiator(
    crypto: &MockCryptoEngine,
    transport: &MockTransport,
    registry: &SessionRegistry,
    transaction_id: &TransactionId,
    scenario: &Scenario,
    poll: Duration,
) {
    transport.push_event(VerificationEvent::Start(StartEvent {
        transaction_id: transaction_id.clone(),
        sender: scenario.counterpart.clone(),
        from_device: DeviceId(LOOPBACK_DEVICE.to_string()),
        supported_methods: scenario.methods.clone(),
    }));

    if !scenario.methods.iter().any(|m| m == EMOJI_METHOD) {
        // No session will exist; let the service log the refusal first.
        tokio::time::sleep(poll * 3).await;
        return;
    }

    let key_shared = wait_for(registry, transaction_id, poll, || {
        transport.key_share_for(transaction_id).is_some()
    })
    .await;
    if !key_shared {
        return;
    }

    let mut key = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    transport.push_event(VerificationEvent::Key {
        transaction_id: transaction_id.clone(),
        key_payload: KeyPayload(key),
    });

    let mac_received = wait_for(registry, transaction_id, poll, || {
        transport.mac_for(transaction_id).is_some()
    })
    .await;
    if !mac_received {
        return;
    }

    let mac = if scenario.wrong_mac {
        MacPayload(vec![0; 32])
    } else {
        match crypto.counterpart_mac(transaction_id) {
            Some(mac) => mac,
            None => return,
        }
    };
    transport.push_event(VerificationEvent::Mac {
        transaction_id: transaction_id.clone(),
        mac_payload: mac,
    });

    wait_for(registry, transaction_id, poll, || false).await;
}

/// Poll until `ready` holds. Returns false once the session has finished.
async fn wait_for(
    registry: &SessionRegistry,
    transaction_id: &TransactionId,
    poll: Duration,
    ready: impl Fn() -> bool,
) -> bool {
    loop {
        if ready() {
            return true;
        }
        if registry
            .try_state(transaction_id)
            .is_some_and(|state| state.is_terminal())
        {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

fn print_report(report: &SimulationReport) {
    println!();
    println!("Transaction: {}", report.transaction_id);

    match &report.session {
        None => println!("No verification session was started."),
        Some(session) => {
            println!("  state:          {}", session.state());
            println!("  we_started_it:  {}", session.we_started_it);
            println!("  sas_accepted:   {}", session.sas_accepted());
            println!("  verified:       {}", session.verified());
            println!("  canceled:       {}", session.canceled);
            println!("  timed_out:      {}", session.timed_out);
            if let Some(reason) = &session.cancel_reason {
                println!("  cancel_reason:  {}", reason);
            }
            if !session.verified_devices().is_empty() {
                let devices: Vec<String> = session
                    .verified_devices()
                    .iter()
                    .map(|d| d.to_string())
                    .collect();
                println!("  devices:        {}", devices.join(", "));
            }
        }
    }

    println!("Sent {} signaling message(s)", report.outbound.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier::verification::{Decision, SessionState};

    fn config() -> VerificationConfig {
        VerificationConfig {
            poll_interval: Duration::from_millis(5),
            sweep_interval: Duration::from_millis(50),
            ..VerificationConfig::default()
        }
    }

    fn scenario(methods: &[&str], wrong_mac: bool) -> Scenario {
        Scenario {
            counterpart: UserId("@bot:example.org".to_string()),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            wrong_mac,
        }
    }

    async fn run(decision: Decision, scenario: Scenario) -> SimulationReport {
        let prompt = Arc::new(FixedPrompt::new(decision));
        let run = run_loopback(prompt, config(), &scenario, std::future::pending());
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("loopback did not finish")
    }

    #[tokio::test]
    async fn test_loopback_confirm_verifies() {
        let report = run(Decision::Confirm, scenario(&[EMOJI_METHOD], false)).await;
        let session = report.session.unwrap();

        assert_eq!(session.state(), SessionState::Verified);
        assert!(session.sas_accepted());
        assert!(!session.we_started_it);
        assert!(session
            .verified_devices()
            .contains(&DeviceId(LOOPBACK_DEVICE.to_string())));
    }

    #[tokio::test]
    async fn test_loopback_reject_cancels_with_mismatch() {
        let report = run(Decision::Reject, scenario(&[EMOJI_METHOD], false)).await;
        let session = report.session.unwrap();

        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(session.canceled);
        assert!(report.outbound.iter().any(|e| matches!(
            e,
            OutboundEvent::Cancel { reject: true, .. }
        )));
    }

    #[tokio::test]
    async fn test_loopback_wrong_mac_errors() {
        let report = run(Decision::Confirm, scenario(&[EMOJI_METHOD], true)).await;
        let session = report.session.unwrap();

        assert_eq!(session.state(), SessionState::Errored);
        assert!(!session.verified());
    }

    #[tokio::test]
    async fn test_loopback_without_emoji_creates_nothing() {
        let report = run(Decision::Confirm, scenario(&["decimal"], false)).await;

        assert!(report.session.is_none());
        assert!(report.outbound.is_empty());
    }
}

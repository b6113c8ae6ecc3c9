//! Verification service loop
//!
//! Polls the transport for signaling events, routes human decisions back into
//! the state machine, and sweeps idle and finished sessions. Runs until the
//! shutdown future resolves (Ctrl-C in the CLI).

use super::events::DecisionOutcome;
use super::machine::{VerificationConfig, VerificationStateMachine};
use super::traits::*;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Long-running responder for emoji verification requests
pub struct VerificationService<C, T, P> {
    machine: VerificationStateMachine<C, T, P>,
    decisions: mpsc::UnboundedReceiver<DecisionOutcome>,
}

impl<C, T, P> VerificationService<C, T, P>
where
    C: CryptoEngine + 'static,
    T: TransportChannel + 'static,
    P: DecisionPrompt + 'static,
{
    pub fn new(
        crypto: Arc<C>,
        transport: Arc<T>,
        prompt: Arc<P>,
        config: VerificationConfig,
    ) -> Self {
        let (machine, decisions) = VerificationStateMachine::new(crypto, transport, prompt, config);
        Self { machine, decisions }
    }

    pub fn machine(&self) -> &VerificationStateMachine<C, T, P> {
        &self.machine
    }

    /// Run the event loop until `shutdown` resolves.
    ///
    /// Nothing in here returns early on error: transport hiccups are logged
    /// and the next tick tries again.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let config = self.machine.config().clone();
        let mut poll_interval = tokio::time::interval(config.poll_interval);
        let mut sweep_interval = tokio::time::interval(config.sweep_interval);
        tokio::pin!(shutdown);

        info!("Waiting for emoji verification requests");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping verification service");
                    break;
                }
                Some(outcome) = self.decisions.recv() => {
                    self.machine.handle_decision(outcome).await;
                }
                _ = poll_interval.tick() => {
                    let events = match self.machine.transport().receive_events().await {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("Error receiving verification events, will retry: {}", e);
                            continue;
                        }
                    };

                    if !events.is_empty() {
                        debug!(count = events.len(), "Received verification events");
                        self.machine.handle_events(events).await;
                    }
                }
                _ = sweep_interval.tick() => {
                    let expired = self.machine.expire_idle().await;
                    let evicted = self.machine.evict_terminal();
                    if expired > 0 || evicted > 0 {
                        debug!(expired, evicted, "Swept verification sessions");
                    }
                }
            }
        }
    }
}

//! Emoji Verification State Machine
//!
//! Applies inbound signaling events and human decisions to the session they
//! address:
//! - `Start` (emoji offered) -> accept, share our key -> `KeysShared`
//! - `Key` -> derive the SAS, ask the human off the dispatch path -> `AwaitingDecision`
//! - decision Confirm -> confirm, send our MAC -> `MacExchanged`
//! - `Mac` -> verify the counterpart's MAC -> `Verified`
//! - `Cancel` at any point -> `Cancelled`
//!
//! Protocol and crypto errors are recovered here and never escape to the
//! caller. Transport failures are logged and left for the idle timeout.

use super::events::*;
use super::messages::*;
use super::registry::SessionRegistry;
use super::session::{SessionState, VerificationSession};
use super::traits::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Default wait for a human answer before treating it as "no answer"
const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default inactivity limit for a live handshake
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default time a finished session is kept to absorb duplicate events
const DEFAULT_TERMINAL_RETENTION: Duration = Duration::from_secs(60);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Verification timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationConfig {
    pub decision_timeout: Duration,
    pub session_timeout: Duration,
    pub terminal_retention: Duration,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            decision_timeout: DEFAULT_DECISION_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            terminal_retention: DEFAULT_TERMINAL_RETENTION,
            poll_interval: DEFAULT_POLL_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Responder side of the emoji verification handshake
pub struct VerificationStateMachine<C, T, P> {
    registry: SessionRegistry,
    crypto: Arc<C>,
    transport: Arc<T>,
    prompt: Arc<P>,
    config: VerificationConfig,
    decisions: mpsc::UnboundedSender<DecisionOutcome>,
    /// Prompt tasks still waiting on a human, by transaction
    prompts: Mutex<HashMap<TransactionId, AbortHandle>>,
}

impl<C, T, P> VerificationStateMachine<C, T, P>
where
    C: CryptoEngine + 'static,
    T: TransportChannel + 'static,
    P: DecisionPrompt + 'static,
{
    /// Build the machine around injected collaborators.
    ///
    /// The returned receiver yields one `DecisionOutcome` per finished prompt;
    /// feed them back through [`Self::handle_decision`].
    pub fn new(
        crypto: Arc<C>,
        transport: Arc<T>,
        prompt: Arc<P>,
        config: VerificationConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DecisionOutcome>) {
        let (decisions, outcomes) = mpsc::unbounded_channel();
        let machine = Self {
            registry: SessionRegistry::new(),
            crypto,
            transport,
            prompt,
            config,
            decisions,
            prompts: Mutex::new(HashMap::new()),
        };
        (machine, outcomes)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Number of decision prompts still open
    pub fn open_prompts(&self) -> usize {
        self.open_prompt_handles().len()
    }

    /// Apply one inbound signaling event.
    ///
    /// Safe to call with duplicate or late events: anything addressed to a
    /// finished session is dropped without side effects.
    pub async fn handle_event(&self, event: VerificationEvent) {
        let transaction_id = match &event {
            VerificationEvent::Unknown {
                transaction_id,
                event_type,
            } => {
                warn!(
                    ?transaction_id,
                    event_type = %event_type,
                    "Received unexpected verification event, ignoring"
                );
                return;
            }
            VerificationEvent::Start(start) if !start.supports_emoji() => {
                info!(
                    transaction_id = %start.transaction_id,
                    "{}",
                    msg_unsupported_methods(&start.sender, &start.supported_methods)
                );
                return;
            }
            VerificationEvent::Start(start) => start.transaction_id.clone(),
            VerificationEvent::Cancel { transaction_id, .. }
            | VerificationEvent::Key { transaction_id, .. }
            | VerificationEvent::Mac { transaction_id, .. } => transaction_id.clone(),
        };

        let handle = match self.registry.get_or_create(&transaction_id, &event) {
            Ok(handle) => handle,
            Err(ProtocolError::UnknownTransaction(_)) => {
                debug!(
                    transaction_id = %transaction_id,
                    event = event.kind(),
                    "No verification session for event, ignoring"
                );
                return;
            }
            Err(e) => {
                warn!(transaction_id = %transaction_id, "Ignoring verification event: {}", e);
                return;
            }
        };

        let mut session = handle.lock().await;
        let state = session.state();
        if state.is_terminal() {
            debug!(
                transaction_id = %transaction_id,
                state = %state,
                event = event.kind(),
                "Ignoring late event for finished verification"
            );
            return;
        }
        session.touch();

        let result = match event {
            VerificationEvent::Start(start) => self.on_start(&mut session, &start).await,
            VerificationEvent::Cancel { sender, reason, .. } => {
                self.on_cancel(&mut session, &sender, &reason);
                Ok(())
            }
            VerificationEvent::Key { key_payload, .. } => {
                self.on_key(&mut session, &key_payload).await
            }
            VerificationEvent::Mac { mac_payload, .. } => {
                self.on_mac(&mut session, mac_payload).await
            }
            VerificationEvent::Unknown { .. } => Ok(()),
        };

        if let Err(err) = result {
            self.recover(&mut session, err).await;
        }
        self.dismiss_prompt(&session);
    }

    /// Apply a batch of events in delivery order.
    ///
    /// A `Key` or `Mac` followed later in the same batch by a `Cancel` for the
    /// same transaction is dropped: the cancellation is already known and wins
    /// over completion.
    pub async fn handle_events(&self, events: Vec<VerificationEvent>) {
        let cancelled_at: HashMap<TransactionId, usize> = events
            .iter()
            .enumerate()
            .filter_map(|(index, event)| match event {
                VerificationEvent::Cancel { transaction_id, .. } => {
                    Some((transaction_id.clone(), index))
                }
                _ => None,
            })
            .collect();

        for (index, event) in events.into_iter().enumerate() {
            let superseded = matches!(
                event,
                VerificationEvent::Key { .. } | VerificationEvent::Mac { .. }
            ) && event
                .transaction_id()
                .and_then(|id| cancelled_at.get(id))
                .is_some_and(|&cancel_index| cancel_index > index);

            if superseded {
                debug!(
                    transaction_id = ?event.transaction_id(),
                    event = event.kind(),
                    "Dropping event superseded by pending cancel"
                );
                continue;
            }

            self.handle_event(event).await;
        }
    }

    /// Apply a human decision delivered by a prompt task.
    ///
    /// Stale answers (session cancelled or gone while the prompt was open)
    /// are discarded.
    pub async fn handle_decision(&self, outcome: DecisionOutcome) {
        let Some(handle) = self.registry.find(&outcome.transaction_id) else {
            debug!(
                transaction_id = %outcome.transaction_id,
                "Discarding decision for unknown verification"
            );
            return;
        };

        let mut session = handle.lock().await;
        if session.state() != SessionState::AwaitingDecision {
            info!(
                transaction_id = %outcome.transaction_id,
                state = %session.state(),
                decision = ?outcome.decision,
                "Discarding stale decision"
            );
            return;
        }
        session.touch();

        let result = match outcome.decision {
            Decision::Confirm => self.on_confirm(&mut session).await,
            Decision::Reject => {
                self.on_reject(&mut session).await;
                Ok(())
            }
            Decision::CancelNoAnswer => {
                self.on_user_cancel(&mut session).await;
                Ok(())
            }
        };

        if let Err(err) = result {
            self.recover(&mut session, err).await;
        }
        self.dismiss_prompt(&session);
    }

    /// Cancel live sessions idle longer than `session_timeout`.
    ///
    /// Returns how many sessions were timed out.
    pub async fn expire_idle(&self) -> usize {
        let mut expired = 0;

        for (transaction_id, handle) in self.registry.handles() {
            let mut session = handle.lock().await;
            if session.state().is_terminal() || session.idle_for() < self.config.session_timeout
            {
                continue;
            }

            if session.time_out() {
                warn!(
                    transaction_id = %transaction_id,
                    "{}",
                    msg_timed_out(&session.counterpart_sender)
                );
                self.send_cancel(&transaction_id, false).await;
                self.dismiss_prompt(&session);
                expired += 1;
            }
        }

        expired
    }

    /// Drop finished sessions once their retention window has passed.
    ///
    /// Returns how many sessions were evicted.
    pub fn evict_terminal(&self) -> usize {
        let mut evicted = 0;

        for (transaction_id, handle) in self.registry.handles() {
            let expired = handle
                .try_lock()
                .map(|s| s.state().is_terminal() && s.idle_for() >= self.config.terminal_retention)
                .unwrap_or(false);

            if expired && self.registry.remove(&transaction_id).is_ok() {
                debug!(transaction_id = %transaction_id, "Evicted finished verification");
                evicted += 1;
            }
        }

        evicted
    }

    async fn on_start(
        &self,
        session: &mut VerificationSession,
        start: &StartEvent,
    ) -> VerificationResult<()> {
        let transaction_id = session.transaction_id.clone();
        info!(
            transaction_id = %transaction_id,
            sender = %start.sender,
            device = %start.from_device,
            "Emoji verification requested"
        );

        self.crypto.accept(start).await?;
        self.deliver(&transaction_id, "accept", self.transport.accept(&transaction_id).await);

        let key = self.crypto.share_key(&transaction_id).await?;
        session.advance(SessionState::KeysShared)?;
        self.deliver(
            &transaction_id,
            "key share",
            self.transport.send_key_share(&transaction_id, &key).await,
        );

        Ok(())
    }

    fn on_cancel(&self, session: &mut VerificationSession, sender: &UserId, reason: &str) {
        // The counterpart already considers the flow dead; nothing to send back.
        if session.cancel(reason) {
            info!(
                transaction_id = %session.transaction_id,
                "{}",
                msg_cancelled_by_counterpart(sender, reason)
            );
        }
    }

    async fn on_key(
        &self,
        session: &mut VerificationSession,
        payload: &KeyPayload,
    ) -> VerificationResult<()> {
        self.expect_state(session, SessionState::KeysShared, "key")?;
        let transaction_id = session.transaction_id.clone();
        debug!(transaction_id = %transaction_id, key = %payload.fingerprint(), "Received key share");

        self.crypto.receive_key(&transaction_id, payload).await?;
        let sas = self.crypto.derive_short_auth_string(&transaction_id).await?;
        if sas.is_empty() {
            return Err(
                CryptoError::Engine("empty short authentication string".to_string()).into(),
            );
        }

        session.set_short_auth_string(sas.clone())?;
        session.advance(SessionState::AwaitingDecision)?;
        debug!(transaction_id = %transaction_id, sas = %sas, "Short authentication string derived");

        self.spawn_decision(DecisionRequest {
            transaction_id,
            counterpart: session.counterpart_sender.clone(),
            short_auth_string: sas,
        });

        Ok(())
    }

    async fn on_mac(
        &self,
        session: &mut VerificationSession,
        payload: MacPayload,
    ) -> VerificationResult<()> {
        match session.state() {
            // The other side confirmed faster than our human; hold the MAC
            // until the decision arrives.
            SessionState::AwaitingDecision => {
                if session.has_pending_mac() {
                    debug!(transaction_id = %session.transaction_id, "Replacing buffered MAC");
                }
                session.buffer_mac(payload);
                Ok(())
            }
            SessionState::MacExchanged => self.verify_counterpart_mac(session, payload).await,
            _ => Err(self.unexpected(session, "mac").into()),
        }
    }

    async fn on_confirm(&self, session: &mut VerificationSession) -> VerificationResult<()> {
        let transaction_id = session.transaction_id.clone();

        self.crypto.confirm(&transaction_id).await?;
        session.accept_sas()?;
        info!(
            transaction_id = %transaction_id,
            "{}",
            msg_sas_confirmed(&session.counterpart_sender)
        );

        let mac = self.crypto.compute_mac(&transaction_id).await?;
        session.set_own_mac(mac);
        self.send_own_mac(session).await;

        if let Some(pending) = session.take_pending_mac() {
            self.verify_counterpart_mac(session, pending).await?;
        }

        Ok(())
    }

    async fn on_reject(&self, session: &mut VerificationSession) {
        let transaction_id = session.transaction_id.clone();
        self.send_cancel(&transaction_id, true).await;
        session.cancel("short authentication strings did not match");
        info!(
            transaction_id = %transaction_id,
            "{}",
            msg_sas_rejected(&session.counterpart_sender)
        );
    }

    async fn on_user_cancel(&self, session: &mut VerificationSession) {
        let transaction_id = session.transaction_id.clone();
        self.send_cancel(&transaction_id, false).await;
        session.cancel("cancelled by user");
        info!(
            transaction_id = %transaction_id,
            "{}",
            msg_cancelled_by_user(&session.counterpart_sender)
        );
    }

    async fn verify_counterpart_mac(
        &self,
        session: &mut VerificationSession,
        payload: MacPayload,
    ) -> VerificationResult<()> {
        let transaction_id = session.transaction_id.clone();

        let devices = self.crypto.verify_mac(&transaction_id, &payload).await?;
        if devices.is_empty() {
            return Err(CryptoError::MacMismatch("MAC covers no devices".to_string()).into());
        }

        if !session.mac_sent() {
            self.send_own_mac(session).await;
        }

        session.mark_verified(devices)?;
        info!(
            transaction_id = %transaction_id,
            we_started_it = session.we_started_it,
            sas_accepted = session.sas_accepted(),
            "{}",
            msg_verified(&session.counterpart_sender, session.verified_devices())
        );

        Ok(())
    }

    /// Send the MAC computed at confirmation time, if it has not gone out yet
    async fn send_own_mac(&self, session: &mut VerificationSession) {
        let Some(mac) = session.own_mac().cloned() else {
            return;
        };
        let transaction_id = session.transaction_id.clone();

        let sent = self.deliver(
            &transaction_id,
            "mac",
            self.transport.send_mac(&transaction_id, &mac).await,
        );
        if sent {
            session.mark_mac_sent();
        }
    }

    fn spawn_decision(&self, request: DecisionRequest) {
        let prompt = Arc::clone(&self.prompt);
        let decisions = self.decisions.clone();
        let timeout = self.config.decision_timeout;
        let transaction_id = request.transaction_id.clone();

        let task = tokio::spawn(async move {
            let decision = match tokio::time::timeout(timeout, prompt.ask(&request)).await {
                Ok(decision) => decision,
                Err(_) => {
                    warn!(
                        transaction_id = %request.transaction_id,
                        "No answer within {}, cancelling",
                        humantime::format_duration(timeout)
                    );
                    Decision::CancelNoAnswer
                }
            };

            let outcome = DecisionOutcome {
                transaction_id: request.transaction_id,
                decision,
            };
            if decisions.send(outcome).is_err() {
                debug!("Verification machine dropped before decision was delivered");
            }
        });

        self.open_prompt_handles()
            .insert(transaction_id, task.abort_handle());
    }

    /// Close the prompt of a session that no longer waits for a decision.
    ///
    /// Called with the session lock held, so it cannot race the insert in
    /// `spawn_decision`.
    fn dismiss_prompt(&self, session: &VerificationSession) {
        if session.state() == SessionState::AwaitingDecision {
            return;
        }
        if let Some(task) = self.open_prompt_handles().remove(&session.transaction_id) {
            // No-op if the prompt already delivered its answer.
            task.abort();
            debug!(transaction_id = %session.transaction_id, "Closed decision prompt");
        }
    }

    fn open_prompt_handles(&self) -> MutexGuard<'_, HashMap<TransactionId, AbortHandle>> {
        self.prompts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Local recovery for a failed transition. Never propagates.
    async fn recover(&self, session: &mut VerificationSession, err: VerificationError) {
        let transaction_id = session.transaction_id.clone();
        let state = session.state();

        match err {
            VerificationError::Protocol(e) => {
                warn!(transaction_id = %transaction_id, state = %state, "Protocol error, event ignored: {}", e);
            }
            VerificationError::Crypto(e) => {
                error!(transaction_id = %transaction_id, state = %state, "Crypto engine error: {}", e);
                if session.fail() {
                    warn!(
                        transaction_id = %transaction_id,
                        "{}",
                        msg_not_concluded(&session.counterpart_sender, &e.to_string())
                    );
                    // A local protocol error means the engine already treats
                    // the flow as cancelled on our side.
                    if !matches!(e, CryptoError::LocalProtocol(_)) {
                        self.send_cancel(&transaction_id, false).await;
                    }
                }
            }
            VerificationError::Transport(e) => {
                warn!(transaction_id = %transaction_id, state = %state, "Transport error: {}", e);
            }
        }
    }

    async fn send_cancel(&self, transaction_id: &TransactionId, reject: bool) {
        self.deliver(
            transaction_id,
            "cancel",
            self.transport.send_cancel(transaction_id, reject).await,
        );
    }

    /// Log a failed send. Delivery is not retried here.
    fn deliver(
        &self,
        transaction_id: &TransactionId,
        what: &str,
        result: TransportResult<()>,
    ) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    transaction_id = %transaction_id,
                    "Failed to send {}: {}; verification will time out if not retried",
                    what,
                    e
                );
                false
            }
        }
    }

    fn expect_state(
        &self,
        session: &VerificationSession,
        expected: SessionState,
        event: &'static str,
    ) -> Result<(), ProtocolError> {
        if session.state() == expected {
            Ok(())
        } else {
            Err(self.unexpected(session, event))
        }
    }

    fn unexpected(&self, session: &VerificationSession, event: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedEvent {
            transaction_id: session.transaction_id.clone(),
            event,
            state: session.state(),
        }
    }
}

impl<C, T, P> Drop for VerificationStateMachine<C, T, P> {
    fn drop(&mut self) {
        let prompts = self.prompts.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, task) in prompts.drain() {
            task.abort();
        }
    }
}

//! Ephemeral verification session state
//!
//! One `VerificationSession` per in-flight handshake. Sessions live in RAM only
//! and never survive a restart; a handshake interrupted by a crash has to be
//! started again from the other device.

use super::events::*;
use super::traits::ProtocolError;
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AwaitingStart,
    /// Our key share is out, waiting for the counterpart's
    KeysShared,
    /// SAS derived, human decision outstanding
    AwaitingDecision,
    /// SAS confirmed and our MAC computed, waiting for the counterpart's MAC
    MacExchanged,
    Verified,
    Cancelled,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Cancelled | Self::Errored)
    }

    /// Whether `self -> next` is a legal move.
    ///
    /// Happy path is strictly one step at a time; any live state may drop to
    /// `Cancelled` or `Errored`; terminal states never move.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, next),
            (AwaitingStart, KeysShared)
                | (KeysShared, AwaitingDecision)
                | (AwaitingDecision, MacExchanged)
                | (MacExchanged, Verified)
                | (_, Cancelled)
                | (_, Errored)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingStart => "awaiting_start",
            Self::KeysShared => "keys_shared",
            Self::AwaitingDecision => "awaiting_decision",
            Self::MacExchanged => "mac_exchanged",
            Self::Verified => "verified",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight emoji verification
#[derive(Debug, Clone)]
pub struct VerificationSession {
    pub transaction_id: TransactionId,

    /// User on the other side of the handshake
    pub counterpart_sender: UserId,

    /// Always false for the responder, kept so later checks can tell
    /// which side opened the flow
    pub we_started_it: bool,

    pub canceled: bool,
    pub cancel_reason: Option<String>,
    pub timed_out: bool,

    state: SessionState,
    short_auth_string: ShortAuthString,
    sas_accepted: bool,
    verified_devices: BTreeSet<DeviceId>,
    own_mac: Option<MacPayload>,
    mac_sent: bool,
    pending_mac: Option<MacPayload>,
    last_activity: Instant,
}

impl VerificationSession {
    /// Session for a handshake the counterpart opened
    pub fn from_start(start: &StartEvent) -> Self {
        Self {
            transaction_id: start.transaction_id.clone(),
            counterpart_sender: start.sender.clone(),
            we_started_it: false,
            canceled: false,
            cancel_reason: None,
            timed_out: false,
            state: SessionState::AwaitingStart,
            short_auth_string: ShortAuthString::default(),
            sas_accepted: false,
            verified_devices: BTreeSet::new(),
            own_mac: None,
            mac_sent: false,
            pending_mac: None,
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn short_auth_string(&self) -> &ShortAuthString {
        &self.short_auth_string
    }

    pub fn sas_accepted(&self) -> bool {
        self.sas_accepted
    }

    pub fn verified(&self) -> bool {
        self.state == SessionState::Verified
    }

    pub fn verified_devices(&self) -> &BTreeSet<DeviceId> {
        &self.verified_devices
    }

    pub fn own_mac(&self) -> Option<&MacPayload> {
        self.own_mac.as_ref()
    }

    pub fn mac_sent(&self) -> bool {
        self.mac_sent
    }

    pub fn has_pending_mac(&self) -> bool {
        self.pending_mac.is_some()
    }

    /// Time since the last event or decision touched this session
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Move along the state graph, rejecting anything `can_transition_to` forbids
    pub fn advance(&mut self, next: SessionState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::InvalidTransition {
                transaction_id: self.transaction_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Store the derived SAS. Both sides must look at the same value, so it
    /// is written exactly once.
    pub fn set_short_auth_string(&mut self, sas: ShortAuthString) -> Result<(), ProtocolError> {
        if !self.short_auth_string.is_empty() {
            return Err(ProtocolError::ShortAuthStringAlreadySet(
                self.transaction_id.clone(),
            ));
        }
        self.short_auth_string = sas;
        Ok(())
    }

    /// Record the human's confirmation; only legal while the decision is
    /// outstanding, and it is what moves the session to `MacExchanged`.
    pub fn accept_sas(&mut self) -> Result<(), ProtocolError> {
        if self.state != SessionState::AwaitingDecision {
            return Err(ProtocolError::InvalidTransition {
                transaction_id: self.transaction_id.clone(),
                from: self.state,
                to: SessionState::MacExchanged,
            });
        }
        self.sas_accepted = true;
        self.advance(SessionState::MacExchanged)
    }

    pub fn set_own_mac(&mut self, mac: MacPayload) {
        self.own_mac = Some(mac);
    }

    pub fn mark_mac_sent(&mut self) {
        self.mac_sent = true;
    }

    /// Hold a counterpart MAC that arrived before our human answered
    pub fn buffer_mac(&mut self, mac: MacPayload) {
        self.pending_mac = Some(mac);
    }

    pub fn take_pending_mac(&mut self) -> Option<MacPayload> {
        self.pending_mac.take()
    }

    /// Conclude successfully. Requires a confirmed SAS and `MacExchanged`.
    pub fn mark_verified(
        &mut self,
        devices: impl IntoIterator<Item = DeviceId>,
    ) -> Result<(), ProtocolError> {
        if !self.sas_accepted {
            return Err(ProtocolError::InvalidTransition {
                transaction_id: self.transaction_id.clone(),
                from: self.state,
                to: SessionState::Verified,
            });
        }
        self.advance(SessionState::Verified)?;
        self.verified_devices.extend(devices);
        Ok(())
    }

    /// Cancel unilaterally. Returns false if the session was already terminal.
    pub fn cancel(&mut self, reason: impl Into<String>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.canceled = true;
        self.cancel_reason = Some(reason.into());
        self.state = SessionState::Cancelled;
        true
    }

    /// Idle timeout: cancel and remember why
    pub fn time_out(&mut self) -> bool {
        if self.cancel("timed out") {
            self.timed_out = true;
            return true;
        }
        false
    }

    /// Local failure (crypto engine refused). Returns false if already terminal.
    pub fn fail(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SessionState::Errored;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> VerificationSession {
        VerificationSession::from_start(&StartEvent {
            transaction_id: TransactionId::from("tx-1"),
            sender: UserId("@alice:example.org".to_string()),
            from_device: DeviceId("PHONE".to_string()),
            supported_methods: vec![EMOJI_METHOD.to_string()],
        })
    }

    fn test_sas() -> ShortAuthString {
        ShortAuthString(vec![SasSymbol::new("🐶", "Dog")])
    }

    fn session_awaiting_decision() -> VerificationSession {
        let mut session = test_session();
        session.advance(SessionState::KeysShared).unwrap();
        session.set_short_auth_string(test_sas()).unwrap();
        session.advance(SessionState::AwaitingDecision).unwrap();
        session
    }

    #[test]
    fn test_new_session_defaults() {
        let session = test_session();
        assert_eq!(session.state(), SessionState::AwaitingStart);
        assert!(!session.we_started_it);
        assert!(session.short_auth_string().is_empty());
        assert!(!session.sas_accepted());
        assert!(!session.canceled);
        assert!(session.verified_devices().is_empty());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut session = session_awaiting_decision();
        session.accept_sas().unwrap();
        assert_eq!(session.state(), SessionState::MacExchanged);

        session
            .mark_verified([DeviceId("PHONE".to_string())])
            .unwrap();
        assert!(session.verified());
        assert_eq!(session.verified_devices().len(), 1);
    }

    #[test]
    fn test_skipping_steps_is_rejected() {
        let mut session = test_session();
        assert!(session.advance(SessionState::AwaitingDecision).is_err());
        assert!(session.advance(SessionState::Verified).is_err());
        assert_eq!(session.state(), SessionState::AwaitingStart);
    }

    #[test]
    fn test_accept_sas_only_while_awaiting_decision() {
        let mut session = test_session();
        session.advance(SessionState::KeysShared).unwrap();
        assert!(session.accept_sas().is_err());
        assert!(!session.sas_accepted());
    }

    #[test]
    fn test_mark_verified_requires_sas_accepted() {
        let mut session = session_awaiting_decision();
        assert!(session.mark_verified(Vec::new()).is_err());
        assert!(!session.verified());
    }

    #[test]
    fn test_short_auth_string_set_once() {
        let mut session = test_session();
        session.set_short_auth_string(test_sas()).unwrap();

        let other = ShortAuthString(vec![SasSymbol::new("🐱", "Cat")]);
        assert!(matches!(
            session.set_short_auth_string(other),
            Err(ProtocolError::ShortAuthStringAlreadySet(_))
        ));
        assert_eq!(session.short_auth_string(), &test_sas());
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for setup in [
            test_session as fn() -> VerificationSession,
            session_awaiting_decision,
        ] {
            let mut session = setup();
            assert!(session.cancel("user walked away"));
            assert_eq!(session.state(), SessionState::Cancelled);
            assert!(session.canceled);
            assert_eq!(session.cancel_reason.as_deref(), Some("user walked away"));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut session = test_session();
        session.cancel("first");
        assert!(!session.cancel("second"));
        assert!(!session.fail());
        assert!(session.advance(SessionState::KeysShared).is_err());
        assert_eq!(session.cancel_reason.as_deref(), Some("first"));
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_time_out_sets_flags() {
        let mut session = session_awaiting_decision();
        assert!(session.time_out());
        assert!(session.timed_out);
        assert!(session.canceled);
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_pending_mac_buffer() {
        let mut session = session_awaiting_decision();
        session.buffer_mac(MacPayload(vec![7]));
        assert!(session.has_pending_mac());
        assert_eq!(session.take_pending_mac(), Some(MacPayload(vec![7])));
        assert!(!session.has_pending_mac());
    }
}

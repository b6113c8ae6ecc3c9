//! Collaborator Trait Abstractions
//!
//! The state machine never talks to a homeserver or a crypto library directly.
//! Everything it needs is behind these traits so the handshake can be driven
//! by `verification::mock` in tests and by a real SDK binding in production.

use super::events::*;
use super::session::SessionState;
use async_trait::async_trait;

/// Result type for crypto engine operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type for state machine internals
pub type VerificationResult<T> = Result<T, VerificationError>;

/// Malformed, out-of-order or otherwise unacceptable signaling
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TransactionId),

    #[error("Duplicate start for live transaction: {0}")]
    DuplicateStart(TransactionId),

    #[error("Session {0} is not terminal")]
    NotTerminal(TransactionId),

    #[error("Unexpected {event} event for {transaction_id} in state {state}")]
    UnexpectedEvent {
        transaction_id: TransactionId,
        event: &'static str,
        state: SessionState,
    },

    #[error("Invalid transition for {transaction_id}: {from} -> {to}")]
    InvalidTransition {
        transaction_id: TransactionId,
        from: SessionState,
        to: SessionState,
    },

    #[error("Short authentication string already set for {0}")]
    ShortAuthStringAlreadySet(TransactionId),
}

/// Crypto engine rejected an operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The engine's own view of the handshake forbids the call
    /// (e.g. it was already cancelled locally)
    #[error("Local protocol error: {0}")]
    LocalProtocol(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("MAC mismatch: {0}")]
    MacMismatch(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

/// Outbound delivery failure, surfaced by the transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rejected by server: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Key agreement, SAS derivation and MAC handling for one device
///
/// Implementations keep their own per-transaction handshake objects; the
/// state machine only passes the transaction id and the payloads it received.
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Register an inbound start and accept the handshake locally
    async fn accept(&self, start: &StartEvent) -> CryptoResult<()>;

    /// Produce this side's key-share payload
    async fn share_key(&self, transaction_id: &TransactionId) -> CryptoResult<KeyPayload>;

    /// Feed the counterpart's key-share payload into the handshake
    async fn receive_key(
        &self,
        transaction_id: &TransactionId,
        payload: &KeyPayload,
    ) -> CryptoResult<()>;

    /// Derive the short authentication string from the exchanged keys
    async fn derive_short_auth_string(
        &self,
        transaction_id: &TransactionId,
    ) -> CryptoResult<ShortAuthString>;

    /// Mark the short authentication string as confirmed by the human
    async fn confirm(&self, transaction_id: &TransactionId) -> CryptoResult<()>;

    /// Compute this side's MAC payload (requires a prior `confirm`)
    async fn compute_mac(&self, transaction_id: &TransactionId) -> CryptoResult<MacPayload>;

    /// Verify the counterpart's MAC.
    ///
    /// Returns the devices whose keys the MAC covers; those become the
    /// session's verified devices.
    async fn verify_mac(
        &self,
        transaction_id: &TransactionId,
        payload: &MacPayload,
    ) -> CryptoResult<Vec<DeviceId>>;
}

/// Signaling channel to the counterpart device
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Drain inbound signaling events addressed to this device
    async fn receive_events(&self) -> TransportResult<Vec<VerificationEvent>>;

    /// Tell the counterpart we accept its start
    async fn accept(&self, transaction_id: &TransactionId) -> TransportResult<()>;

    async fn send_key_share(
        &self,
        transaction_id: &TransactionId,
        payload: &KeyPayload,
    ) -> TransportResult<()>;

    async fn send_mac(
        &self,
        transaction_id: &TransactionId,
        payload: &MacPayload,
    ) -> TransportResult<()>;

    /// Cancel the handshake. `reject` marks a SAS mismatch rather than a
    /// plain user cancel.
    async fn send_cancel(&self, transaction_id: &TransactionId, reject: bool)
        -> TransportResult<()>;
}

/// Human decision point
///
/// `ask` may take human-scale time. The state machine always calls it from a
/// task of its own, never from the event dispatch path.
#[async_trait]
pub trait DecisionPrompt: Send + Sync {
    async fn ask(&self, request: &DecisionRequest) -> Decision;
}

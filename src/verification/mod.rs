//! Emoji Device Verification
//!
//! Responder side of the interactive SAS handshake:
//! - Sessions keyed by transaction id, owned by the registry
//! - Event-driven state machine, cancellable at every step
//! - Human decision gate that never blocks other handshakes
//!
//! The crypto engine and the signaling transport are external collaborators
//! behind `CryptoEngine` and `TransportChannel`.

pub mod events;
pub mod machine;
pub mod messages;
pub mod mock;
pub mod prompt;
pub mod registry;
pub mod service;
pub mod session;
pub mod traits;

#[cfg(test)]
mod proptests;

pub use events::{
    Decision, DecisionOutcome, DecisionRequest, DeviceId, KeyPayload, MacPayload, SasSymbol,
    ShortAuthString, StartEvent, TransactionId, UserId, VerificationEvent, EMOJI_METHOD,
};
pub use machine::{VerificationConfig, VerificationStateMachine};
pub use mock::{MockCryptoEngine, MockPrompt, MockTransport, OutboundEvent};
pub use prompt::{parse_answer, FixedPrompt, TerminalPrompt};
pub use registry::{SessionHandle, SessionRegistry};
pub use service::VerificationService;
pub use session::{SessionState, VerificationSession};
pub use traits::{
    CryptoEngine, CryptoError, DecisionPrompt, ProtocolError, TransportChannel, TransportError,
    VerificationError, VerificationResult,
};

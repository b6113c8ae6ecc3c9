//! Signaling events and identifiers for the emoji verification handshake.
//!
//! Inbound events arrive from the transport already decoded into
//! [`VerificationEvent`]; everything the transport could not classify ends up
//! in [`VerificationEvent::Unknown`] so the state machine can log and drop it.

use std::fmt;

/// Short authentication string method the bot is willing to run.
pub const EMOJI_METHOD: &str = "emoji";

/// Opaque correlation token scoping all events of one handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Fully qualified user identifier (e.g. `@bot:example.org`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device identifier of one of a user's sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key-share payload produced and consumed by the crypto engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPayload(pub Vec<u8>);

/// MAC payload produced and consumed by the crypto engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacPayload(pub Vec<u8>);

/// Hex of the first 8 bytes, for logs
fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}

impl KeyPayload {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl MacPayload {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

/// One symbol of a short authentication string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasSymbol {
    pub emoji: String,
    pub description: String,
}

impl SasSymbol {
    pub fn new(emoji: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            emoji: emoji.into(),
            description: description.into(),
        }
    }
}

/// Ordered, human-comparable symbols derived from the agreed key material
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShortAuthString(pub Vec<SasSymbol>);

impl ShortAuthString {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn symbols(&self) -> &[SasSymbol] {
        &self.0
    }
}

impl fmt::Display for ShortAuthString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .0
            .iter()
            .map(|s| format!("{} ({})", s.emoji, s.description))
            .collect();
        f.write_str(&rendered.join("  "))
    }
}

/// Session-opening event sent by the device that initiates verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartEvent {
    pub transaction_id: TransactionId,
    pub sender: UserId,
    pub from_device: DeviceId,
    pub supported_methods: Vec<String>,
}

impl StartEvent {
    pub fn supports_emoji(&self) -> bool {
        self.supported_methods.iter().any(|m| m == EMOJI_METHOD)
    }
}

/// Inbound signaling event, already addressed to this device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationEvent {
    Start(StartEvent),
    Cancel {
        transaction_id: TransactionId,
        sender: UserId,
        reason: String,
    },
    Key {
        transaction_id: TransactionId,
        key_payload: KeyPayload,
    },
    Mac {
        transaction_id: TransactionId,
        mac_payload: MacPayload,
    },
    /// Anything the transport delivered that is not part of the emoji flow
    Unknown {
        transaction_id: Option<TransactionId>,
        event_type: String,
    },
}

impl VerificationEvent {
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            Self::Start(start) => Some(&start.transaction_id),
            Self::Cancel { transaction_id, .. }
            | Self::Key { transaction_id, .. }
            | Self::Mac { transaction_id, .. } => Some(transaction_id),
            Self::Unknown { transaction_id, .. } => transaction_id.as_ref(),
        }
    }

    /// Only `Start` may create a session
    pub fn is_opening(&self) -> bool {
        matches!(self, Self::Start(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Cancel { .. } => "cancel",
            Self::Key { .. } => "key",
            Self::Mac { .. } => "mac",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Answer returned by the human at the decision point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Emoji match on both devices
    Confirm,
    /// Emoji differ; the handshake is rejected as a mismatch
    Reject,
    /// No definitive answer (explicit cancel, timeout, closed input)
    CancelNoAnswer,
}

/// What the decision prompt is asked to show
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRequest {
    pub transaction_id: TransactionId,
    pub counterpart: UserId,
    pub short_auth_string: ShortAuthString,
}

/// Decision routed back to the state machine, keyed by transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub transaction_id: TransactionId,
    pub decision: Decision,
}

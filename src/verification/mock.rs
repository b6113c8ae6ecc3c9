//! Mock collaborators for testing
//!
//! Provides MockCryptoEngine, MockTransport and MockPrompt so the handshake can
//! be driven end to end without a homeserver or a real crypto library.
//! The mock engine derives its SAS and MACs by hashing both key shares, which
//! is enough to make mismatches observable; it is not a key agreement.

use super::events::*;
use super::traits::*;
use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Number of symbols in an emoji SAS
const SAS_LENGTH: usize = 7;

/// Emoji table used for the 6-bit SAS symbols
const SAS_EMOJI: [(&str, &str); 64] = [
    ("🐶", "Dog"),
    ("🐱", "Cat"),
    ("🦁", "Lion"),
    ("🐎", "Horse"),
    ("🦄", "Unicorn"),
    ("🐷", "Pig"),
    ("🐘", "Elephant"),
    ("🐰", "Rabbit"),
    ("🐼", "Panda"),
    ("🐓", "Rooster"),
    ("🐧", "Penguin"),
    ("🐢", "Turtle"),
    ("🐟", "Fish"),
    ("🐙", "Octopus"),
    ("🦋", "Butterfly"),
    ("🌷", "Flower"),
    ("🌳", "Tree"),
    ("🌵", "Cactus"),
    ("🍄", "Mushroom"),
    ("🌏", "Globe"),
    ("🌙", "Moon"),
    ("☁️", "Cloud"),
    ("🔥", "Fire"),
    ("🍌", "Banana"),
    ("🍎", "Apple"),
    ("🍓", "Strawberry"),
    ("🌽", "Corn"),
    ("🍕", "Pizza"),
    ("🎂", "Cake"),
    ("❤️", "Heart"),
    ("😀", "Smiley"),
    ("🤖", "Robot"),
    ("🎩", "Hat"),
    ("👓", "Glasses"),
    ("🔧", "Spanner"),
    ("🎅", "Santa"),
    ("👍", "Thumbs Up"),
    ("☂️", "Umbrella"),
    ("⌛", "Hourglass"),
    ("⏰", "Clock"),
    ("🎁", "Gift"),
    ("💡", "Light Bulb"),
    ("📕", "Book"),
    ("✏️", "Pencil"),
    ("📎", "Paperclip"),
    ("✂️", "Scissors"),
    ("🔒", "Lock"),
    ("🔑", "Key"),
    ("🔨", "Hammer"),
    ("☎️", "Telephone"),
    ("🏁", "Flag"),
    ("🚂", "Train"),
    ("🚲", "Bicycle"),
    ("✈️", "Aeroplane"),
    ("🚀", "Rocket"),
    ("🏆", "Trophy"),
    ("⚽", "Ball"),
    ("🎸", "Guitar"),
    ("🎺", "Trumpet"),
    ("🔔", "Bell"),
    ("⚓", "Anchor"),
    ("🎧", "Headphones"),
    ("📁", "Folder"),
    ("📌", "Pin"),
];

/// Crypto engine operations, for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CryptoOp {
    Accept,
    ShareKey,
    ReceiveKey,
    DeriveSas,
    Confirm,
    ComputeMac,
    VerifyMac,
}

/// Mock crypto engine
#[derive(Clone, Default)]
pub struct MockCryptoEngine {
    state: Arc<Mutex<CryptoState>>,
}

#[derive(Default)]
struct CryptoState {
    handshakes: HashMap<TransactionId, MockHandshake>,
    failures: HashMap<CryptoOp, CryptoError>,
    sas_derivations: usize,
    mac_verifications: usize,
}

struct MockHandshake {
    device: DeviceId,
    our_key: Vec<u8>,
    their_key: Option<Vec<u8>>,
    sas_derived: bool,
    confirmed: bool,
}

impl MockHandshake {
    fn shared_secret(&self, transaction_id: &TransactionId) -> Option<Vec<u8>> {
        let their_key = self.their_key.as_ref()?;
        let (low, high) = if self.our_key <= *their_key {
            (&self.our_key, their_key)
        } else {
            (their_key, &self.our_key)
        };

        let mut hasher = Sha256::new();
        hasher.update(transaction_id.0.as_bytes());
        hasher.update(low);
        hasher.update(high);
        Some(hasher.finalize().to_vec())
    }
}

fn mac_over(label: &[u8], secret: &[u8]) -> MacPayload {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(secret);
    MacPayload(hasher.finalize().to_vec())
}

const OUR_MAC_LABEL: &[u8] = b"courier-mock-mac-responder";
const THEIR_MAC_LABEL: &[u8] = b"courier-mock-mac-initiator";

/// Split the first 42 bits of `secret` into seven 6-bit emoji indices
fn emoji_from_secret(secret: &[u8]) -> ShortAuthString {
    let bits = secret
        .iter()
        .take(6)
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));

    let symbols = (0..SAS_LENGTH)
        .map(|i| {
            let index = ((bits >> (42 - 6 * i)) & 0x3f) as usize;
            let (emoji, description) = SAS_EMOJI[index];
            SasSymbol::new(emoji, description)
        })
        .collect();

    ShortAuthString(symbols)
}

impl MockCryptoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CryptoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every future call of `op` fail with `err`
    pub fn fail_on(&self, op: CryptoOp, err: CryptoError) {
        self.lock().failures.insert(op, err);
    }

    pub fn clear_failure(&self, op: CryptoOp) {
        self.lock().failures.remove(&op);
    }

    /// How many times a SAS was derived, across all transactions
    pub fn sas_derivations(&self) -> usize {
        self.lock().sas_derivations
    }

    /// How many successful `verify_mac` calls were made
    pub fn mac_verifications(&self) -> usize {
        self.lock().mac_verifications
    }

    pub fn is_confirmed(&self, transaction_id: &TransactionId) -> bool {
        self.lock()
            .handshakes
            .get(transaction_id)
            .map(|h| h.confirmed)
            .unwrap_or(false)
    }

    /// The MAC a well-behaved counterpart would send, once keys are exchanged
    pub fn counterpart_mac(&self, transaction_id: &TransactionId) -> Option<MacPayload> {
        let state = self.lock();
        let handshake = state.handshakes.get(transaction_id)?;
        let secret = handshake.shared_secret(transaction_id)?;
        Some(mac_over(THEIR_MAC_LABEL, &secret))
    }

    fn check(&self, state: &CryptoState, op: CryptoOp) -> CryptoResult<()> {
        match state.failures.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn unknown(transaction_id: &TransactionId) -> CryptoError {
    CryptoError::LocalProtocol(format!("no handshake for {}", transaction_id))
}

#[async_trait]
impl CryptoEngine for MockCryptoEngine {
    async fn accept(&self, start: &StartEvent) -> CryptoResult<()> {
        let mut state = self.lock();
        self.check(&state, CryptoOp::Accept)?;

        let mut our_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut our_key);

        state.handshakes.insert(
            start.transaction_id.clone(),
            MockHandshake {
                device: start.from_device.clone(),
                our_key,
                their_key: None,
                sas_derived: false,
                confirmed: false,
            },
        );
        Ok(())
    }

    async fn share_key(&self, transaction_id: &TransactionId) -> CryptoResult<KeyPayload> {
        let state = self.lock();
        self.check(&state, CryptoOp::ShareKey)?;

        let handshake = state
            .handshakes
            .get(transaction_id)
            .ok_or_else(|| unknown(transaction_id))?;
        Ok(KeyPayload(handshake.our_key.clone()))
    }

    async fn receive_key(
        &self,
        transaction_id: &TransactionId,
        payload: &KeyPayload,
    ) -> CryptoResult<()> {
        let mut state = self.lock();
        self.check(&state, CryptoOp::ReceiveKey)?;

        if payload.0.is_empty() {
            return Err(CryptoError::InvalidKey("empty key share".to_string()));
        }

        let handshake = state
            .handshakes
            .get_mut(transaction_id)
            .ok_or_else(|| unknown(transaction_id))?;
        handshake.their_key = Some(payload.0.clone());
        Ok(())
    }

    async fn derive_short_auth_string(
        &self,
        transaction_id: &TransactionId,
    ) -> CryptoResult<ShortAuthString> {
        let mut state = self.lock();
        self.check(&state, CryptoOp::DeriveSas)?;

        let handshake = state
            .handshakes
            .get_mut(transaction_id)
            .ok_or_else(|| unknown(transaction_id))?;
        let secret = handshake
            .shared_secret(transaction_id)
            .ok_or_else(|| CryptoError::LocalProtocol("counterpart key missing".to_string()))?;
        handshake.sas_derived = true;

        state.sas_derivations += 1;
        Ok(emoji_from_secret(&secret))
    }

    async fn confirm(&self, transaction_id: &TransactionId) -> CryptoResult<()> {
        let mut state = self.lock();
        self.check(&state, CryptoOp::Confirm)?;

        let handshake = state
            .handshakes
            .get_mut(transaction_id)
            .ok_or_else(|| unknown(transaction_id))?;
        if !handshake.sas_derived {
            return Err(CryptoError::LocalProtocol(
                "short authentication string not derived".to_string(),
            ));
        }
        handshake.confirmed = true;
        Ok(())
    }

    async fn compute_mac(&self, transaction_id: &TransactionId) -> CryptoResult<MacPayload> {
        let state = self.lock();
        self.check(&state, CryptoOp::ComputeMac)?;

        let handshake = state
            .handshakes
            .get(transaction_id)
            .ok_or_else(|| unknown(transaction_id))?;
        if !handshake.confirmed {
            return Err(CryptoError::LocalProtocol(
                "short authentication string not confirmed".to_string(),
            ));
        }
        let secret = handshake
            .shared_secret(transaction_id)
            .ok_or_else(|| CryptoError::LocalProtocol("counterpart key missing".to_string()))?;
        Ok(mac_over(OUR_MAC_LABEL, &secret))
    }

    async fn verify_mac(
        &self,
        transaction_id: &TransactionId,
        payload: &MacPayload,
    ) -> CryptoResult<Vec<DeviceId>> {
        let mut state = self.lock();
        self.check(&state, CryptoOp::VerifyMac)?;

        let handshake = state
            .handshakes
            .get(transaction_id)
            .ok_or_else(|| unknown(transaction_id))?;
        if !handshake.confirmed {
            return Err(CryptoError::LocalProtocol(
                "short authentication string not confirmed".to_string(),
            ));
        }
        let secret = handshake
            .shared_secret(transaction_id)
            .ok_or_else(|| CryptoError::LocalProtocol("counterpart key missing".to_string()))?;

        if mac_over(THEIR_MAC_LABEL, &secret) != *payload {
            return Err(CryptoError::MacMismatch(format!(
                "unexpected MAC {}",
                payload.fingerprint()
            )));
        }

        let device = handshake.device.clone();
        state.mac_verifications += 1;
        Ok(vec![device])
    }
}

/// Outbound call recorded by MockTransport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Accept {
        transaction_id: TransactionId,
    },
    KeyShare {
        transaction_id: TransactionId,
        payload: KeyPayload,
    },
    Mac {
        transaction_id: TransactionId,
        payload: MacPayload,
    },
    Cancel {
        transaction_id: TransactionId,
        reject: bool,
    },
}

impl OutboundEvent {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            Self::Accept { transaction_id }
            | Self::KeyShare { transaction_id, .. }
            | Self::Mac { transaction_id, .. }
            | Self::Cancel { transaction_id, .. } => transaction_id,
        }
    }
}

/// Mock signaling transport
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

#[derive(Default)]
struct TransportState {
    inbound: Vec<VerificationEvent>,
    outbound: Vec<OutboundEvent>,
    send_failure: Option<TransportError>,
    receive_failure: Option<TransportError>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an inbound event for the next `receive_events`
    pub fn push_event(&self, event: VerificationEvent) {
        self.lock().inbound.push(event);
    }

    /// All outbound calls so far, in order
    pub fn outbound(&self) -> Vec<OutboundEvent> {
        self.lock().outbound.clone()
    }

    pub fn outbound_for(&self, transaction_id: &TransactionId) -> Vec<OutboundEvent> {
        self.lock()
            .outbound
            .iter()
            .filter(|e| e.transaction_id() == transaction_id)
            .cloned()
            .collect()
    }

    /// `reject` flags of every cancel sent for a transaction
    pub fn cancels_for(&self, transaction_id: &TransactionId) -> Vec<bool> {
        self.outbound_for(transaction_id)
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::Cancel { reject, .. } => Some(reject),
                _ => None,
            })
            .collect()
    }

    pub fn key_share_for(&self, transaction_id: &TransactionId) -> Option<KeyPayload> {
        self.outbound_for(transaction_id)
            .into_iter()
            .find_map(|e| match e {
                OutboundEvent::KeyShare { payload, .. } => Some(payload),
                _ => None,
            })
    }

    pub fn mac_for(&self, transaction_id: &TransactionId) -> Option<MacPayload> {
        self.outbound_for(transaction_id)
            .into_iter()
            .find_map(|e| match e {
                OutboundEvent::Mac { payload, .. } => Some(payload),
                _ => None,
            })
    }

    /// Make every send fail with `err` (None restores delivery)
    pub fn fail_sends(&self, err: Option<TransportError>) {
        self.lock().send_failure = err;
    }

    pub fn fail_receives(&self, err: Option<TransportError>) {
        self.lock().receive_failure = err;
    }

    /// Clear all state
    pub fn clear(&self) {
        let mut state = self.lock();
        *state = TransportState::default();
    }

    fn record(&self, event: OutboundEvent) -> TransportResult<()> {
        let mut state = self.lock();
        if let Some(err) = &state.send_failure {
            return Err(err.clone());
        }
        state.outbound.push(event);
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for MockTransport {
    async fn receive_events(&self) -> TransportResult<Vec<VerificationEvent>> {
        let mut state = self.lock();
        if let Some(err) = &state.receive_failure {
            return Err(err.clone());
        }
        Ok(state.inbound.drain(..).collect())
    }

    async fn accept(&self, transaction_id: &TransactionId) -> TransportResult<()> {
        self.record(OutboundEvent::Accept {
            transaction_id: transaction_id.clone(),
        })
    }

    async fn send_key_share(
        &self,
        transaction_id: &TransactionId,
        payload: &KeyPayload,
    ) -> TransportResult<()> {
        self.record(OutboundEvent::KeyShare {
            transaction_id: transaction_id.clone(),
            payload: payload.clone(),
        })
    }

    async fn send_mac(
        &self,
        transaction_id: &TransactionId,
        payload: &MacPayload,
    ) -> TransportResult<()> {
        self.record(OutboundEvent::Mac {
            transaction_id: transaction_id.clone(),
            payload: payload.clone(),
        })
    }

    async fn send_cancel(
        &self,
        transaction_id: &TransactionId,
        reject: bool,
    ) -> TransportResult<()> {
        self.record(OutboundEvent::Cancel {
            transaction_id: transaction_id.clone(),
            reject,
        })
    }
}

/// Mock decision prompt
///
/// Records every request. `MockPrompt::never_answers()` keeps the prompt
/// pending forever, like a human who walked away.
#[derive(Clone)]
pub struct MockPrompt {
    answer: Option<Decision>,
    requests: Arc<Mutex<Vec<DecisionRequest>>>,
    open: Arc<AtomicUsize>,
}

/// Counts an `ask` as open until its future completes or is dropped
struct OpenAsk(Arc<AtomicUsize>);

impl OpenAsk {
    fn new(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(open))
    }
}

impl Drop for OpenAsk {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockPrompt {
    pub fn new(answer: Decision) -> Self {
        Self {
            answer: Some(answer),
            requests: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn never_answers() -> Self {
        Self {
            answer: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn recorded(&self) -> MutexGuard<'_, Vec<DecisionRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn requests(&self) -> Vec<DecisionRequest> {
        self.recorded().clone()
    }

    pub fn ask_count(&self) -> usize {
        self.recorded().len()
    }

    /// Asks still waiting for an answer
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionPrompt for MockPrompt {
    async fn ask(&self, request: &DecisionRequest) -> Decision {
        self.recorded().push(request.clone());
        let _open = OpenAsk::new(&self.open);
        match self.answer {
            Some(decision) => decision,
            None => futures::future::pending::<Decision>().await,
        }
    }
}

//! In-memory verification session registry
//!
//! The map itself sits behind a short synchronous lock that is never held
//! across an `.await`. Each session has its own async mutex, so mutating one
//! handshake never blocks lookups for another.

use super::events::*;
use super::session::{SessionState, VerificationSession};
use super::traits::ProtocolError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared, individually locked session
pub type SessionHandle = Arc<tokio::sync::Mutex<VerificationSession>>;

/// Active sessions keyed by transaction id
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<TransactionId, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransactionId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the session an event belongs to, creating it for an opening event.
    ///
    /// - unknown id, `Start` -> new session
    /// - unknown id, anything else -> `UnknownTransaction`
    /// - known id, `Start` -> `DuplicateStart` (the live session is untouched)
    /// - known id, anything else -> existing session
    pub fn get_or_create(
        &self,
        transaction_id: &TransactionId,
        event: &VerificationEvent,
    ) -> Result<SessionHandle, ProtocolError> {
        let mut sessions = self.lock();

        if let Some(handle) = sessions.get(transaction_id) {
            if event.is_opening() {
                return Err(ProtocolError::DuplicateStart(transaction_id.clone()));
            }
            return Ok(Arc::clone(handle));
        }

        let VerificationEvent::Start(start) = event else {
            return Err(ProtocolError::UnknownTransaction(transaction_id.clone()));
        };

        let mut session = VerificationSession::from_start(start);
        session.transaction_id = transaction_id.clone();
        let handle = Arc::new(tokio::sync::Mutex::new(session));
        sessions.insert(transaction_id.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    pub fn find(&self, transaction_id: &TransactionId) -> Option<SessionHandle> {
        self.lock().get(transaction_id).cloned()
    }

    /// Evict a finished session.
    ///
    /// A session that is still live, or is being mutated right now, is left
    /// in place and reported as `NotTerminal`.
    pub fn remove(&self, transaction_id: &TransactionId) -> Result<(), ProtocolError> {
        let mut sessions = self.lock();

        let terminal = match sessions.get(transaction_id) {
            None => return Err(ProtocolError::UnknownTransaction(transaction_id.clone())),
            Some(handle) => handle
                .try_lock()
                .map(|session| session.state().is_terminal())
                .unwrap_or(false),
        };

        if !terminal {
            return Err(ProtocolError::NotTerminal(transaction_id.clone()));
        }

        sessions.remove(transaction_id);
        Ok(())
    }

    /// Current state of a session, if it exists and is not being mutated
    pub fn try_state(&self, transaction_id: &TransactionId) -> Option<SessionState> {
        let handle = self.find(transaction_id)?;
        let state = handle.try_lock().ok().map(|session| session.state());
        state
    }

    /// Clone of a session's current data
    pub async fn snapshot(&self, transaction_id: &TransactionId) -> Option<VerificationSession> {
        let handle = self.find(transaction_id)?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    /// Point-in-time copy of all handles, for sweeps
    pub fn handles(&self) -> Vec<(TransactionId, SessionHandle)> {
        self.lock()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_event(tx: &str) -> VerificationEvent {
        VerificationEvent::Start(StartEvent {
            transaction_id: TransactionId::from(tx),
            sender: UserId("@alice:example.org".to_string()),
            from_device: DeviceId("PHONE".to_string()),
            supported_methods: vec![EMOJI_METHOD.to_string()],
        })
    }

    fn key_event(tx: &str) -> VerificationEvent {
        VerificationEvent::Key {
            transaction_id: TransactionId::from(tx),
            key_payload: KeyPayload(vec![1, 2, 3]),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_creates_on_start() {
        let registry = SessionRegistry::new();
        let tx = TransactionId::from("tx-1");

        let handle = registry.get_or_create(&tx, &start_event("tx-1")).unwrap();
        assert_eq!(registry.len(), 1);

        let session = handle.lock().await;
        assert_eq!(session.transaction_id, tx);
        assert_eq!(session.state(), SessionState::AwaitingStart);
    }

    #[test]
    fn test_get_or_create_unknown_transaction() {
        let registry = SessionRegistry::new();
        let tx = TransactionId::from("tx-1");

        let result = registry.get_or_create(&tx, &key_event("tx-1"));
        assert_eq!(result.err(), Some(ProtocolError::UnknownTransaction(tx)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_get_or_create_returns_existing_for_follow_up() {
        let registry = SessionRegistry::new();
        let tx = TransactionId::from("tx-1");

        let first = registry.get_or_create(&tx, &start_event("tx-1")).unwrap();
        let second = registry.get_or_create(&tx, &key_event("tx-1")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_duplicate_start_is_rejected() {
        let registry = SessionRegistry::new();
        let tx = TransactionId::from("tx-1");

        let first = registry.get_or_create(&tx, &start_event("tx-1")).unwrap();
        let result = registry.get_or_create(&tx, &start_event("tx-1"));

        assert_eq!(result.err(), Some(ProtocolError::DuplicateStart(tx.clone())));
        assert!(Arc::ptr_eq(&first, &registry.find(&tx).unwrap()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_missing() {
        let registry = SessionRegistry::new();
        assert!(registry.find(&TransactionId::from("nope")).is_none());
    }

    #[tokio::test]
    async fn test_remove_requires_terminal() {
        let registry = SessionRegistry::new();
        let tx = TransactionId::from("tx-1");
        let handle = registry.get_or_create(&tx, &start_event("tx-1")).unwrap();

        assert_eq!(
            registry.remove(&tx),
            Err(ProtocolError::NotTerminal(tx.clone()))
        );
        assert_eq!(registry.len(), 1);

        handle.lock().await.cancel("done");
        registry.remove(&tx).unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_refuses_locked_session() {
        let registry = SessionRegistry::new();
        let tx = TransactionId::from("tx-1");
        let handle = registry.get_or_create(&tx, &start_event("tx-1")).unwrap();

        let mut session = handle.lock().await;
        session.cancel("done");
        assert_eq!(
            registry.remove(&tx),
            Err(ProtocolError::NotTerminal(tx.clone()))
        );
        drop(session);

        assert!(registry.remove(&tx).is_ok());
    }

    #[test]
    fn test_remove_unknown() {
        let registry = SessionRegistry::new();
        let tx = TransactionId::from("tx-9");
        assert_eq!(
            registry.remove(&tx),
            Err(ProtocolError::UnknownTransaction(tx))
        );
    }

    #[tokio::test]
    async fn test_concurrent_starts_create_one_session() {
        let registry = SessionRegistry::new();
        let tx = TransactionId::from("tx-race");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                registry.get_or_create(&tx, &start_event("tx-race")).is_ok()
            }));
        }

        let created = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        assert_eq!(created, 1);
        assert_eq!(registry.len(), 1);
    }
}

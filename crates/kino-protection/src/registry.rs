//! Registry of live session tokens

use crate::error::{Error, Result};
use crate::platform::same_handle;
use crate::token::{SessionToken, TokenId};
use bytes::Bytes;
use tracing::debug;

/// Ordered collection of live sessions, in creation order
#[derive(Debug, Default)]
pub struct SessionRegistry {
    tokens: Vec<SessionToken>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token. Rejects a second token for the same platform session.
    pub fn insert(&mut self, token: SessionToken) -> Result<()> {
        let duplicate = self
            .tokens
            .iter()
            .any(|t| t.id() == token.id() || same_handle(t.session(), token.session()));
        if duplicate {
            return Err(Error::DuplicateSession {
                session_id: token.session_id(),
            });
        }

        debug!(token = %token.id(), sessions = self.tokens.len() + 1, "Session registered");
        self.tokens.push(token);
        Ok(())
    }

    /// Remove a token. Only the first call for a given token returns it.
    pub fn remove(&mut self, id: TokenId) -> Option<SessionToken> {
        let index = self.tokens.iter().position(|t| t.id() == id)?;
        let token = self.tokens.remove(index);
        token.mark_removed();
        debug!(token = %id, sessions = self.tokens.len(), "Session removed");
        Some(token)
    }

    pub fn contains(&self, id: TokenId) -> bool {
        self.tokens.iter().any(|t| t.id() == id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Owned copy of the current tokens, safe to iterate while mutating
    pub fn snapshot(&self) -> Vec<SessionToken> {
        self.tokens.clone()
    }

    /// Init data of every registered session created from init data
    pub fn init_data(&self) -> Vec<Bytes> {
        self.tokens
            .iter()
            .filter_map(|t| t.init_data().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ProtectionEventBus;
    use crate::memory::InMemorySession;
    use crate::platform::PlatformSession;
    use crate::types::SessionType;
    use std::sync::Arc;

    fn token_for(session: Arc<InMemorySession>, init_data: Option<&'static [u8]>) -> SessionToken {
        SessionToken::new(
            session,
            init_data.map(Bytes::from_static),
            SessionType::Temporary,
            ProtectionEventBus::new(),
        )
    }

    fn new_session() -> Arc<InMemorySession> {
        Arc::new(InMemorySession::new(SessionType::Temporary))
    }

    #[test]
    fn test_insert_and_remove() {
        let mut registry = SessionRegistry::new();
        let a = token_for(new_session(), Some(b"a"));
        let b = token_for(new_session(), Some(b"b"));

        registry.insert(a.clone()).unwrap();
        registry.insert(b.clone()).unwrap();
        assert_eq!(registry.len(), 2);

        let removed = registry.remove(a.id()).unwrap();
        assert_eq!(removed, a);
        assert!(a.is_removed());
        assert!(!registry.contains(a.id()));
        assert_eq!(registry.len(), 1);

        registry.remove(b.id());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = SessionRegistry::new();
        let a = token_for(new_session(), None);
        let b = token_for(new_session(), None);
        registry.insert(a.clone()).unwrap();
        registry.insert(b).unwrap();

        assert!(registry.remove(a.id()).is_some());
        assert!(registry.remove(a.id()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_platform_session_rejected() {
        let mut registry = SessionRegistry::new();
        let session = new_session();
        registry.insert(token_for(session.clone(), None)).unwrap();

        let err = registry.insert(token_for(session, None)).unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_SESSION");
        assert_eq!(registry.len(), 1);

        let token = registry.snapshot().remove(0);
        assert!(registry.insert(token).is_err());
    }

    #[test]
    fn test_init_data_order_skips_loaded() {
        let mut registry = SessionRegistry::new();
        registry.insert(token_for(new_session(), Some(b"first"))).unwrap();
        registry.insert(token_for(new_session(), None)).unwrap();
        registry.insert(token_for(new_session(), Some(b"third"))).unwrap();

        assert_eq!(
            registry.init_data(),
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"third")]
        );
    }
}

//! Session tokens
//!
//! A [`SessionToken`] is the player-facing handle for one platform key
//! session. It owns the platform session object, the init data that spawned
//! it and the listener that translates the session's notifications into
//! [`ProtectionEvent`](crate::ProtectionEvent)s. Clones are cheap and compare
//! equal by identity.

use crate::events::ProtectionEventBus;
use crate::platform::{PlatformSession, SessionListener};
use crate::translator::SessionEventAdapter;
use crate::types::{KeyStatusMap, SessionType};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use uuid::Uuid;

/// Unique identifier for a session token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub Uuid);

impl TokenId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TokenInner {
    id: TokenId,
    session: Arc<dyn PlatformSession>,
    init_data: Option<Bytes>,
    session_type: SessionType,
    listener: Arc<dyn SessionListener>,
    removed: watch::Sender<bool>,
}

/// Handle to one content-protection session
#[derive(Clone)]
pub struct SessionToken {
    inner: Arc<TokenInner>,
}

/// Non-owning back-reference held by the token's own listener
#[derive(Clone)]
pub(crate) struct WeakSessionToken(Weak<TokenInner>);

impl WeakSessionToken {
    pub(crate) fn upgrade(&self) -> Option<SessionToken> {
        self.0.upgrade().map(|inner| SessionToken { inner })
    }
}

impl SessionToken {
    /// Wrap a platform session. Listeners are not attached yet.
    pub(crate) fn new(
        session: Arc<dyn PlatformSession>,
        init_data: Option<Bytes>,
        session_type: SessionType,
        bus: ProtectionEventBus,
    ) -> Self {
        let (removed, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|weak: &Weak<TokenInner>| {
            let adapter = SessionEventAdapter::new(WeakSessionToken(weak.clone()), bus);
            TokenInner {
                id: TokenId::new(),
                session,
                init_data,
                session_type,
                listener: Arc::new(adapter),
                removed,
            }
        });
        Self { inner }
    }

    pub fn id(&self) -> TokenId {
        self.inner.id
    }

    /// Session ID assigned by the platform
    pub fn session_id(&self) -> String {
        self.inner.session.session_id()
    }

    /// When the session's keys expire, if the platform reports a time
    pub fn expiration_time(&self) -> Option<DateTime<Utc>> {
        self.inner
            .session
            .expiration()
            .filter(|ms| ms.is_finite())
            .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
    }

    pub fn key_statuses(&self) -> KeyStatusMap {
        self.inner.session.key_statuses()
    }

    pub fn session_type(&self) -> SessionType {
        self.inner.session_type
    }

    /// Init data the session was created from; `None` for loaded sessions
    pub fn init_data(&self) -> Option<&Bytes> {
        self.inner.init_data.as_ref()
    }

    pub(crate) fn session(&self) -> &Arc<dyn PlatformSession> {
        &self.inner.session
    }

    pub(crate) fn attach_listener(&self) {
        self.inner.session.add_listener(self.inner.listener.clone());
    }

    pub(crate) fn detach_listener(&self) {
        self.inner.session.remove_listener(&self.inner.listener);
    }

    /// Flag the token as removed; returns false if it already was
    pub(crate) fn mark_removed(&self) -> bool {
        !self.inner.removed.send_replace(true)
    }

    pub fn is_removed(&self) -> bool {
        *self.inner.removed.borrow()
    }

    /// Resolves once the token has been removed from its registry
    pub async fn removed(&self) {
        let mut rx = self.inner.removed.subscribe();
        let _ = rx.wait_for(|removed| *removed).await;
    }
}

impl PartialEq for SessionToken {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SessionToken {}

impl Hash for SessionToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("id", &self.inner.id)
            .field("session_id", &self.session_id())
            .field("session_type", &self.inner.session_type)
            .field("has_init_data", &self.inner.init_data.is_some())
            .finish()
    }
}

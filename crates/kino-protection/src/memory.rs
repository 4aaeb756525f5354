//! In-memory content-protection platform
//!
//! A scriptable stand-in for a real CDM. Every platform call resolves
//! immediately according to the behavior it was configured with, and every
//! negotiation attempt is recorded, which makes it suitable for tests and
//! for offline simulation from the CLI.
//!
//! ```
//! use kino_protection::memory::{InMemoryKeyStore, InMemoryPlatform, SessionBehavior};
//! use kino_protection::KeySystem;
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryKeyStore::new().with_session_behavior(SessionBehavior {
//!     fail_close: true,
//!     ..Default::default()
//! }));
//! let platform = InMemoryPlatform::new()
//!     .with_key_store(store)
//!     .accept(KeySystem::ClearKey);
//! assert!(platform.attempts().is_empty());
//! ```

use crate::error::PlatformError;
use crate::platform::{
    ContentProtectionPlatform, KeyStore, NegotiatedAccess, PlatformResult, PlatformSession, PlaybackSurface,
    SessionListener, SessionNotification, SurfaceListener, SurfaceNotification, same_handle,
};
use crate::types::{KeyMessageType, KeyStatus, KeyStatusMap, KeySystem, KeySystemConfiguration, SessionType};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which session operations the platform rejects
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionBehavior {
    pub fail_generate_request: bool,
    pub fail_update: bool,
    pub fail_load: bool,
    pub fail_remove: bool,
    pub fail_close: bool,
    /// `close()` resolves but the closed signal waits for
    /// [`InMemorySession::signal_closed`]
    pub defer_closed: bool,
}

/// Platform that accepts a fixed set of key systems
pub struct InMemoryPlatform {
    supported: bool,
    accepted: HashSet<KeySystem>,
    report_configuration: bool,
    fail_key_store: bool,
    key_store: Arc<InMemoryKeyStore>,
    attempts: Mutex<Vec<KeySystem>>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    /// A supported platform that rejects every key system
    pub fn new() -> Self {
        Self {
            supported: true,
            accepted: HashSet::new(),
            report_configuration: true,
            fail_key_store: false,
            key_store: Arc::new(InMemoryKeyStore::new()),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn accept(mut self, key_system: KeySystem) -> Self {
        self.accepted.insert(key_system);
        self
    }

    pub fn with_key_store(mut self, key_store: Arc<InMemoryKeyStore>) -> Self {
        self.key_store = key_store;
        self
    }

    /// Report the required APIs as missing
    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    /// Negotiated access objects report no resolved configuration
    pub fn without_configuration(mut self) -> Self {
        self.report_configuration = false;
        self
    }

    pub fn fail_key_store_creation(mut self) -> Self {
        self.fail_key_store = true;
        self
    }

    /// Key systems requested so far, in order
    pub fn attempts(&self) -> Vec<KeySystem> {
        lock(&self.attempts).clone()
    }

    pub fn key_store(&self) -> Arc<InMemoryKeyStore> {
        self.key_store.clone()
    }
}

#[async_trait]
impl ContentProtectionPlatform for InMemoryPlatform {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn request_key_system_access(
        &self,
        key_system: KeySystem,
        configs: &[KeySystemConfiguration],
    ) -> PlatformResult<Arc<dyn NegotiatedAccess>> {
        lock(&self.attempts).push(key_system);

        if !self.accepted.contains(&key_system) {
            return Err(PlatformError::not_supported(format!(
                "Unsupported keySystem or supportedConfigurations: {key_system}"
            )));
        }

        let configuration = if self.report_configuration {
            configs.first().cloned()
        } else {
            None
        };
        Ok(Arc::new(InMemoryAccess {
            configuration,
            fail_key_store: self.fail_key_store,
            key_store: self.key_store.clone(),
        }))
    }
}

struct InMemoryAccess {
    configuration: Option<KeySystemConfiguration>,
    fail_key_store: bool,
    key_store: Arc<InMemoryKeyStore>,
}

#[async_trait]
impl NegotiatedAccess for InMemoryAccess {
    fn configuration(&self) -> Option<KeySystemConfiguration> {
        self.configuration.clone()
    }

    async fn create_key_store(&self) -> PlatformResult<Arc<dyn KeyStore>> {
        if self.fail_key_store {
            return Err(PlatformError::invalid_state("Could not create key store"));
        }
        Ok(self.key_store.clone())
    }
}

/// Key store that hands out [`InMemorySession`]s
pub struct InMemoryKeyStore {
    behavior: Mutex<SessionBehavior>,
    fail_certificate: bool,
    persisted: Arc<Mutex<HashSet<String>>>,
    sessions: Mutex<Vec<Arc<InMemorySession>>>,
    certificates: Mutex<Vec<Bytes>>,
}

impl Default for InMemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self {
            behavior: Mutex::new(SessionBehavior::default()),
            fail_certificate: false,
            persisted: Arc::new(Mutex::new(HashSet::new())),
            sessions: Mutex::new(Vec::new()),
            certificates: Mutex::new(Vec::new()),
        }
    }

    pub fn with_session_behavior(self, behavior: SessionBehavior) -> Self {
        *lock(&self.behavior) = behavior;
        self
    }

    pub fn fail_server_certificate(mut self) -> Self {
        self.fail_certificate = true;
        self
    }

    /// Make a persisted session loadable by ID
    pub fn with_persisted_session(self, session_id: impl Into<String>) -> Self {
        lock(&self.persisted).insert(session_id.into());
        self
    }

    /// Behavior applied to sessions created from now on
    pub fn set_session_behavior(&self, behavior: SessionBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// Every session created so far, in creation order
    pub fn sessions(&self) -> Vec<Arc<InMemorySession>> {
        lock(&self.sessions).clone()
    }

    pub fn certificates(&self) -> Vec<Bytes> {
        lock(&self.certificates).clone()
    }

    pub fn is_persisted(&self, session_id: &str) -> bool {
        lock(&self.persisted).contains(session_id)
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    fn create_session(&self, session_type: SessionType) -> PlatformResult<Arc<dyn PlatformSession>> {
        let behavior = lock(&self.behavior).clone();
        let session = Arc::new(InMemorySession::with_behavior(
            session_type,
            behavior,
            self.persisted.clone(),
        ));
        lock(&self.sessions).push(session.clone());
        Ok(session)
    }

    async fn set_server_certificate(&self, certificate: Bytes) -> PlatformResult<()> {
        if self.fail_certificate {
            return Err(PlatformError::new("TypeError", "Invalid server certificate"));
        }
        lock(&self.certificates).push(certificate);
        Ok(())
    }
}

/// Session whose outcomes follow its [`SessionBehavior`]
pub struct InMemorySession {
    session_id: Mutex<String>,
    session_type: SessionType,
    behavior: SessionBehavior,
    persisted: Arc<Mutex<HashSet<String>>>,
    expiration: Mutex<Option<f64>>,
    key_statuses: Mutex<KeyStatusMap>,
    listeners: Mutex<Vec<Arc<dyn SessionListener>>>,
    updates: Mutex<Vec<Bytes>>,
    closed: watch::Sender<bool>,
}

impl InMemorySession {
    pub fn new(session_type: SessionType) -> Self {
        Self::with_behavior(
            session_type,
            SessionBehavior::default(),
            Arc::new(Mutex::new(HashSet::new())),
        )
    }

    fn with_behavior(
        session_type: SessionType,
        behavior: SessionBehavior,
        persisted: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            session_id: Mutex::new(Uuid::new_v4().simple().to_string()),
            session_type,
            behavior,
            persisted,
            expiration: Mutex::new(None),
            key_statuses: Mutex::new(KeyStatusMap::new()),
            listeners: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            closed,
        }
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn set_expiration(&self, expiration: Option<f64>) {
        *lock(&self.expiration) = expiration;
    }

    pub fn set_key_status(&self, key_id: impl Into<Vec<u8>>, status: KeyStatus) {
        lock(&self.key_statuses).insert(key_id.into(), status);
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Responses passed to `update()`, in order
    pub fn updates(&self) -> Vec<Bytes> {
        lock(&self.updates).clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Raise a `message` notification
    pub fn emit_message(&self, message_type: KeyMessageType, message: Bytes) {
        self.notify(SessionNotification::Message {
            message,
            message_type,
        });
    }

    /// Raise a `keystatuseschange` notification
    pub fn emit_key_statuses_change(&self) {
        self.notify(SessionNotification::KeyStatusesChange);
    }

    /// Platform-side closure, e.g. hardware context loss or a completed close
    pub fn signal_closed(&self) {
        self.closed.send_replace(true);
    }

    fn notify(&self, event: SessionNotification) {
        // Snapshot so listeners may unregister while being notified
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.handle_event(event.clone());
        }
    }
}

#[async_trait]
impl PlatformSession for InMemorySession {
    fn session_id(&self) -> String {
        lock(&self.session_id).clone()
    }

    fn expiration(&self) -> Option<f64> {
        *lock(&self.expiration)
    }

    fn key_statuses(&self) -> KeyStatusMap {
        lock(&self.key_statuses).clone()
    }

    fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        lock(&self.listeners).push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn SessionListener>) {
        lock(&self.listeners).retain(|l| !same_handle(l, listener));
    }

    async fn generate_request(&self, _init_data_type: &str, init_data: Bytes) -> PlatformResult<()> {
        if self.behavior.fail_generate_request {
            return Err(PlatformError::invalid_state("generateRequest rejected"));
        }
        if self.session_type == SessionType::PersistentLicense {
            lock(&self.persisted).insert(self.session_id());
        }
        self.emit_message(KeyMessageType::LicenseRequest, init_data);
        Ok(())
    }

    async fn update(&self, response: Bytes) -> PlatformResult<()> {
        if self.behavior.fail_update {
            return Err(PlatformError::invalid_state("update rejected"));
        }
        lock(&self.updates).push(response);
        self.set_key_status(b"kid".to_vec(), KeyStatus::Usable);
        self.emit_key_statuses_change();
        Ok(())
    }

    async fn load(&self, session_id: &str) -> PlatformResult<bool> {
        if self.behavior.fail_load {
            return Err(PlatformError::invalid_state("load rejected"));
        }
        if !lock(&self.persisted).contains(session_id) {
            return Ok(false);
        }
        *lock(&self.session_id) = session_id.to_string();
        Ok(true)
    }

    async fn remove(&self) -> PlatformResult<()> {
        if self.behavior.fail_remove {
            return Err(PlatformError::invalid_state("remove rejected"));
        }
        let id = self.session_id();
        lock(&self.persisted).remove(&id);
        lock(&self.key_statuses).clear();
        Ok(())
    }

    async fn close(&self) -> PlatformResult<()> {
        if self.behavior.fail_close {
            return Err(PlatformError::invalid_state("close rejected"));
        }
        if !self.behavior.defer_closed {
            self.signal_closed();
        }
        Ok(())
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Playback surface that records its key store and raises `encrypted`
pub struct InMemorySurface {
    listeners: Mutex<Vec<Arc<dyn SurfaceListener>>>,
    key_store: Mutex<Option<Arc<dyn KeyStore>>>,
    attach_calls: Mutex<usize>,
}

impl Default for InMemorySurface {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySurface {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            key_store: Mutex::new(None),
            attach_calls: Mutex::new(0),
        }
    }

    /// Raise an `encrypted` notification
    pub fn encrypted(&self, init_data: Option<Bytes>, init_data_type: &str) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.handle_event(SurfaceNotification::Encrypted {
                init_data: init_data.clone(),
                init_data_type: init_data_type.to_string(),
            });
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn has_key_store(&self) -> bool {
        lock(&self.key_store).is_some()
    }

    /// Number of `set_key_store` calls, attach or detach
    pub fn key_store_calls(&self) -> usize {
        *lock(&self.attach_calls)
    }
}

#[async_trait]
impl PlaybackSurface for InMemorySurface {
    fn add_listener(&self, listener: Arc<dyn SurfaceListener>) {
        lock(&self.listeners).push(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn SurfaceListener>) {
        lock(&self.listeners).retain(|l| !same_handle(l, listener));
    }

    async fn set_key_store(&self, key_store: Option<Arc<dyn KeyStore>>) -> PlatformResult<()> {
        *lock(&self.attach_calls) += 1;
        *lock(&self.key_store) = key_store;
        Ok(())
    }
}

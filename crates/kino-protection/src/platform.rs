//! Host platform interfaces
//!
//! The protection model never generates keys or decrypts anything itself. It
//! drives whatever content-protection implementation the host exposes
//! through these traits: a browser's EME through bindings, a native CDM, or
//! the [`memory`](crate::memory) platform in tests.
//!
//! Every operation that crosses into the platform is `async` and resolves or
//! rejects exactly once. Notifications flow back through listener objects
//! the model registers on sessions and on the playback surface.

use crate::error::PlatformError;
use crate::types::{KeyMessageType, KeyStatusMap, KeySystem, KeySystemConfiguration, SessionType};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Result of a platform call
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Notification raised by a platform session
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// The session's key-status map changed
    KeyStatusesChange,
    /// A message must be delivered to the license server
    Message {
        message: Bytes,
        message_type: KeyMessageType,
    },
}

/// Notification raised by the playback surface
#[derive(Debug, Clone)]
pub enum SurfaceNotification {
    /// Protected content was encountered
    Encrypted {
        init_data: Option<Bytes>,
        init_data_type: String,
    },
}

/// Receives session notifications
pub trait SessionListener: Send + Sync {
    fn handle_event(&self, event: SessionNotification);
}

/// Receives playback surface notifications
pub trait SurfaceListener: Send + Sync {
    fn handle_event(&self, event: SurfaceNotification);
}

/// Entry point into the host's content-protection support
#[async_trait]
pub trait ContentProtectionPlatform: Send + Sync {
    /// Whether the host exposes the APIs the protection model needs
    fn is_supported(&self) -> bool;

    /// Ask whether `key_system` can satisfy one of `configs`
    async fn request_key_system_access(
        &self,
        key_system: KeySystem,
        configs: &[KeySystemConfiguration],
    ) -> PlatformResult<Arc<dyn NegotiatedAccess>>;
}

/// Platform object produced by a successful negotiation
#[async_trait]
pub trait NegotiatedAccess: Send + Sync {
    /// Configuration the platform resolved, when it reports one
    fn configuration(&self) -> Option<KeySystemConfiguration>;

    /// Create the key-store handle for this key system
    async fn create_key_store(&self) -> PlatformResult<Arc<dyn KeyStore>>;
}

/// Key-store handle scoped to one key system
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Create a session object; no request is generated yet
    fn create_session(&self, session_type: SessionType) -> PlatformResult<Arc<dyn PlatformSession>>;

    async fn set_server_certificate(&self, certificate: Bytes) -> PlatformResult<()>;
}

/// One platform key session
#[async_trait]
pub trait PlatformSession: Send + Sync {
    /// Empty until a request has been generated or a session loaded
    fn session_id(&self) -> String;

    /// Expiration in milliseconds since the Unix epoch, `None` if unset
    fn expiration(&self) -> Option<f64>;

    fn key_statuses(&self) -> KeyStatusMap;

    fn add_listener(&self, listener: Arc<dyn SessionListener>);

    fn remove_listener(&self, listener: &Arc<dyn SessionListener>);

    async fn generate_request(&self, init_data_type: &str, init_data: Bytes) -> PlatformResult<()>;

    async fn update(&self, response: Bytes) -> PlatformResult<()>;

    /// Resolves `false` when no persisted session has this ID
    async fn load(&self, session_id: &str) -> PlatformResult<bool>;

    async fn remove(&self) -> PlatformResult<()>;

    async fn close(&self) -> PlatformResult<()>;

    /// Resolves once the platform reports the session closed, for any reason
    async fn closed(&self);
}

/// Media element protected content flows through
#[async_trait]
pub trait PlaybackSurface: Send + Sync {
    fn add_listener(&self, listener: Arc<dyn SurfaceListener>);

    fn remove_listener(&self, listener: &Arc<dyn SurfaceListener>);

    /// Attach a key store, or detach with `None`
    async fn set_key_store(&self, key_store: Option<Arc<dyn KeyStore>>) -> PlatformResult<()>;
}

/// Identity comparison for platform handles, ignoring vtable pointers
pub(crate) fn same_handle<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

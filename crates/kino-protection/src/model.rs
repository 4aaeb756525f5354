//! Protection Model - public entry point for content protection
//!
//! Coordinates:
//! - Key-system negotiation and selection
//! - Playback surface attachment
//! - Session creation, loading, update, removal and closure
//! - Teardown of every live session
//!
//! Operations check their preconditions synchronously and return. Platform
//! work continues on spawned tasks and its outcome is published on the
//! [`ProtectionEventBus`]; nothing asynchronous is reported through the
//! return value. A tokio runtime must be running.

use crate::{
    config::ProtectionConfig,
    encoding::{SessionUpdate, UpdateEncoding},
    error::{Error, Result},
    events::{EventReceiver, KeyError, ProtectionEvent, ProtectionEventBus},
    negotiator::{KeySystemAccess, KeySystemNegotiator},
    platform::{same_handle, ContentProtectionPlatform, KeyStore, PlatformSession, PlaybackSurface, SurfaceListener},
    registry::SessionRegistry,
    teardown::{CountdownLatch, TeardownState},
    token::SessionToken,
    translator::SurfaceEventHandler,
    types::{KeySystem, KeySystemCandidate, SessionType},
};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Key-system selection progress
#[derive(Clone, Default)]
enum Selection {
    #[default]
    Unselected,
    Selecting(KeySystem),
    Selected {
        key_system: KeySystem,
        key_store: Arc<dyn KeyStore>,
    },
}

impl Selection {
    fn key_system(&self) -> Option<KeySystem> {
        match self {
            Selection::Unselected => None,
            Selection::Selecting(ks) | Selection::Selected { key_system: ks, .. } => Some(*ks),
        }
    }

    fn key_store(&self) -> Option<Arc<dyn KeyStore>> {
        match self {
            Selection::Selected { key_store, .. } => Some(key_store.clone()),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ModelState {
    selection: Selection,
    surface: Option<Arc<dyn PlaybackSurface>>,
    teardown: TeardownState,
}

struct ModelInner {
    negotiator: KeySystemNegotiator,
    config: ProtectionConfig,
    bus: ProtectionEventBus,
    surface_handler: Arc<dyn SurfaceListener>,
    /// Lock order: `state` before `registry`
    state: RwLock<ModelState>,
    registry: RwLock<SessionRegistry>,
}

/// Content-protection model for one playback pipeline
#[derive(Clone)]
pub struct ProtectionModel {
    inner: Arc<ModelInner>,
}

impl ProtectionModel {
    /// Create a model driving `platform`
    pub fn new(platform: Arc<dyn ContentProtectionPlatform>, config: ProtectionConfig) -> Self {
        let bus = ProtectionEventBus::new();
        Self {
            inner: Arc::new(ModelInner {
                negotiator: KeySystemNegotiator::new(platform),
                surface_handler: Arc::new(SurfaceEventHandler::new(bus.clone())),
                bus,
                config,
                state: RwLock::new(ModelState::default()),
                registry: RwLock::new(SessionRegistry::new()),
            }),
        }
    }

    /// Whether the host exposes the APIs this model needs
    pub fn detect(platform: &dyn ContentProtectionPlatform) -> bool {
        platform.is_supported()
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.bus.subscribe()
    }

    /// Get the event bus
    pub fn event_bus(&self) -> &ProtectionEventBus {
        &self.inner.bus
    }

    /// Get the configuration
    pub fn config(&self) -> &ProtectionConfig {
        &self.inner.config
    }

    /// Currently selected key system
    pub async fn key_system(&self) -> Option<KeySystem> {
        match &self.inner.state.read().await.selection {
            Selection::Selected { key_system, .. } => Some(*key_system),
            _ => None,
        }
    }

    /// Get current teardown state
    pub async fn teardown_state(&self) -> TeardownState {
        self.inner.state.read().await.teardown
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Live sessions in creation order
    pub async fn sessions(&self) -> Vec<SessionToken> {
        self.inner.registry.read().await.snapshot()
    }

    /// Init data of every live session, in creation order. Sessions loaded
    /// by ID have none and are skipped.
    pub async fn all_init_data(&self) -> Vec<Bytes> {
        self.inner.registry.read().await.init_data()
    }

    /// Negotiate the first acceptable candidate; the result arrives as
    /// [`ProtectionEvent::KeySystemAccessComplete`]
    #[instrument(skip(self, candidates), fields(candidates = candidates.len()))]
    pub fn request_key_system_access(&self, candidates: Vec<KeySystemCandidate>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = inner.negotiator.negotiate(&candidates).await;
            inner.bus.publish(ProtectionEvent::KeySystemAccessComplete(outcome));
        });
    }

    /// Create the key store for a negotiated key system; the result arrives
    /// as [`ProtectionEvent::KeySystemSelected`]
    #[instrument(skip(self, access), fields(key_system = %access.key_system()))]
    pub async fn select_key_system(&self, access: KeySystemAccess) -> Result<()> {
        let key_system = access.key_system();
        {
            let mut state = self.inner.state.write().await;
            if let Some(active) = state.selection.key_system() {
                return Err(Error::KeySystemAlreadySelected {
                    key_system: active.to_string(),
                });
            }
            state.selection = Selection::Selecting(key_system);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match access.handle().create_key_store().await {
                Ok(key_store) => {
                    let surface = {
                        let mut state = inner.state.write().await;
                        state.selection = Selection::Selected {
                            key_system,
                            key_store: key_store.clone(),
                        };
                        state.surface.clone()
                    };
                    if let Some(surface) = surface {
                        if let Err(error) = surface.set_key_store(Some(key_store)).await {
                            warn!(error = %error, "Failed to attach key store to playback surface");
                        }
                    }
                    info!(key_system = %key_system, "Key system selected");
                    inner.bus.publish(ProtectionEvent::KeySystemSelected(Ok(key_system)));
                }
                Err(error) => {
                    inner.state.write().await.selection = Selection::Unselected;
                    warn!(key_system = %key_system, error = %error, "Key store creation failed");
                    inner.bus.publish(ProtectionEvent::KeySystemSelected(Err(format!(
                        "Error selecting key system ({key_system})! Could not create key store -- {}",
                        error.name
                    ))));
                }
            }
        });
        Ok(())
    }

    /// Associate the playback surface, replacing any previous one. `None`
    /// only detaches.
    pub async fn set_playback_surface(&self, surface: Option<Arc<dyn PlaybackSurface>>) {
        let (previous, key_store) = {
            let mut state = self.inner.state.write().await;
            let unchanged = match (&state.surface, &surface) {
                (Some(current), Some(next)) => same_handle(current, next),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return;
            }
            let previous = std::mem::replace(&mut state.surface, surface.clone());
            (previous, state.selection.key_store())
        };

        if let Some(previous) = previous {
            debug!("Detaching playback surface");
            previous.remove_listener(&self.inner.surface_handler);
            if let Err(error) = previous.set_key_store(None).await {
                warn!(error = %error, "Failed to clear key store on previous surface");
            }
        }

        if let Some(surface) = surface {
            debug!("Attaching playback surface");
            surface.add_listener(self.inner.surface_handler.clone());
            if let Some(key_store) = key_store {
                if let Err(error) = surface.set_key_store(Some(key_store)).await {
                    warn!(error = %error, "Failed to attach key store to playback surface");
                }
            }
        }
    }

    /// Install a license server certificate; the result arrives as
    /// [`ProtectionEvent::ServerCertificateUpdated`]
    #[instrument(skip(self, certificate), fields(bytes = certificate.len()))]
    pub async fn set_server_certificate(&self, certificate: Bytes) -> Result<()> {
        let (_, key_store) = self.inner.require_key_store("set server certificate").await?;

        let bus = self.inner.bus.clone();
        tokio::spawn(async move {
            let outcome = key_store
                .set_server_certificate(certificate)
                .await
                .map_err(|error| {
                    warn!(error = %error, "Server certificate rejected");
                    format!("Error updating server certificate -- {}", error.name)
                });
            bus.publish(ProtectionEvent::ServerCertificateUpdated(outcome));
        });
        Ok(())
    }

    /// Create a session and generate its license request from `init_data`;
    /// the result arrives as [`ProtectionEvent::KeySessionCreated`]
    #[instrument(skip(self, init_data), fields(bytes = init_data.len()))]
    pub async fn create_key_session(&self, init_data: Bytes, session_type: SessionType) -> Result<()> {
        let (_, key_store) = self.inner.require_key_store("create sessions").await?;

        let session = match key_store.create_session(session_type) {
            Ok(session) => session,
            Err(error) => {
                warn!(error = %error, "Platform refused to create session");
                self.inner.bus.publish(ProtectionEvent::KeySessionCreated(Err(format!(
                    "Error creating key session -- {}",
                    error.name
                ))));
                return Ok(());
            }
        };
        let token = match self
            .inner
            .register(session.clone(), Some(init_data.clone()), session_type)
            .await
        {
            Ok(token) => token,
            Err(error) => {
                discard_session(session);
                return Err(error);
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let init_data_type = inner.config.init_data_type.clone();
            match token.session().generate_request(&init_data_type, init_data).await {
                Ok(()) => {
                    info!(session_id = %token.session_id(), session_type = %session_type, "Key session created");
                    inner.bus.publish(ProtectionEvent::KeySessionCreated(Ok(token)));
                }
                Err(error) => {
                    // Never became a usable session
                    inner.registry.write().await.remove(token.id());
                    token.detach_listener();
                    warn!(error = %error, "Key request generation failed");
                    inner.bus.publish(ProtectionEvent::KeySessionCreated(Err(format!(
                        "Error generating key request -- {}",
                        error.name
                    ))));
                }
            }
        });
        Ok(())
    }

    /// Pass a license server response to the session. Failures arrive as
    /// [`ProtectionEvent::KeyError`]; the session stays registered.
    #[instrument(skip(self, token, update), fields(session_id = %token.session_id()))]
    pub async fn update_key_session(&self, token: &SessionToken, update: impl Into<SessionUpdate>) -> Result<()> {
        let (key_system, _) = self.inner.require_key_store("update sessions").await?;
        let update = update.into();
        let token = token.clone();
        let bus = self.inner.bus.clone();

        tokio::spawn(async move {
            let outcome = match UpdateEncoding::for_key_system(key_system).encode(key_system, &update) {
                Ok(message) => token
                    .session()
                    .update(message)
                    .await
                    .map_err(|error| format!("Error sending update() message! {}", error.name)),
                Err(error) => Err(format!("Error sending update() message! {error}")),
            };
            if let Err(error) = outcome {
                warn!(session_id = %token.session_id(), error = %error, "Session update failed");
                bus.publish(ProtectionEvent::KeyError(KeyError { session: token, error }));
            }
        });
        Ok(())
    }

    /// Load a persisted session by ID; the result arrives as
    /// [`ProtectionEvent::KeySessionCreated`]
    #[instrument(skip(self))]
    pub async fn load_key_session(&self, session_id: &str) -> Result<()> {
        let (_, key_store) = self.inner.require_key_store("load sessions").await?;
        let session_type = self.inner.config.load_session_type;

        let session = match key_store.create_session(session_type) {
            Ok(session) => session,
            Err(error) => {
                warn!(error = %error, "Platform refused to create session");
                self.inner.bus.publish(ProtectionEvent::KeySessionCreated(Err(format!(
                    "Could not load session ({session_id})! {}",
                    error.name
                ))));
                return Ok(());
            }
        };

        let inner = self.inner.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let outcome = match session.load(&session_id).await {
                Ok(true) => match inner.register(session.clone(), None, session_type).await {
                    Ok(token) => Ok(token),
                    Err(error) => {
                        discard_session(session);
                        Err(format!("Could not load session ({session_id})! {error}"))
                    }
                },
                Ok(false) => Err(format!("Could not load session! Invalid Session ID ({session_id})")),
                Err(error) => Err(format!("Could not load session ({session_id})! {}", error.name)),
            };
            match &outcome {
                Ok(token) => info!(session_id = %token.session_id(), "Key session loaded"),
                Err(error) => warn!(error = %error, "Key session load failed"),
            }
            inner.bus.publish(ProtectionEvent::KeySessionCreated(outcome));
        });
        Ok(())
    }

    /// Remove the session's persisted state; the result arrives as
    /// [`ProtectionEvent::KeySessionRemoved`]. The token stays registered.
    #[instrument(skip(self, token), fields(session_id = %token.session_id()))]
    pub async fn remove_key_session(&self, token: &SessionToken) -> Result<()> {
        self.inner.require_key_store("remove sessions").await?;
        let token = token.clone();
        let bus = self.inner.bus.clone();

        tokio::spawn(async move {
            let session_id = token.session_id();
            let outcome = match token.session().remove().await {
                Ok(()) => Ok(session_id),
                Err(error) => {
                    warn!(session_id = %session_id, error = %error, "Session removal failed");
                    Err(format!("Error removing session ({session_id}). {}", error.name))
                }
            };
            bus.publish(ProtectionEvent::KeySessionRemoved(outcome));
        });
        Ok(())
    }

    /// Ask the platform to close the session. The token is removed when the
    /// platform reports closure, or at once if the close request fails.
    #[instrument(skip(self, token), fields(session_id = %token.session_id()))]
    pub async fn close_key_session(&self, token: &SessionToken) -> Result<()> {
        self.inner.require_key_store("close sessions").await?;
        let token = token.clone();
        let inner = self.inner.clone();

        tokio::spawn(async move {
            if let Err(error) = inner.close_session(&token).await {
                inner.registry.write().await.remove(token.id());
                let session_id = token.session_id();
                warn!(session_id = %session_id, error = %error, "Session close failed");
                inner.bus.publish(ProtectionEvent::KeySessionClosed(Err(format!(
                    "Error closing session ({session_id}) {}",
                    error.name
                ))));
            }
        });
        Ok(())
    }

    /// Close every session, then detach the playback surface and release
    /// the key store. [`ProtectionEvent::TeardownComplete`] is published
    /// once, after the last session is gone; with no sessions it is
    /// published before this returns.
    #[instrument(skip(self))]
    pub async fn teardown(&self) -> Result<()> {
        let tokens = {
            let mut state = self.inner.state.write().await;
            if !state.teardown.can_transition_to(TeardownState::Draining) {
                return Err(Error::TeardownInProgress);
            }
            state.teardown = TeardownState::Draining;
            self.inner.registry.read().await.snapshot()
        };

        info!(sessions = tokens.len(), "Teardown started");
        if tokens.is_empty() {
            self.inner.finish_teardown().await;
            return Ok(());
        }

        let latch = Arc::new(CountdownLatch::new(tokens.len()));
        for token in tokens {
            let inner = self.inner.clone();
            let latch = latch.clone();
            tokio::spawn(async move {
                match inner.close_session(&token).await {
                    // Removal happens when the closed watcher sees the signal
                    Ok(()) => token.removed().await,
                    Err(error) => {
                        debug!(session_id = %token.session_id(), error = %error, "Close failed during teardown");
                        inner.registry.write().await.remove(token.id());
                    }
                }
                if latch.arrive() {
                    inner.finish_teardown().await;
                } else {
                    debug!(pending = latch.remaining(), "Session drained");
                }
            });
        }
        Ok(())
    }
}

impl ModelInner {
    async fn require_key_store(&self, operation: &'static str) -> Result<(KeySystem, Arc<dyn KeyStore>)> {
        let state = self.state.read().await;
        if state.teardown == TeardownState::Draining {
            return Err(Error::TeardownInProgress);
        }
        match &state.selection {
            Selection::Selected { key_system, key_store } => Ok((*key_system, key_store.clone())),
            _ => Err(Error::not_selected(operation)),
        }
    }

    /// Wrap a platform session in a token, register it and watch for closure.
    ///
    /// The state read guard is held across the insert, so a session is
    /// either in the teardown snapshot or refused here.
    async fn register(
        self: &Arc<Self>,
        session: Arc<dyn PlatformSession>,
        init_data: Option<Bytes>,
        session_type: SessionType,
    ) -> Result<SessionToken> {
        let state = self.state.read().await;
        if state.teardown == TeardownState::Draining {
            return Err(Error::TeardownInProgress);
        }
        if !matches!(state.selection, Selection::Selected { .. }) {
            return Err(Error::not_selected("register sessions"));
        }

        let token = SessionToken::new(session, init_data, session_type, self.bus.clone());
        self.registry.write().await.insert(token.clone())?;
        drop(state);
        token.attach_listener();
        spawn_closed_watcher(Arc::downgrade(self), token.clone());
        Ok(token)
    }

    async fn close_session(&self, token: &SessionToken) -> crate::platform::PlatformResult<()> {
        token.detach_listener();
        token.session().close().await
    }

    async fn finish_teardown(&self) {
        let surface = {
            let mut state = self.state.write().await;
            if !self.registry.read().await.is_empty() {
                warn!("Teardown finishing with sessions still registered");
            }
            state.selection = Selection::Unselected;
            state.teardown = TeardownState::Complete;
            state.surface.take()
        };

        if let Some(surface) = surface {
            surface.remove_listener(&self.surface_handler);
            if let Err(error) = surface.set_key_store(None).await {
                warn!(error = %error, "Failed to clear key store during teardown");
            }
        }

        info!("Teardown complete");
        self.bus.publish(ProtectionEvent::TeardownComplete);
    }
}

/// Close a platform session that never made it into the registry
fn discard_session(session: Arc<dyn PlatformSession>) {
    tokio::spawn(async move {
        if let Err(error) = session.close().await {
            debug!(error = %error, "Failed to close discarded session");
        }
    });
}

/// Remove the token when the platform reports its session closed. Exits
/// quietly if the token is removed some other way first.
fn spawn_closed_watcher(inner: Weak<ModelInner>, token: SessionToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.session().closed() => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                // Publish before removal so teardown, which waits on removal,
                // completes after this session's closed event
                let mut registry = inner.registry.write().await;
                if registry.contains(token.id()) {
                    token.detach_listener();
                    let session_id = token.session_id();
                    info!(session_id = %session_id, "Key session closed");
                    inner.bus.publish(ProtectionEvent::KeySessionClosed(Ok(session_id)));
                    registry.remove(token.id());
                }
            }
            _ = token.removed() => {}
        }
    });
}

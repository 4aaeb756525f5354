//! Platform notification translation
//!
//! Maps surface and session notifications onto [`ProtectionEvent`]s.
//! Pure mapping: no retries, no state beyond the owning token.

use crate::events::{KeyMessage, NeedKey, ProtectionEvent, ProtectionEventBus};
use crate::platform::{SessionListener, SessionNotification, SurfaceListener, SurfaceNotification};
use crate::token::WeakSessionToken;
use tracing::debug;

/// Listener registered on the playback surface
pub struct SurfaceEventHandler {
    bus: ProtectionEventBus,
}

impl SurfaceEventHandler {
    pub fn new(bus: ProtectionEventBus) -> Self {
        Self { bus }
    }
}

impl SurfaceListener for SurfaceEventHandler {
    fn handle_event(&self, event: SurfaceNotification) {
        match event {
            SurfaceNotification::Encrypted {
                init_data: Some(init_data),
                init_data_type,
            } => {
                debug!(init_data_type = %init_data_type, bytes = init_data.len(), "Encrypted content encountered");
                self.bus.publish(ProtectionEvent::NeedKey(NeedKey {
                    init_data,
                    init_data_type,
                }));
            }
            SurfaceNotification::Encrypted { init_data: None, .. } => {
                debug!("Ignoring encrypted notification without init data");
            }
        }
    }
}

/// Listener a [`SessionToken`](crate::SessionToken) registers on its own
/// platform session
pub(crate) struct SessionEventAdapter {
    token: WeakSessionToken,
    bus: ProtectionEventBus,
}

impl SessionEventAdapter {
    pub(crate) fn new(token: WeakSessionToken, bus: ProtectionEventBus) -> Self {
        Self { token, bus }
    }
}

impl SessionListener for SessionEventAdapter {
    fn handle_event(&self, event: SessionNotification) {
        // Token already dropped: nobody can act on the event
        let Some(session) = self.token.upgrade() else {
            return;
        };

        let event = match event {
            SessionNotification::KeyStatusesChange => ProtectionEvent::KeyStatusesChanged(session),
            SessionNotification::Message {
                message,
                message_type,
            } => ProtectionEvent::KeyMessage(KeyMessage {
                session,
                message,
                message_type,
            }),
        };
        self.bus.publish(event);
    }
}

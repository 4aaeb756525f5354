//! Protection events and the bus they are published on
//!
//! The model only publishes. Consumers (the license controller, the
//! player's protection controller, tests) subscribe and react; nothing in
//! the model depends on who is listening.

use crate::negotiator::KeySystemAccess;
use crate::token::SessionToken;
use crate::types::{KeyMessageType, KeySystem};
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::trace;

/// Success payload or human-readable diagnostic
pub type Outcome<T> = std::result::Result<T, String>;

/// Receiving end of one subscription
pub type EventReceiver = mpsc::UnboundedReceiver<ProtectionEvent>;

/// Protected content was encountered on the playback surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeedKey {
    pub init_data: Bytes,
    pub init_data_type: String,
}

/// Message the session needs delivered to a license server
#[derive(Debug, Clone)]
pub struct KeyMessage {
    pub session: SessionToken,
    pub message: Bytes,
    pub message_type: KeyMessageType,
}

/// Failure scoped to one session
#[derive(Debug, Clone)]
pub struct KeyError {
    pub session: SessionToken,
    pub error: String,
}

/// Everything the protection model reports to the rest of the player
#[derive(Debug, Clone)]
pub enum ProtectionEvent {
    /// Negotiation finished
    KeySystemAccessComplete(Outcome<KeySystemAccess>),
    /// Key-store creation for the chosen system finished
    KeySystemSelected(Outcome<KeySystem>),
    NeedKey(NeedKey),
    KeyMessage(KeyMessage),
    KeyStatusesChanged(SessionToken),
    KeyError(KeyError),
    /// A session was created or loaded
    KeySessionCreated(Outcome<SessionToken>),
    /// Persisted state removed; carries the session ID
    KeySessionRemoved(Outcome<String>),
    /// Session closed; carries the session ID
    KeySessionClosed(Outcome<String>),
    ServerCertificateUpdated(Outcome<()>),
    TeardownComplete,
}

impl ProtectionEvent {
    /// Stable topic name for routing and logs
    pub fn topic(&self) -> &'static str {
        match self {
            ProtectionEvent::KeySystemAccessComplete(_) => "key_system_access_complete",
            ProtectionEvent::KeySystemSelected(_) => "key_system_selected",
            ProtectionEvent::NeedKey(_) => "need_key",
            ProtectionEvent::KeyMessage(_) => "key_message",
            ProtectionEvent::KeyStatusesChanged(_) => "key_statuses_changed",
            ProtectionEvent::KeyError(_) => "key_error",
            ProtectionEvent::KeySessionCreated(_) => "key_session_created",
            ProtectionEvent::KeySessionRemoved(_) => "key_session_removed",
            ProtectionEvent::KeySessionClosed(_) => "key_session_closed",
            ProtectionEvent::ServerCertificateUpdated(_) => "server_certificate_updated",
            ProtectionEvent::TeardownComplete => "teardown_complete",
        }
    }

    /// Diagnostic carried by a failure event
    pub fn error(&self) -> Option<&str> {
        match self {
            ProtectionEvent::KeySystemAccessComplete(Err(e))
            | ProtectionEvent::KeySystemSelected(Err(e))
            | ProtectionEvent::KeySessionCreated(Err(e))
            | ProtectionEvent::KeySessionRemoved(Err(e))
            | ProtectionEvent::KeySessionClosed(Err(e))
            | ProtectionEvent::ServerCertificateUpdated(Err(e)) => Some(e),
            ProtectionEvent::KeyError(err) => Some(&err.error),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }
}

impl std::fmt::Display for ProtectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.topic())?;
        if let Some(error) = self.error() {
            return write!(f, " error=\"{error}\"");
        }
        match self {
            ProtectionEvent::KeySystemAccessComplete(Ok(access)) => {
                write!(f, " key_system={}", access.key_system())
            }
            ProtectionEvent::KeySystemSelected(Ok(ks)) => write!(f, " key_system={ks}"),
            ProtectionEvent::NeedKey(need) => write!(
                f,
                " init_data_type={} bytes={}",
                need.init_data_type,
                need.init_data.len()
            ),
            ProtectionEvent::KeyMessage(msg) => write!(
                f,
                " session={} message_type={} bytes={}",
                msg.session.session_id(),
                msg.message_type,
                msg.message.len()
            ),
            ProtectionEvent::KeyStatusesChanged(token)
            | ProtectionEvent::KeySessionCreated(Ok(token)) => {
                write!(f, " session={}", token.session_id())
            }
            ProtectionEvent::KeySessionRemoved(Ok(id)) | ProtectionEvent::KeySessionClosed(Ok(id)) => {
                write!(f, " session={id}")
            }
            _ => Ok(()),
        }
    }
}

/// Publish/subscribe channel for [`ProtectionEvent`]s
///
/// Every subscriber gets its own unbounded queue, so a slow consumer never
/// loses events. Cloning the bus shares the subscriber list.
#[derive(Clone, Debug, Default)]
pub struct ProtectionEventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ProtectionEvent>>>>,
}

impl ProtectionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to every live subscriber. Returns how many got it.
    pub fn publish(&self, event: ProtectionEvent) -> usize {
        trace!(topic = event.topic(), "Publishing protection event");
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        // Dropped receivers are pruned here
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Open a new subscription; it sees every event published from now on
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Subscribers whose receiver is still alive
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

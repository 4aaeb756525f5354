//! Kino Protection - content-protection session management for Kino
//!
//! This crate orchestrates DRM key sessions for the player:
//! - Key-system negotiation with ordered fallback
//! - Key-store selection and playback surface attachment
//! - Session creation, loading, update, removal and closure
//! - Translation of platform notifications into player events
//! - Coordinated teardown of every live session
//!
//! It never touches key material itself; the host platform (EME, a native
//! CDM, or the in-memory [`memory`] platform) does that.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Protection Model                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Key-System  │  │   Session    │  │   Teardown   │          │
//! │  │  Negotiator  │  │   Registry   │  │ Coordinator  │          │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘          │
//! │         │                 │                 │                   │
//! │         │          ┌──────┴──────┐          │                   │
//! │         │          │   Session   │          │                   │
//! │         │          │   Tokens    │          │                   │
//! │         │          └──────┬──────┘          │                   │
//! │         │                 │                 │                   │
//! │  ┌──────┴───────┐  ┌──────┴──────┐  ┌──────┴───────┐           │
//! │  │   Platform   │  │    Event    │  │    Event     │           │
//! │  │   (traits)   │  │ Translator  │  │     Bus      │           │
//! │  └──────────────┘  └─────────────┘  └──────────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod encoding;
pub mod error;
pub mod events;
pub mod memory;
pub mod model;
pub mod negotiator;
pub mod platform;
pub mod registry;
pub mod teardown;
pub mod token;
pub mod translator;
pub mod types;

pub use config::ProtectionConfig;
pub use encoding::{ClearKeyKey, ClearKeyKeySet, SessionUpdate, UpdateEncoding};
pub use error::{Error, PlatformError, Result};
pub use events::{EventReceiver, KeyError, KeyMessage, NeedKey, Outcome, ProtectionEvent, ProtectionEventBus};
pub use model::ProtectionModel;
pub use negotiator::{KeySystemAccess, KeySystemNegotiator};
pub use platform::{
    ContentProtectionPlatform, KeyStore, NegotiatedAccess, PlatformResult, PlatformSession, PlaybackSurface,
    SessionListener, SessionNotification, SurfaceListener, SurfaceNotification,
};
pub use registry::SessionRegistry;
pub use teardown::TeardownState;
pub use token::{SessionToken, TokenId};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log library initialization
pub fn init() {
    tracing::info!(version = VERSION, "Kino Protection initialized");
}

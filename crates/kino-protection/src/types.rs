//! Core types for Kino Protection

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::Error;

/// Content-protection systems known to the player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeySystem {
    #[serde(rename = "com.widevine.alpha")]
    Widevine,
    #[serde(rename = "com.microsoft.playready")]
    PlayReady,
    #[serde(rename = "com.apple.fps.1_0")]
    FairPlay,
    #[serde(rename = "org.w3.clearkey")]
    ClearKey,
}

impl KeySystem {
    pub const ALL: [KeySystem; 4] = [
        KeySystem::Widevine,
        KeySystem::PlayReady,
        KeySystem::FairPlay,
        KeySystem::ClearKey,
    ];

    /// Returns the reverse-domain identifier the platform negotiates with
    pub fn system_string(&self) -> &'static str {
        match self {
            KeySystem::Widevine => "com.widevine.alpha",
            KeySystem::PlayReady => "com.microsoft.playready",
            KeySystem::FairPlay => "com.apple.fps.1_0",
            KeySystem::ClearKey => "org.w3.clearkey",
        }
    }

    /// Returns the system ID (UUID) for PSSH box
    pub fn system_id(&self) -> &'static str {
        match self {
            KeySystem::Widevine => "edef8ba9-79d6-4ace-a3c8-27dcd51d21ed",
            KeySystem::PlayReady => "9a04f079-9840-4286-ab92-e65be0885f95",
            KeySystem::FairPlay => "94ce86fb-07ff-4f43-adb8-93d2fa968ca2",
            KeySystem::ClearKey => "1077efec-c0b2-4d02-ace3-3c1e52e2fb4b",
        }
    }

    pub fn is_clear_key(&self) -> bool {
        matches!(self, KeySystem::ClearKey)
    }
}

impl std::fmt::Display for KeySystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.system_string())
    }
}

impl FromStr for KeySystem {
    type Err = Error;

    /// Accepts the system string, the PSSH system ID or a short name
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        KeySystem::ALL
            .into_iter()
            .find(|ks| {
                needle == ks.system_string()
                    || needle == ks.system_id()
                    || needle == format!("{:?}", ks).to_lowercase()
            })
            .ok_or_else(|| Error::InvalidConfig(format!("unknown key system: {s}")))
    }
}

/// Lifetime class of a key session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    #[default]
    Temporary,
    PersistentLicense,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Temporary => "temporary",
            SessionType::PersistentLicense => "persistent-license",
        }
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a configuration feature is needed, tolerated or refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Requirement {
    Required,
    #[default]
    Optional,
    NotAllowed,
}

/// One acceptable codec/robustness pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCapability {
    /// MIME type with codecs, e.g. `video/mp4; codecs="avc1.4d401e"`
    pub content_type: String,
    /// Key-system specific robustness level, empty when unconstrained
    #[serde(default)]
    pub robustness: String,
}

impl MediaCapability {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            robustness: String::new(),
        }
    }

    pub fn with_robustness(mut self, robustness: impl Into<String>) -> Self {
        self.robustness = robustness.into();
        self
    }
}

/// Constraints a key system must satisfy for the content to play
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySystemConfiguration {
    pub init_data_types: Vec<String>,
    pub audio_capabilities: Vec<MediaCapability>,
    pub video_capabilities: Vec<MediaCapability>,
    pub distinctive_identifier: Requirement,
    pub persistent_state: Requirement,
    pub session_types: Vec<SessionType>,
}

impl Default for KeySystemConfiguration {
    fn default() -> Self {
        Self {
            init_data_types: vec!["cenc".to_string()],
            audio_capabilities: Vec::new(),
            video_capabilities: Vec::new(),
            distinctive_identifier: Requirement::Optional,
            persistent_state: Requirement::Optional,
            session_types: vec![SessionType::Temporary],
        }
    }
}

impl KeySystemConfiguration {
    pub fn with_audio(mut self, capability: MediaCapability) -> Self {
        self.audio_capabilities.push(capability);
        self
    }

    pub fn with_video(mut self, capability: MediaCapability) -> Self {
        self.video_capabilities.push(capability);
        self
    }

    /// Allow persistent-license sessions, which requires persistent state
    pub fn with_persistent_license(mut self) -> Self {
        if !self.session_types.contains(&SessionType::PersistentLicense) {
            self.session_types.push(SessionType::PersistentLicense);
        }
        self.persistent_state = Requirement::Required;
        self
    }
}

/// A key system together with the configurations it is asked to satisfy,
/// in preference order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySystemCandidate {
    pub key_system: KeySystem,
    #[serde(default)]
    pub configs: Vec<KeySystemConfiguration>,
}

impl KeySystemCandidate {
    pub fn new(key_system: KeySystem, configs: Vec<KeySystemConfiguration>) -> Self {
        Self { key_system, configs }
    }
}

/// Usability of one key within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
}

/// Key ID to status, as last reported by the platform
pub type KeyStatusMap = BTreeMap<Vec<u8>, KeyStatus>;

/// Purpose of an outbound key message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyMessageType {
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

impl std::fmt::Display for KeyMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyMessageType::LicenseRequest => "license-request",
            KeyMessageType::LicenseRenewal => "license-renewal",
            KeyMessageType::LicenseRelease => "license-release",
            KeyMessageType::IndividualizationRequest => "individualization-request",
        };
        f.write_str(s)
    }
}

//! License response encoding per key system
//!
//! Most key systems take the license server's response verbatim. ClearKey
//! takes a JSON Web Key set, so key material handed over as a
//! [`ClearKeyKeySet`] is serialized before it reaches the session.

use crate::error::{Error, Result};
use crate::types::{KeySystem, SessionType};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One ClearKey key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearKeyKey {
    pub key_id: Vec<u8>,
    pub key: Vec<u8>,
}

impl ClearKeyKey {
    pub fn new(key_id: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id: key_id.into(),
            key: key.into(),
        }
    }
}

/// Keys to install into a ClearKey session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearKeyKeySet {
    pub keys: Vec<ClearKeyKey>,
    pub session_type: SessionType,
}

#[derive(Serialize, Deserialize)]
struct Jwk {
    kty: String,
    kid: String,
    k: String,
}

#[derive(Serialize, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
    #[serde(rename = "type")]
    session_type: SessionType,
}

impl ClearKeyKeySet {
    pub fn new(keys: Vec<ClearKeyKey>) -> Self {
        Self {
            keys,
            session_type: SessionType::Temporary,
        }
    }

    pub fn with_session_type(mut self, session_type: SessionType) -> Self {
        self.session_type = session_type;
        self
    }

    /// Serialize as a JWK set with base64url key IDs and keys
    pub fn to_jwk(&self) -> Result<Bytes> {
        let set = JwkSet {
            keys: self
                .keys
                .iter()
                .map(|k| Jwk {
                    kty: "oct".to_string(),
                    kid: URL_SAFE_NO_PAD.encode(&k.key_id),
                    k: URL_SAFE_NO_PAD.encode(&k.key),
                })
                .collect(),
            session_type: self.session_type,
        };
        Ok(Bytes::from(serde_json::to_vec(&set)?))
    }
}

/// Response handed to [`ProtectionModel::update_key_session`](crate::ProtectionModel::update_key_session)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// Bytes exactly as the license server returned them
    Raw(Bytes),
    /// ClearKey key material
    ClearKeyKeys(ClearKeyKeySet),
}

impl From<Bytes> for SessionUpdate {
    fn from(bytes: Bytes) -> Self {
        SessionUpdate::Raw(bytes)
    }
}

impl From<ClearKeyKeySet> for SessionUpdate {
    fn from(set: ClearKeyKeySet) -> Self {
        SessionUpdate::ClearKeyKeys(set)
    }
}

/// How updates are encoded for the active key system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEncoding {
    Passthrough,
    ClearKeyJwk,
}

impl UpdateEncoding {
    pub fn for_key_system(key_system: KeySystem) -> Self {
        if key_system.is_clear_key() {
            UpdateEncoding::ClearKeyJwk
        } else {
            UpdateEncoding::Passthrough
        }
    }

    pub fn encode(&self, key_system: KeySystem, update: &SessionUpdate) -> Result<Bytes> {
        match (self, update) {
            (_, SessionUpdate::Raw(bytes)) => Ok(bytes.clone()),
            (UpdateEncoding::ClearKeyJwk, SessionUpdate::ClearKeyKeys(set)) => set.to_jwk(),
            (UpdateEncoding::Passthrough, SessionUpdate::ClearKeyKeys(_)) => Err(Error::UnsupportedUpdate {
                key_system: key_system.to_string(),
            }),
        }
    }
}

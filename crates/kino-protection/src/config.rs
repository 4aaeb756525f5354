//! Protection model configuration

use crate::error::{Error, Result};
use crate::types::{KeySystemCandidate, SessionType};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings for a [`ProtectionModel`](crate::ProtectionModel)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Init data type passed when generating key requests
    pub init_data_type: String,
    /// Session type used when loading persisted sessions by ID
    pub load_session_type: SessionType,
    /// Key systems to negotiate, most preferred first
    pub candidates: Vec<KeySystemCandidate>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            init_data_type: "cenc".to_string(),
            load_session_type: SessionType::PersistentLicense,
            candidates: Vec::new(),
        }
    }
}

impl ProtectionConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ProtectionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.init_data_type.trim().is_empty() {
            return Err(Error::InvalidConfig("init_data_type must not be empty".into()));
        }
        Ok(())
    }

    pub fn with_candidates(mut self, candidates: Vec<KeySystemCandidate>) -> Self {
        self.candidates = candidates;
        self
    }
}

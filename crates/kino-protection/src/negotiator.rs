//! Key-system negotiation
//!
//! Candidates are tried strictly in the order given, one platform request in
//! flight at a time. The first acceptance wins; if every candidate is
//! rejected a single failure is reported.

use crate::events::Outcome;
use crate::platform::{ContentProtectionPlatform, NegotiatedAccess};
use crate::types::{KeySystem, KeySystemCandidate, KeySystemConfiguration};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Diagnostic reported when no candidate is accepted
pub const ACCESS_DENIED: &str = "Key system access denied!";

/// A key system the platform agreed to support
#[derive(Clone)]
pub struct KeySystemAccess {
    key_system: KeySystem,
    configuration: Option<KeySystemConfiguration>,
    handle: Arc<dyn NegotiatedAccess>,
}

impl KeySystemAccess {
    pub fn new(key_system: KeySystem, handle: Arc<dyn NegotiatedAccess>) -> Self {
        Self {
            key_system,
            configuration: handle.configuration(),
            handle,
        }
    }

    pub fn key_system(&self) -> KeySystem {
        self.key_system
    }

    /// Configuration the platform resolved, if it reports one
    pub fn configuration(&self) -> Option<&KeySystemConfiguration> {
        self.configuration.as_ref()
    }

    pub(crate) fn handle(&self) -> &Arc<dyn NegotiatedAccess> {
        &self.handle
    }
}

impl std::fmt::Debug for KeySystemAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySystemAccess")
            .field("key_system", &self.key_system)
            .field("configuration", &self.configuration)
            .finish_non_exhaustive()
    }
}

enum Step {
    Trying(usize),
    Succeeded(KeySystemAccess),
    Exhausted,
}

/// Runs the fallback cascade against the platform
#[derive(Clone)]
pub struct KeySystemNegotiator {
    platform: Arc<dyn ContentProtectionPlatform>,
}

impl KeySystemNegotiator {
    pub fn new(platform: Arc<dyn ContentProtectionPlatform>) -> Self {
        Self { platform }
    }

    /// Negotiate the first acceptable candidate
    pub async fn negotiate(&self, candidates: &[KeySystemCandidate]) -> Outcome<KeySystemAccess> {
        let mut step = Step::Trying(0);
        loop {
            step = match step {
                Step::Trying(index) => match candidates.get(index) {
                    Some(candidate) => self.attempt(index, candidate).await,
                    None => Step::Exhausted,
                },
                Step::Succeeded(access) => {
                    info!(key_system = %access.key_system(), "Key system access granted");
                    return Ok(access);
                }
                Step::Exhausted => {
                    warn!(candidates = candidates.len(), "{}", ACCESS_DENIED);
                    return Err(ACCESS_DENIED.to_string());
                }
            };
        }
    }

    async fn attempt(&self, index: usize, candidate: &KeySystemCandidate) -> Step {
        debug!(attempt = index, key_system = %candidate.key_system, "Requesting key system access");
        match self
            .platform
            .request_key_system_access(candidate.key_system, &candidate.configs)
            .await
        {
            Ok(handle) => Step::Succeeded(KeySystemAccess::new(candidate.key_system, handle)),
            Err(error) => {
                debug!(attempt = index, key_system = %candidate.key_system, error = %error, "Key system rejected");
                Step::Trying(index + 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPlatform;

    fn candidates(systems: &[KeySystem]) -> Vec<KeySystemCandidate> {
        systems
            .iter()
            .map(|ks| KeySystemCandidate::new(*ks, vec![KeySystemConfiguration::default()]))
            .collect()
    }

    #[tokio::test]
    async fn test_first_accepted_wins() {
        let platform = Arc::new(InMemoryPlatform::new().accept(KeySystem::PlayReady));
        let negotiator = KeySystemNegotiator::new(platform.clone());

        let access = negotiator
            .negotiate(&candidates(&[KeySystem::Widevine, KeySystem::PlayReady, KeySystem::ClearKey]))
            .await
            .unwrap();

        assert_eq!(access.key_system(), KeySystem::PlayReady);
        assert_eq!(platform.attempts(), vec![KeySystem::Widevine, KeySystem::PlayReady]);
    }

    #[tokio::test]
    async fn test_all_rejected_tries_each_once() {
        let platform = Arc::new(InMemoryPlatform::new());
        let negotiator = KeySystemNegotiator::new(platform.clone());
        let list = [KeySystem::Widevine, KeySystem::FairPlay, KeySystem::ClearKey];

        let err = negotiator.negotiate(&candidates(&list)).await.unwrap_err();

        assert_eq!(err, ACCESS_DENIED);
        assert_eq!(platform.attempts(), list.to_vec());
    }

    #[tokio::test]
    async fn test_empty_candidates_exhausted() {
        let platform = Arc::new(InMemoryPlatform::new().accept(KeySystem::ClearKey));
        let negotiator = KeySystemNegotiator::new(platform.clone());

        assert!(negotiator.negotiate(&[]).await.is_err());
        assert!(platform.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_resolved_configuration_reported() {
        let platform = Arc::new(InMemoryPlatform::new().accept(KeySystem::ClearKey));
        let negotiator = KeySystemNegotiator::new(platform);

        let access = negotiator
            .negotiate(&candidates(&[KeySystem::ClearKey]))
            .await
            .unwrap();
        assert_eq!(access.configuration(), Some(&KeySystemConfiguration::default()));
    }
}

//! Sync Configuration
//!
//! Tunables for the sync agent plus the authentication gate every network
//! operation checks first.

use crate::envelope::Timestamp;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_chunk must be at least 1")]
    ZeroChunk,

    #[error("max_resubmit_depth must be at least 1")]
    ZeroResubmitDepth,

    #[error("fetch_timeout must be non-zero")]
    ZeroFetchTimeout,
}

/// Configuration for a [`crate::agent::SyncAgent`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Debounce window for non-urgent pushes scheduled via `save_later`.
    pub debounce: Duration,
    /// Bound on single-object fetches during conflict resolution.
    pub fetch_timeout: Duration,
    /// Maximum number of envelopes per batch save.
    pub max_chunk: usize,
    /// How many times a rejected push may be resolved and resubmitted.
    pub max_resubmit_depth: u32,
    /// Seed for the delta-sync watermark, usually restored from the host
    /// application's persistence.
    pub last_received_at: Option<Timestamp>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(30),
            max_chunk: 1000,
            max_resubmit_depth: 3,
            last_received_at: None,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    pub fn with_max_resubmit_depth(mut self, depth: u32) -> Self {
        self.max_resubmit_depth = depth;
        self
    }

    pub fn with_last_received_at(mut self, watermark: Option<Timestamp>) -> Self {
        self.last_received_at = watermark;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk == 0 {
            return Err(ConfigError::ZeroChunk);
        }
        if self.max_resubmit_depth == 0 {
            return Err(ConfigError::ZeroResubmitDepth);
        }
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::ZeroFetchTimeout);
        }
        Ok(())
    }
}

/// Authentication gate.
///
/// The engine never manages tokens; the host flips this flag when its auth
/// session opens or closes, and every network operation checks it first.
#[derive(Debug, Default)]
pub struct AuthState {
    authenticated: AtomicBool,
}

impl AuthState {
    pub fn new(authenticated: bool) -> Self {
        Self {
            authenticated: AtomicBool::new(authenticated),
        }
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_resubmit_depth, 3);
        assert_eq!(config.max_chunk, 1000);
        assert_eq!(config.last_received_at, None);
    }

    #[test]
    fn test_builder_chain() {
        let config = SyncConfig::new()
            .with_debounce(Duration::from_millis(50))
            .with_fetch_timeout(Duration::from_secs(5))
            .with_max_chunk(10)
            .with_max_resubmit_depth(2)
            .with_last_received_at(Some(Timestamp::from_micros(42)));

        assert!(config.validate().is_ok());
        assert_eq!(config.debounce, Duration::from_millis(50));
        assert_eq!(config.max_chunk, 10);
        assert_eq!(config.last_received_at, Some(Timestamp::from_micros(42)));
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let config = SyncConfig::new().with_max_chunk(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroChunk)));
    }

    #[test]
    fn test_validate_rejects_zero_depth() {
        let config = SyncConfig::new().with_max_resubmit_depth(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroResubmitDepth)
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = SyncConfig::new().with_fetch_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroFetchTimeout)
        ));
    }

    #[test]
    fn test_auth_state_toggles() {
        let auth = AuthState::default();
        assert!(!auth.is_authenticated());

        auth.set_authenticated(true);
        assert!(auth.is_authenticated());

        auth.set_authenticated(false);
        assert!(!auth.is_authenticated());
    }
}

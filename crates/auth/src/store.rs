//! Persisted token-record storage
//!
//! One durable record per store: the serialized [`TokenSet`] under the
//! fixed `auth_tokens_v1` key. The platform implementation keeps the
//! record in the OS keychain (macOS Keychain Access, Windows Credential
//! Manager, Linux Secret Service).
//!
//! Deletions are broadcast to watchers. Session-manager instances sharing
//! a store subscribe to that channel, which is how a logout in one window
//! reaches the others without polling.

use async_trait::async_trait;
use keyring::Entry;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::traits::TokenStoreTrait;
use crate::types::TokenSet;

/// Fixed logical key for the persisted token record.
pub const TOKEN_RECORD_KEY: &str = "auth_tokens_v1";

/// Keychain service the NTDoc client stores its record under.
const DEFAULT_SERVICE: &str = "NTDoc.auth";

/// Buffered deletion events per watcher before lagging.
const WATCH_CAPACITY: usize = 16;

/// Change notification emitted by a token store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// The persisted record was deleted. Watchers treat this as a logout
    /// signal from another session-manager instance.
    RecordCleared,
}

/// Token store error types
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing store access failed (permission denied, not available, etc.)
    #[error("Store access failed: {0}")]
    AccessFailed(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying keyring library error
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Platform-keychain implementation of the token store
///
/// The whole token set is one JSON blob in a single keychain entry, so a
/// write or delete is atomic from any reader's perspective.
pub struct KeyringTokenStore {
    service_name: String,
    events: broadcast::Sender<StoreEvent>,
}

impl KeyringTokenStore {
    /// Create a store under a specific keychain service name
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self { service_name: service_name.into(), events }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Entry::new(&self.service_name, TOKEN_RECORD_KEY).map_err(|e| {
            StoreError::AccessFailed(format!("Failed to create keychain entry: {e}"))
        })
    }
}

impl Default for KeyringTokenStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

#[async_trait]
impl TokenStoreTrait for KeyringTokenStore {
    async fn save_tokens(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        debug!(service = %self.service_name, key = TOKEN_RECORD_KEY, "Storing token record");

        let record = serde_json::to_string(tokens)?;
        self.entry()?.set_password(&record)?;

        Ok(())
    }

    async fn load_tokens(&self) -> Result<Option<TokenSet>, StoreError> {
        debug!(service = %self.service_name, key = TOKEN_RECORD_KEY, "Loading token record");

        match self.entry()?.get_password() {
            Ok(record) => Ok(Some(serde_json::from_str(&record)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Keyring(e)),
        }
    }

    async fn clear_tokens(&self) -> Result<(), StoreError> {
        debug!(service = %self.service_name, key = TOKEN_RECORD_KEY, "Deleting token record");

        match self.entry()?.delete_credential() {
            Ok(()) => {
                // Watchers only hear about deletions that removed a record,
                // mirroring storage events that fire on real mutations.
                let _ = self.events.send(StoreEvent::RecordCleared);
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(e)),
        }
    }

    async fn has_tokens(&self) -> bool {
        self.entry().map(|entry| entry.get_password().is_ok()).unwrap_or(false)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

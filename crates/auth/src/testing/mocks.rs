//! Mock implementations of the auth traits
//!
//! Provides scripted doubles for the backend auth API and the token
//! store so session-lifecycle behavior can be tested without a network
//! or a platform keychain.

// Allow missing error/panic docs for test mocks - they are designed to be simple
// and errors are clearly indicated by their return types
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};

use crate::client::AuthApiError;
use crate::store::{StoreError, StoreEvent};
use crate::traits::{AuthApiTrait, TokenStoreTrait};
use crate::types::{TokenResponse, TokenSet};

// Type aliases to reduce complexity
type CallScript = Arc<Mutex<Vec<Result<TokenResponse, AuthApiError>>>>;
type RecordSlot = Arc<Mutex<Option<String>>>;

/// Buffered deletion events per watcher before lagging.
const WATCH_CAPACITY: usize = 16;

/// A captured code-exchange call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeCall {
    pub code: String,
    pub code_verifier: String,
    pub nonce: String,
}

/// A captured revocation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeCall {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
}

/// Mock backend auth API with scripted responses and call capture
///
/// Responses are consumed in order. A call with nothing scripted returns
/// a tagged `unscripted_*` backend error so the offending test fails
/// loudly instead of hanging on fabricated defaults. Refresh calls can
/// fall back to a standing response for tests that allow any number of
/// refreshes, and can be gated on a [`Notify`] to hold a refresh
/// in-flight while the test races it against logout.
#[derive(Clone, Debug)]
pub struct MockAuthApi {
    exchange_script: CallScript,
    refresh_script: CallScript,
    refresh_fallback: Arc<Mutex<Option<TokenResponse>>>,
    exchange_calls: Arc<Mutex<Vec<ExchangeCall>>>,
    refresh_calls: Arc<Mutex<Vec<String>>>,
    revoke_calls: Arc<Mutex<Vec<RevokeCall>>>,
    revoke_result: Arc<Mutex<bool>>,
    refresh_gate: Arc<Mutex<Option<Arc<Notify>>>>,
}

impl MockAuthApi {
    /// Create a mock with empty scripts and revocation succeeding
    #[must_use]
    pub fn new() -> Self {
        Self {
            exchange_script: Arc::new(Mutex::new(Vec::new())),
            refresh_script: Arc::new(Mutex::new(Vec::new())),
            refresh_fallback: Arc::new(Mutex::new(None)),
            exchange_calls: Arc::new(Mutex::new(Vec::new())),
            refresh_calls: Arc::new(Mutex::new(Vec::new())),
            revoke_calls: Arc::new(Mutex::new(Vec::new())),
            revoke_result: Arc::new(Mutex::new(true)),
            refresh_gate: Arc::new(Mutex::new(None)),
        }
    }

    /// Queue the result of the next unscripted exchange call
    pub fn script_exchange(&self, result: Result<TokenResponse, AuthApiError>) {
        // SAFETY: Mutex poisoning is acceptable in test mocks - if a test
        // panics, the entire test fails anyway
        self.exchange_script.lock().unwrap().push(result);
    }

    /// Queue the result of the next unscripted refresh call
    pub fn script_refresh(&self, result: Result<TokenResponse, AuthApiError>) {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.refresh_script.lock().unwrap().push(result);
    }

    /// Standing response for refresh calls beyond the script
    pub fn set_refresh_fallback(&self, response: TokenResponse) {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.refresh_fallback.lock().unwrap() = Some(response);
    }

    /// Configure whether revocation reports success
    pub fn set_revoke_result(&self, success: bool) {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.revoke_result.lock().unwrap() = success;
    }

    /// Hold every refresh call until the returned handle is notified
    pub fn gate_refresh(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.refresh_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Get all captured exchange calls
    #[must_use]
    pub fn exchange_calls(&self) -> Vec<ExchangeCall> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.exchange_calls.lock().unwrap().clone()
    }

    /// Get the number of exchange calls made
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.exchange_calls.lock().unwrap().len()
    }

    /// Get the refresh tokens each refresh call carried
    #[must_use]
    pub fn refresh_calls(&self) -> Vec<String> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.refresh_calls.lock().unwrap().clone()
    }

    /// Get the number of refresh calls made
    #[must_use]
    pub fn refresh_count(&self) -> usize {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.refresh_calls.lock().unwrap().len()
    }

    /// Get all captured revocation calls
    #[must_use]
    pub fn revoke_calls(&self) -> Vec<RevokeCall> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.revoke_calls.lock().unwrap().clone()
    }

    /// Get the number of revocation calls made
    #[must_use]
    pub fn revoke_count(&self) -> usize {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.revoke_calls.lock().unwrap().len()
    }

    fn next_scripted(script: &CallScript) -> Option<Result<TokenResponse, AuthApiError>> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        let mut script = script.lock().unwrap();
        if script.is_empty() {
            None
        } else {
            Some(script.remove(0))
        }
    }
}

impl Default for MockAuthApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthApiTrait for MockAuthApi {
    async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: &str,
        nonce: &str,
    ) -> Result<TokenResponse, AuthApiError> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.exchange_calls.lock().unwrap().push(ExchangeCall {
            code: code.to_string(),
            code_verifier: code_verifier.to_string(),
            nonce: nonce.to_string(),
        });

        Self::next_scripted(&self.exchange_script).unwrap_or_else(|| {
            Err(AuthApiError::Backend {
                error: "unscripted_exchange".to_string(),
                description: None,
            })
        })
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenResponse, AuthApiError> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.refresh_calls.lock().unwrap().push(refresh_token.to_string());

        // Clone the gate out so no lock is held across the await
        // SAFETY: Mutex poisoning is acceptable in test mocks
        let gate = self.refresh_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if let Some(result) = Self::next_scripted(&self.refresh_script) {
            return result;
        }

        // SAFETY: Mutex poisoning is acceptable in test mocks
        let fallback = self.refresh_fallback.lock().unwrap().clone();
        fallback.map_or_else(
            || {
                Err(AuthApiError::Backend {
                    error: "unscripted_refresh".to_string(),
                    description: None,
                })
            },
            Ok,
        )
    }

    async fn revoke_session(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        id_token: Option<&str>,
    ) -> bool {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.revoke_calls.lock().unwrap().push(RevokeCall {
            access_token: access_token.map(ToOwned::to_owned),
            refresh_token: refresh_token.map(ToOwned::to_owned),
            id_token: id_token.map(ToOwned::to_owned),
        });

        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.revoke_result.lock().unwrap()
    }
}

/// In-memory token store with the same record and event semantics as the
/// keychain-backed store
///
/// The record is held as serialized JSON so the serde path is exercised
/// exactly as it is against the real store. Clones share state, which is
/// how tests model several session-manager instances over one credential
/// store.
#[derive(Clone, Debug)]
pub struct MockTokenStore {
    record: RecordSlot,
    events: broadcast::Sender<StoreEvent>,
    fail_saves: Arc<Mutex<bool>>,
    save_count: Arc<Mutex<usize>>,
}

impl MockTokenStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            record: Arc::new(Mutex::new(None)),
            events,
            fail_saves: Arc::new(Mutex::new(false)),
            save_count: Arc::new(Mutex::new(0)),
        }
    }

    /// Seed a persisted record directly, bypassing the trait
    pub fn seed_tokens(&self, tokens: &TokenSet) {
        let record = serde_json::to_string(tokens).expect("token set serializes");
        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.record.lock().unwrap() = Some(record);
    }

    /// Seed a raw record, for corrupt-data scenarios
    pub fn seed_raw(&self, record: &str) {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.record.lock().unwrap() = Some(record.to_string());
    }

    /// Force subsequent saves to fail
    pub fn set_fail_saves(&self, fail: bool) {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.fail_saves.lock().unwrap() = fail;
    }

    /// Get the stored record as parsed tokens
    #[must_use]
    pub fn stored_tokens(&self) -> Option<TokenSet> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        let record = self.record.lock().unwrap().clone()?;
        serde_json::from_str(&record).ok()
    }

    /// Get the number of successful saves
    #[must_use]
    pub fn save_count(&self) -> usize {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.save_count.lock().unwrap()
    }
}

impl Default for MockTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenStoreTrait for MockTokenStore {
    async fn save_tokens(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        if *self.fail_saves.lock().unwrap() {
            return Err(StoreError::AccessFailed("mock save failure".to_string()));
        }

        let record = serde_json::to_string(tokens)?;
        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.record.lock().unwrap() = Some(record);
        // SAFETY: Mutex poisoning is acceptable in test mocks
        *self.save_count.lock().unwrap() += 1;
        Ok(())
    }

    async fn load_tokens(&self) -> Result<Option<TokenSet>, StoreError> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        let record = self.record.lock().unwrap().clone();
        match record {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear_tokens(&self) -> Result<(), StoreError> {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        let removed = self.record.lock().unwrap().take();
        if removed.is_some() {
            let _ = self.events.send(StoreEvent::RecordCleared);
        }
        Ok(())
    }

    async fn has_tokens(&self) -> bool {
        // SAFETY: Mutex poisoning is acceptable in test mocks
        self.record.lock().unwrap().is_some()
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

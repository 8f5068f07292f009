//! Traits for backend auth calls and token persistence
//!
//! These traits enable dependency injection and testing by abstracting
//! the session manager's external dependencies (the NTDoc backend, the
//! platform credential store).

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::client::AuthApiError;
use crate::store::{StoreError, StoreEvent};
use crate::types::{TokenResponse, TokenSet};

/// Trait for the backend authentication endpoints
///
/// Abstracts the code-exchange, refresh, and revocation calls so the
/// session manager can be driven by a mock in tests. All operations fail
/// softly: callers receive a tagged result (or a plain `bool` for
/// revocation), never a panic.
#[async_trait]
pub trait AuthApiTrait: Send + Sync {
    /// Exchange an authorization code for tokens
    ///
    /// # Arguments
    /// * `code` - Authorization code from the provider redirect
    /// * `code_verifier` - PKCE verifier generated before the redirect
    /// * `nonce` - OIDC nonce bound into the authorization request
    ///
    /// # Errors
    /// Returns [`AuthApiError`] on transport failure, non-2xx status, a
    /// backend-reported error body, or a response missing the access token.
    async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: &str,
        nonce: &str,
    ) -> Result<TokenResponse, AuthApiError>;

    /// Refresh the session using a refresh token
    ///
    /// On success the response's refresh token falls back to the input
    /// token when the backend did not rotate it, so continuity is never
    /// lost with rotation-optional providers.
    ///
    /// # Errors
    /// Returns [`AuthApiError`] under the same conditions as the exchange.
    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenResponse, AuthApiError>;

    /// Best-effort server-side session revocation
    ///
    /// # Returns
    /// `true` when the backend confirmed the revocation; `false` on any
    /// failure. Never errors, so logout can always proceed locally.
    async fn revoke_session(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        id_token: Option<&str>,
    ) -> bool;
}

/// Trait for persisted token-record storage
///
/// One fixed record per store: the serialized [`TokenSet`]. Deletions are
/// broadcast to watchers, which is how a logout in one session-manager
/// instance reaches the others sharing the store.
#[async_trait]
pub trait TokenStoreTrait: Send + Sync {
    /// Write the token record, replacing any previous one
    ///
    /// # Errors
    /// Returns [`StoreError`] if serialization or the backing store fails.
    async fn save_tokens(&self, tokens: &TokenSet) -> Result<(), StoreError>;

    /// Read the token record
    ///
    /// # Returns
    /// `Ok(None)` when no record exists.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the backing store fails or the record
    /// cannot be parsed.
    async fn load_tokens(&self) -> Result<Option<TokenSet>, StoreError>;

    /// Delete the token record and notify watchers
    ///
    /// Deleting an absent record is not an error.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the backing store fails.
    async fn clear_tokens(&self) -> Result<(), StoreError>;

    /// Check whether a token record exists
    async fn has_tokens(&self) -> bool;

    /// Subscribe to record-deletion events
    ///
    /// Every call returns an independent receiver; events published before
    /// the call are not replayed.
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;
}

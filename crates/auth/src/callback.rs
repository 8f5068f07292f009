//! Authorization callback handling
//!
//! Consumes the provider redirect that ends the Authorization Code + PKCE
//! flow: validates `state` against the parked copy, exchanges the one-time
//! code through the backend, and hands the token response to the session
//! manager. Every terminal condition is reported as a [`CallbackOutcome`]
//! rather than an error, since a callback page always has something to
//! render.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};
use url::Url;

use crate::pkce::{validate_state, TEMP_NONCE_KEY, TEMP_REDIRECT_KEY, TEMP_STATE_KEY, TEMP_VERIFIER_KEY};
use crate::session::SessionManager;
use crate::traits::{AuthApiTrait, TokenStoreTrait};

/// Temp-store key prefix marking an authorization code as consumed.
///
/// Guards against double delivery of the same callback (strict-mode style
/// double effects, user refresh on the callback page): a code is one-time
/// use at the provider, so replaying the exchange can only fail.
const CONSUMED_CODE_PREFIX: &str = "consumed_code.";

/// Landing path when no post-login redirect was parked before the flow.
const DEFAULT_POST_LOGIN_REDIRECT: &str = "/dashboard";

/// Terminal result of processing one authorization callback.
///
/// The `Display` form is the user-facing status message for each outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The provider redirected back with an error instead of a code
    ProviderError {
        error: String,
        description: Option<String>,
    },

    /// The callback URL carries neither a code nor a provider error
    MissingCode,

    /// `state` did not match the parked copy; the code was not exchanged
    StateMismatch,

    /// No PKCE verifier is parked, so the exchange cannot be proven
    MissingVerifier,

    /// The backend rejected or failed the code exchange
    ExchangeFailed { reason: String },

    /// This authorization code was already processed by this instance
    AlreadyHandled,

    /// The session is established; navigate to the contained target
    Success { redirect_to: String },
}

impl CallbackOutcome {
    /// Whether the callback established a session.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

impl std::fmt::Display for CallbackOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProviderError { error, description } => match description {
                Some(description) => write!(f, "Authorization failed: {error} - {description}"),
                None => write!(f, "Authorization failed: {error}"),
            },
            Self::MissingCode => write!(f, "Missing authorization code."),
            Self::StateMismatch => write!(f, "State mismatch. Potential CSRF detected."),
            Self::MissingVerifier => {
                write!(f, "Missing PKCE verifier; cannot complete authorization.")
            }
            Self::ExchangeFailed { reason } => {
                if reason.is_empty() {
                    write!(f, "Code exchange failed: unknown_error")
                } else {
                    write!(f, "Code exchange failed: {reason}")
                }
            }
            Self::AlreadyHandled => write!(f, "Authorization already processed."),
            Self::Success { .. } => write!(f, "Finalizing session..."),
        }
    }
}

/// Processes provider redirects for one [`SessionManager`].
pub struct CallbackHandler<A: AuthApiTrait, S: TokenStoreTrait> {
    manager: SessionManager<A, S>,
}

impl<A: AuthApiTrait, S: TokenStoreTrait> Clone for CallbackHandler<A, S> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
        }
    }
}

impl<A: AuthApiTrait + 'static, S: TokenStoreTrait + 'static> CallbackHandler<A, S> {
    /// Create a handler over the manager that started the flow.
    ///
    /// The handler reads the PKCE material the manager parked in its temp
    /// store, so both must come from the same instance.
    pub fn new(manager: SessionManager<A, S>) -> Self {
        Self { manager }
    }

    /// Process one provider redirect.
    ///
    /// Validates the callback parameters, exchanges the authorization code
    /// and establishes the session on the owning manager. Never exchanges
    /// the code when `state` validation fails, and never exchanges the same
    /// code twice.
    pub async fn handle(&self, callback_url: &str) -> CallbackOutcome {
        debug!("Processing authorization callback");

        let parsed = match Url::parse(callback_url) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Callback URL failed to parse");
                return CallbackOutcome::MissingCode;
            }
        };
        let params: HashMap<String, String> = parsed
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();

        if let Some(provider_error) = params.get("error").filter(|e| !e.is_empty()) {
            let description = params
                .get("error_description")
                .filter(|d| !d.is_empty())
                .cloned();
            warn!(
                error = %provider_error,
                "Provider returned an authorization error"
            );
            return CallbackOutcome::ProviderError {
                error: provider_error.clone(),
                description,
            };
        }

        let Some(code) = params.get("code").filter(|c| !c.is_empty()) else {
            warn!("Callback carries no authorization code");
            return CallbackOutcome::MissingCode;
        };

        let temp = self.manager.temp();
        let consumed_key = format!("{CONSUMED_CODE_PREFIX}{code}");
        if temp.read(&consumed_key).is_some() {
            debug!("Authorization code already consumed, skipping");
            return CallbackOutcome::AlreadyHandled;
        }

        let url_state = params.get("state").map_or("", String::as_str);
        let stored_state = temp.read(TEMP_STATE_KEY);
        let state_valid = stored_state
            .as_deref()
            .is_some_and(|stored| validate_state(stored, url_state));
        if !state_valid {
            warn!("State mismatch in authorization callback, refusing to exchange");
            self.clear_pkce_material();
            return CallbackOutcome::StateMismatch;
        }

        let Some(verifier) = temp.read(TEMP_VERIFIER_KEY) else {
            warn!("No parked PKCE verifier for this callback");
            return CallbackOutcome::MissingVerifier;
        };
        let nonce = temp.read(TEMP_NONCE_KEY).unwrap_or_default();

        debug!("Exchanging authorization code");
        let response = match self
            .manager
            .api()
            .exchange_authorization_code(code, &verifier, &nonce)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "Authorization code exchange failed");
                self.clear_pkce_material();
                return CallbackOutcome::ExchangeFailed {
                    reason: e.to_string(),
                };
            }
        };

        // Mark the code consumed before ingesting; a replay of this callback
        // must short-circuit even if ingestion below fails.
        temp.store(&consumed_key, "1");
        self.clear_pkce_material();

        if let Err(e) = self.manager.complete_login(response).await {
            error!(error = %e, "Failed to establish session from exchanged tokens");
            return CallbackOutcome::ExchangeFailed {
                reason: e.to_string(),
            };
        }

        let redirect_to = temp
            .read(TEMP_REDIRECT_KEY)
            .unwrap_or_else(|| DEFAULT_POST_LOGIN_REDIRECT.to_string());
        temp.clear(&[TEMP_REDIRECT_KEY]);

        info!("Authorization callback completed, session established");
        CallbackOutcome::Success { redirect_to }
    }

    fn clear_pkce_material(&self) {
        self.manager
            .temp()
            .clear(&[TEMP_VERIFIER_KEY, TEMP_STATE_KEY, TEMP_NONCE_KEY]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::AuthApiError;
    use crate::config::{OidcConfig, SessionTuning};
    use crate::testing::{make_unsigned_jwt, token_response, MockAuthApi, MockTokenStore};
    use crate::types::TokenResponse;
    use serde_json::json;

    const CALLBACK_BASE: &str = "http://localhost:5173/auth/callback";

    fn test_config() -> OidcConfig {
        OidcConfig::new(
            "http://localhost:8080/".to_string(),
            "test-realm".to_string(),
            "test-client".to_string(),
            vec!["openid".to_string(), "profile".to_string()],
            CALLBACK_BASE.to_string(),
            "http://localhost:8081".to_string(),
        )
    }

    fn test_handler(
        api: &MockAuthApi,
        store: &MockTokenStore,
    ) -> (
        SessionManager<MockAuthApi, MockTokenStore>,
        CallbackHandler<MockAuthApi, MockTokenStore>,
    ) {
        let manager =
            SessionManager::new(test_config(), SessionTuning::default(), api.clone(), store.clone());
        let handler = CallbackHandler::new(manager.clone());
        (manager, handler)
    }

    fn jwt_response(expires_in: i64) -> TokenResponse {
        let access = make_unsigned_jwt(&json!({
            "sub": "user-1",
            "preferred_username": "alice",
            "realm_access": { "roles": ["editor"] },
        }));
        token_response(&access, Some("refresh-1"), expires_in)
    }

    /// Starts a login flow and returns the parked state value.
    async fn begin_flow(manager: &SessionManager<MockAuthApi, MockTokenStore>) -> String {
        manager.login(None).await.unwrap();
        manager.temp().read(TEMP_STATE_KEY).unwrap()
    }

    /// Validates reporting of a provider-side authorization error.
    ///
    /// Assertions:
    /// - Error and description are carried through with the original text
    /// - No exchange is attempted
    #[tokio::test]
    async fn test_provider_error_reported() {
        let api = MockAuthApi::new();
        let (_, handler) = test_handler(&api, &MockTokenStore::new());

        let outcome = handler
            .handle(&format!(
                "{CALLBACK_BASE}?error=access_denied&error_description=User%20cancelled"
            ))
            .await;

        assert_eq!(
            outcome,
            CallbackOutcome::ProviderError {
                error: "access_denied".to_string(),
                description: Some("User cancelled".to_string()),
            }
        );
        assert_eq!(
            outcome.to_string(),
            "Authorization failed: access_denied - User cancelled"
        );
        assert_eq!(api.exchange_count(), 0);
    }

    /// Validates the missing-code outcome.
    ///
    /// Assertions:
    /// - A callback without code or error reports MissingCode
    #[tokio::test]
    async fn test_missing_code_reported() {
        let api = MockAuthApi::new();
        let (_, handler) = test_handler(&api, &MockTokenStore::new());

        let outcome = handler.handle(&format!("{CALLBACK_BASE}?state=abc")).await;

        assert_eq!(outcome, CallbackOutcome::MissingCode);
        assert_eq!(outcome.to_string(), "Missing authorization code.");
        assert_eq!(api.exchange_count(), 0);
    }

    /// Validates that a state mismatch refuses the exchange.
    ///
    /// Assertions:
    /// - The code is never sent to the backend
    /// - Parked PKCE material is cleared so it cannot be replayed
    #[tokio::test]
    async fn test_state_mismatch_never_exchanges() {
        let api = MockAuthApi::new();
        let (manager, handler) = test_handler(&api, &MockTokenStore::new());
        begin_flow(&manager).await;

        let outcome = handler
            .handle(&format!("{CALLBACK_BASE}?code=abc123&state=forged"))
            .await;

        assert_eq!(outcome, CallbackOutcome::StateMismatch);
        assert_eq!(
            outcome.to_string(),
            "State mismatch. Potential CSRF detected."
        );
        assert_eq!(api.exchange_count(), 0);
        assert!(manager.temp().read(TEMP_VERIFIER_KEY).is_none());
        assert!(manager.temp().read(TEMP_STATE_KEY).is_none());
    }

    /// Validates that a callback with no parked state is a mismatch.
    ///
    /// Assertions:
    /// - Without a stored state the exchange is refused outright
    #[tokio::test]
    async fn test_missing_stored_state_is_mismatch() {
        let api = MockAuthApi::new();
        let (_, handler) = test_handler(&api, &MockTokenStore::new());

        let outcome = handler
            .handle(&format!("{CALLBACK_BASE}?code=abc123&state=anything"))
            .await;

        assert_eq!(outcome, CallbackOutcome::StateMismatch);
        assert_eq!(api.exchange_count(), 0);
    }

    /// Validates the missing-verifier outcome.
    ///
    /// Assertions:
    /// - Valid state but no parked verifier stops before the exchange
    #[tokio::test]
    async fn test_missing_verifier_reported() {
        let api = MockAuthApi::new();
        let (manager, handler) = test_handler(&api, &MockTokenStore::new());
        manager.temp().store(TEMP_STATE_KEY, "parked-state");

        let outcome = handler
            .handle(&format!("{CALLBACK_BASE}?code=abc123&state=parked-state"))
            .await;

        assert_eq!(outcome, CallbackOutcome::MissingVerifier);
        assert_eq!(
            outcome.to_string(),
            "Missing PKCE verifier; cannot complete authorization."
        );
        assert_eq!(api.exchange_count(), 0);
    }

    /// Validates the failed-exchange outcome.
    ///
    /// Assertions:
    /// - The backend error text is carried into the outcome
    /// - PKCE material is cleared and no session is established
    #[tokio::test]
    async fn test_exchange_failure_clears_material() {
        let api = MockAuthApi::new();
        api.script_exchange(Err(AuthApiError::Backend {
            error: "invalid_grant".to_string(),
            description: None,
        }));
        let (manager, handler) = test_handler(&api, &MockTokenStore::new());
        let state = begin_flow(&manager).await;

        let outcome = handler
            .handle(&format!("{CALLBACK_BASE}?code=abc123&state={state}"))
            .await;

        assert_eq!(
            outcome,
            CallbackOutcome::ExchangeFailed {
                reason: "invalid_grant".to_string(),
            }
        );
        assert_eq!(outcome.to_string(), "Code exchange failed: invalid_grant");
        assert_eq!(api.exchange_count(), 1);
        assert!(manager.temp().read(TEMP_VERIFIER_KEY).is_none());
        assert!(!manager.is_authenticated().await);
    }

    /// Validates the full success path with a parked redirect.
    ///
    /// # Test Steps
    /// 1. Start a login flow with a post-login redirect target
    /// 2. Deliver the callback with the matching state
    /// 3. Verify the exchange used the parked verifier and nonce
    /// 4. Verify the session is live and the parked target is returned
    #[tokio::test]
    async fn test_success_establishes_session() {
        let api = MockAuthApi::new();
        api.script_exchange(Ok(jwt_response(300)));
        let store = MockTokenStore::new();
        let (manager, handler) = test_handler(&api, &store);
        manager.login(Some("/docs/7")).await.unwrap();
        let state = manager.temp().read(TEMP_STATE_KEY).unwrap();
        let verifier = manager.temp().read(TEMP_VERIFIER_KEY).unwrap();
        let nonce = manager.temp().read(TEMP_NONCE_KEY).unwrap();

        let outcome = handler
            .handle(&format!("{CALLBACK_BASE}?code=abc123&state={state}"))
            .await;

        assert_eq!(
            outcome,
            CallbackOutcome::Success {
                redirect_to: "/docs/7".to_string(),
            }
        );
        assert!(outcome.is_success());

        let calls = api.exchange_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].code, "abc123");
        assert_eq!(calls[0].code_verifier, verifier);
        assert_eq!(calls[0].nonce, nonce);

        assert!(manager.is_authenticated().await);
        assert_eq!(
            manager.user().await.unwrap().username.as_deref(),
            Some("alice")
        );
        assert!(store.has_tokens().await);
        assert!(manager.temp().read(TEMP_VERIFIER_KEY).is_none());
        assert!(manager.temp().read(TEMP_STATE_KEY).is_none());
        assert!(manager.temp().read(TEMP_NONCE_KEY).is_none());
        assert!(manager.temp().read(TEMP_REDIRECT_KEY).is_none());
    }

    /// Validates the default landing path when no redirect was parked.
    ///
    /// Assertions:
    /// - Success falls back to the dashboard target
    #[tokio::test]
    async fn test_success_uses_default_redirect() {
        let api = MockAuthApi::new();
        api.script_exchange(Ok(jwt_response(300)));
        let (manager, handler) = test_handler(&api, &MockTokenStore::new());
        let state = begin_flow(&manager).await;

        let outcome = handler
            .handle(&format!("{CALLBACK_BASE}?code=abc123&state={state}"))
            .await;

        assert_eq!(
            outcome,
            CallbackOutcome::Success {
                redirect_to: "/dashboard".to_string(),
            }
        );
    }

    /// Validates that a delivered code is exchanged exactly once.
    ///
    /// # Test Steps
    /// 1. Complete a successful callback
    /// 2. Deliver the identical callback again
    /// 3. Verify the repeat short-circuits without touching the backend
    #[tokio::test]
    async fn test_duplicate_callback_short_circuits() {
        let api = MockAuthApi::new();
        api.script_exchange(Ok(jwt_response(300)));
        let (manager, handler) = test_handler(&api, &MockTokenStore::new());
        let state = begin_flow(&manager).await;
        let callback_url = format!("{CALLBACK_BASE}?code=abc123&state={state}");

        assert!(handler.handle(&callback_url).await.is_success());
        let repeat = handler.handle(&callback_url).await;

        assert_eq!(repeat, CallbackOutcome::AlreadyHandled);
        assert_eq!(repeat.to_string(), "Authorization already processed.");
        assert_eq!(api.exchange_count(), 1);
    }

    /// Validates outcome message formatting edge cases.
    ///
    /// Assertions:
    /// - An empty failure reason falls back to unknown_error
    /// - A provider error without a description renders without a suffix
    /// - Success renders the finalizing message
    #[test]
    fn test_outcome_display_fallbacks() {
        assert_eq!(
            CallbackOutcome::ExchangeFailed {
                reason: String::new()
            }
            .to_string(),
            "Code exchange failed: unknown_error"
        );
        assert_eq!(
            CallbackOutcome::ProviderError {
                error: "temporarily_unavailable".to_string(),
                description: None,
            }
            .to_string(),
            "Authorization failed: temporarily_unavailable"
        );
        assert_eq!(
            CallbackOutcome::Success {
                redirect_to: "/dashboard".to_string(),
            }
            .to_string(),
            "Finalizing session..."
        );
    }
}

//! Token exchange client for the NTDoc backend
//!
//! Stateless calls behind the authentication lifecycle:
//! - Authorization-code exchange (PKCE completion)
//! - Refresh-token exchange
//! - Best-effort session revocation
//! - Signatureless JWT payload decoding for UI claims
//!
//! Every operation fails softly with a tagged [`AuthApiError`] so callers
//! decide retry and redirect policy; nothing here panics or throws.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::OidcConfig;
use crate::traits::AuthApiTrait;
use crate::types::TokenResponse;

/// Fixed wait bound for backend auth calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Error type for backend auth operations
///
/// The `Display` text doubles as the session manager's user-facing error
/// token, so the variants render as stable snake_case strings rather than
/// prose.
#[derive(Debug)]
pub enum AuthApiError {
    /// Backend answered with a non-2xx status
    Http { status: u16 },

    /// Backend body carried an `error` field (even under a 2xx status)
    Backend { error: String, description: Option<String> },

    /// 2xx response without a usable access token
    MissingAccessToken,

    /// Refresh attempted with an empty refresh token
    NoRefreshToken,

    /// Transport-level failure (timeout, DNS, connection reset)
    Network(reqwest::Error),
}

impl std::fmt::Display for AuthApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { status } => write!(f, "HTTP {status}"),
            Self::Backend { error, description } => match description {
                Some(description) => write!(f, "{error}: {description}"),
                None => write!(f, "{error}"),
            },
            Self::MissingAccessToken => write!(f, "missing_access_token"),
            Self::NoRefreshToken => write!(f, "no_refresh_token"),
            Self::Network(e) => write!(f, "network_error: {e}"),
        }
    }
}

impl std::error::Error for AuthApiError {}

impl From<reqwest::Error> for AuthApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err)
    }
}

/// HTTP client for the NTDoc backend auth endpoints
///
/// The backend fronts the identity provider: the browser-visible PKCE
/// redirect goes to the provider, but code exchange and refresh go through
/// `/api/auth/*` so the client never holds provider credentials.
#[derive(Debug, Clone)]
pub struct AuthApiClient {
    config: OidcConfig,
    client: Client,
}

impl AuthApiClient {
    /// Create a client for the configured backend
    #[must_use]
    pub fn new(config: OidcConfig) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { config, client }
    }

    /// Get a reference to the configuration
    #[must_use]
    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    /// Exchange an authorization code for tokens
    ///
    /// POSTs `{code, codeVerifier, redirectUri, nonce}` to the backend
    /// exchange endpoint.
    ///
    /// # Errors
    /// - [`AuthApiError::Http`] on a non-2xx status
    /// - [`AuthApiError::Backend`] when the body carries an `error` field
    /// - [`AuthApiError::MissingAccessToken`] when no access token came back
    /// - [`AuthApiError::Network`] on transport failure
    pub async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: &str,
        nonce: &str,
    ) -> Result<TokenResponse, AuthApiError> {
        debug!(url = %self.config.exchange_url(), "exchanging authorization code");

        let body = json!({
            "code": code,
            "codeVerifier": code_verifier,
            "redirectUri": self.config.redirect_uri,
            "nonce": nonce,
        });

        let response = self.client.post(self.config.exchange_url()).json(&body).send().await?;
        parse_token_body(response).await
    }

    /// Refresh the session using a refresh token
    ///
    /// POSTs `{refreshToken}` to the backend refresh endpoint. The backend
    /// passes the provider response through, so a provider that does not
    /// rotate refresh tokens omits the field; the input token is kept in
    /// that case.
    ///
    /// # Errors
    /// Same taxonomy as [`Self::exchange_authorization_code`], plus
    /// [`AuthApiError::NoRefreshToken`] for an empty input token.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenResponse, AuthApiError> {
        if refresh_token.is_empty() {
            return Err(AuthApiError::NoRefreshToken);
        }

        debug!(refresh_token_len = refresh_token.len(), "refreshing tokens");

        let body = json!({ "refreshToken": refresh_token });
        let response = self.client.post(self.config.refresh_url()).json(&body).send().await?;

        let mut parsed = parse_token_body(response).await?;
        if parsed.refresh_token.as_deref().map_or(true, str::is_empty) {
            parsed.refresh_token = Some(refresh_token.to_owned());
        }
        Ok(parsed)
    }

    /// Best-effort server-side session revocation
    ///
    /// POSTs `{refreshToken?, idToken?}` with a bearer header when an
    /// access token is available. With neither a refresh nor an id token
    /// there is nothing to revoke and the call is skipped.
    ///
    /// # Returns
    /// `false` on any failure; never errors.
    pub async fn revoke_session(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        id_token: Option<&str>,
    ) -> bool {
        if refresh_token.is_none() && id_token.is_none() {
            return true;
        }

        let mut body = serde_json::Map::new();
        if let Some(token) = refresh_token {
            body.insert("refreshToken".to_owned(), Value::String(token.to_owned()));
        }
        if let Some(token) = id_token {
            body.insert("idToken".to_owned(), Value::String(token.to_owned()));
        }

        let mut request = self.client.post(self.config.logout_url()).json(&Value::Object(body));
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                body.get("success").and_then(Value::as_bool).unwrap_or(false)
            }
            Ok(response) => {
                warn!(status = %response.status(), "session revocation rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "session revocation failed");
                false
            }
        }
    }
}

/// Evaluate a token-shaped response body
///
/// A non-2xx status fails before the body is read. An unparseable 2xx body
/// degrades to an empty response, which then fails the access-token check,
/// matching how the shipped client treated garbage bodies.
async fn parse_token_body(response: reqwest::Response) -> Result<TokenResponse, AuthApiError> {
    let status = response.status();
    if !status.is_success() {
        return Err(AuthApiError::Http { status: status.as_u16() });
    }

    let mut body: TokenResponse = response.json().await.unwrap_or_default();

    if let Some(error) = body.error.take() {
        return Err(AuthApiError::Backend { error, description: body.error_description.take() });
    }
    body.error_description = None;

    if body.access_token.as_deref().map_or(true, str::is_empty) {
        return Err(AuthApiError::MissingAccessToken);
    }

    Ok(body)
}

/// Decode a JWT payload without verifying the signature
///
/// Splits the compact form on `.`, base64url-decodes the middle segment,
/// and parses it as JSON. Returns `None` for anything malformed.
///
/// This is a UI convenience for reading claims, never a trust boundary:
/// the token itself stays opaque to the client and is verified server-side.
#[must_use]
pub fn decode_jwt(token: &str) -> Option<Value> {
    if token.is_empty() {
        return None;
    }
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let payload = URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('=')).ok()?;
    serde_json::from_slice(&payload).ok()
}

#[async_trait]
impl AuthApiTrait for AuthApiClient {
    async fn exchange_authorization_code(
        &self,
        code: &str,
        code_verifier: &str,
        nonce: &str,
    ) -> Result<TokenResponse, AuthApiError> {
        self.exchange_authorization_code(code, code_verifier, nonce).await
    }

    async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenResponse, AuthApiError> {
        self.refresh_tokens(refresh_token).await
    }

    async fn revoke_session(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        id_token: Option<&str>,
    ) -> bool {
        self.revoke_session(access_token, refresh_token, id_token).await
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for client.
    use serde_json::json;

    use super::*;
    use crate::testing::make_unsigned_jwt;

    fn test_config() -> OidcConfig {
        OidcConfig::new(
            "http://localhost:8080/".to_string(),
            "ntdoc".to_string(),
            "ntdoc-web".to_string(),
            vec!["openid".to_string()],
            "http://localhost:5173/auth/callback".to_string(),
            "http://localhost:8081".to_string(),
        )
    }

    /// Validates `decode_jwt` behavior for the well-formed token scenario.
    #[test]
    fn test_decode_jwt_reads_claims() {
        let token = make_unsigned_jwt(&json!({
            "sub": "user-1",
            "preferred_username": "ada",
            "realm_access": { "roles": ["admin"] },
        }));

        let claims = decode_jwt(&token).unwrap();

        assert_eq!(claims["sub"], "user-1");
        assert_eq!(claims["preferred_username"], "ada");
        assert_eq!(claims["realm_access"]["roles"][0], "admin");
    }

    /// Validates `decode_jwt` behavior for the malformed token scenarios.
    ///
    /// Assertions:
    /// - Confirms empty, wrong-segment-count, non-base64, and non-JSON
    ///   payloads all decode to `None`.
    #[test]
    fn test_decode_jwt_rejects_malformed() {
        assert!(decode_jwt("").is_none());
        assert!(decode_jwt("only-one-part").is_none());
        assert!(decode_jwt("a.b").is_none());
        assert!(decode_jwt("a.b.c.d").is_none());
        assert!(decode_jwt("header.!!!not-base64!!!.sig").is_none());

        let not_json = format!("h.{}.s", URL_SAFE_NO_PAD.encode(b"plain text"));
        assert!(decode_jwt(&not_json).is_none());
    }

    /// Validates `AuthApiError` display text used as user-facing error
    /// tokens.
    #[test]
    fn test_error_display() {
        assert_eq!(AuthApiError::Http { status: 401 }.to_string(), "HTTP 401");
        assert_eq!(AuthApiError::MissingAccessToken.to_string(), "missing_access_token");
        assert_eq!(AuthApiError::NoRefreshToken.to_string(), "no_refresh_token");

        let backend = AuthApiError::Backend {
            error: "invalid_grant".to_string(),
            description: Some("Code not valid".to_string()),
        };
        assert_eq!(backend.to_string(), "invalid_grant: Code not valid");

        let bare = AuthApiError::Backend { error: "invalid_grant".to_string(), description: None };
        assert_eq!(bare.to_string(), "invalid_grant");
    }

    #[test]
    fn test_client_creation() {
        let client = AuthApiClient::new(test_config());
        assert_eq!(client.config().client_id, "ntdoc-web");
        assert_eq!(client.config().exchange_url(), "http://localhost:8081/api/auth/exchange");
    }

    /// Validates `AuthApiClient::refresh_tokens` behavior for the empty
    /// token scenario.
    #[tokio::test]
    async fn test_refresh_with_empty_token() {
        let client = AuthApiClient::new(test_config());

        let result = client.refresh_tokens("").await;
        assert!(matches!(result, Err(AuthApiError::NoRefreshToken)));
    }

    /// Build a config whose backend address refuses connections.
    fn unreachable_config() -> OidcConfig {
        let mut config = test_config();
        config.api_base = "http://127.0.0.1:9".to_string();
        config
    }

    /// Validates `AuthApiClient::revoke_session` behavior for the nothing
    /// to revoke scenario.
    ///
    /// Assertions:
    /// - Confirms revocation reports success against an unreachable
    ///   backend when neither a refresh nor an id token is held, so the
    ///   request is skipped rather than attempted.
    /// - Confirms the same holds with no tokens at all.
    #[tokio::test]
    async fn test_revoke_skips_without_refresh_or_id_token() {
        let client = AuthApiClient::new(unreachable_config());

        assert!(client.revoke_session(Some("access"), None, None).await);
        assert!(client.revoke_session(None, None, None).await);
    }

    /// Validates `AuthApiClient::revoke_session` behavior for the
    /// unreachable backend scenario.
    ///
    /// Assertions:
    /// - Confirms a held refresh token forces the backend call, which
    ///   reports failure when the connection is refused.
    #[tokio::test]
    async fn test_revoke_reports_failure_when_backend_unreachable() {
        let client = AuthApiClient::new(unreachable_config());

        assert!(!client.revoke_session(Some("access"), Some("refresh"), None).await);
    }
}

//! Authentication configuration
//!
//! Loads the OIDC provider and backend settings from environment variables,
//! with local-development defaults for every value.
//!
//! ## Environment Variables
//! - `NTDOC_KEYCLOAK_URL`: Identity provider base URL (default `http://localhost:8080/`)
//! - `NTDOC_KEYCLOAK_REALM`: Realm name (default `your-realm`)
//! - `NTDOC_CLIENT_ID`: OAuth client id (default `your-client-id`)
//! - `NTDOC_OIDC_SCOPES`: Requested scopes, space separated (default `openid profile email`)
//! - `NTDOC_REDIRECT_URI`: Redirect URI registered with the provider
//!   (default `http://localhost:5173/auth/callback`)
//! - `NTDOC_API_BASE`: NTDoc backend base URL (default `http://localhost:8081`)

use std::time::Duration;

/// OIDC provider and backend endpoints for the NTDoc client
///
/// `issuer_base` is normalized to end with `/` and `api_base` to carry no
/// trailing slash, so URL building never doubles separators.
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// Identity provider base URL, `/`-terminated.
    pub issuer_base: String,

    /// Keycloak realm the client authenticates against.
    pub realm: String,

    /// OAuth client id.
    pub client_id: String,

    /// OAuth scopes to request.
    pub scopes: Vec<String>,

    /// Redirect URI registered with the provider for the callback.
    pub redirect_uri: String,

    /// NTDoc backend base URL, without trailing slash.
    pub api_base: String,
}

impl OidcConfig {
    /// Create a configuration, normalizing the base-URL separators
    #[must_use]
    pub fn new(
        issuer_base: String,
        realm: String,
        client_id: String,
        scopes: Vec<String>,
        redirect_uri: String,
        api_base: String,
    ) -> Self {
        let mut issuer_base = issuer_base;
        if !issuer_base.ends_with('/') {
            issuer_base.push('/');
        }
        let api_base = api_base.trim_end_matches('/').to_owned();

        Self { issuer_base, realm, client_id, scopes, redirect_uri, api_base }
    }

    /// Load configuration from `NTDOC_*` environment variables
    ///
    /// Every value has a local-development default, so this never fails;
    /// deployments override what they need.
    #[must_use]
    pub fn from_env() -> Self {
        let scopes = env_or("NTDOC_OIDC_SCOPES", "openid profile email")
            .split_whitespace()
            .map(str::to_owned)
            .collect();

        Self::new(
            env_or("NTDOC_KEYCLOAK_URL", "http://localhost:8080/"),
            env_or("NTDOC_KEYCLOAK_REALM", "your-realm"),
            env_or("NTDOC_CLIENT_ID", "your-client-id"),
            scopes,
            env_or("NTDOC_REDIRECT_URI", "http://localhost:5173/auth/callback"),
            env_or("NTDOC_API_BASE", "http://localhost:8081"),
        )
    }

    /// Provider authorization endpoint for the code + PKCE redirect
    #[must_use]
    pub fn authorization_endpoint(&self) -> String {
        format!("{}realms/{}/protocol/openid-connect/auth", self.issuer_base, self.realm)
    }

    /// Backend authorization-code exchange endpoint
    #[must_use]
    pub fn exchange_url(&self) -> String {
        format!("{}/api/auth/exchange", self.api_base)
    }

    /// Backend refresh endpoint
    #[must_use]
    pub fn refresh_url(&self) -> String {
        format!("{}/api/auth/refresh", self.api_base)
    }

    /// Backend logout/revocation endpoint
    #[must_use]
    pub fn logout_url(&self) -> String {
        format!("{}/api/auth/logout", self.api_base)
    }

    /// Scopes as the space-separated `scope` parameter value
    #[must_use]
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}

/// Timing knobs for the session manager's refresh and restore logic
///
/// The defaults reproduce the shipped client's behavior; tests shrink them
/// for determinism instead of sleeping through real lookahead windows.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    /// Lookahead before access expiry at which the proactive refresh fires.
    pub refresh_leeway: Duration,

    /// Floor for the scheduler delay, so a nearly-expired token does not
    /// busy-loop the refresh task.
    pub min_refresh_delay: Duration,

    /// Clock-skew allowance when deciding whether a persisted record is
    /// still usable at load time.
    pub restore_safety_margin: Duration,

    /// Remaining lifetime under which restore performs one refresh before
    /// declaring the session ready.
    pub restore_refresh_window: Duration,

    /// Upper bound on the best-effort revocation call during logout.
    pub revoke_timeout: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            refresh_leeway: Duration::from_secs(30),
            min_refresh_delay: Duration::from_secs(5),
            restore_safety_margin: Duration::from_secs(5),
            restore_refresh_window: Duration::from_secs(60),
            revoke_timeout: Duration::from_secs(5),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_owned(),
        _ => default.to_owned(),
    }
}

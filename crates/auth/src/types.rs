//! Token and identity types for the NTDoc authentication lifecycle
//!
//! Defines the runtime token set (whose serde form is also the persisted
//! record), the wire-level token response returned by the backend, and the
//! session user derived from token claims.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Access-token lifetime assumed when the backend omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 300;

/// Access and refresh tokens with absolute expiries
///
/// Held in the session manager's memory and, serialized as-is, written to
/// the persisted token record. Expiries are always computed client-side
/// from the relative `expires_in` at the moment the response was received;
/// server-supplied absolute timestamps are never trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    /// Bearer credential, opaque to the client.
    pub access_token: String,

    /// Refresh token when the provider granted refresh capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Absolute access-token expiry (epoch milliseconds on the wire).
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub access_expires_at: DateTime<Utc>,

    /// Absolute refresh-token expiry, when the backend reported one.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_expires_at: Option<DateTime<Utc>>,

    /// OIDC identity token carrying standard identity claims.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl TokenSet {
    /// Build a token set from a wire response, stamping absolute expiries
    ///
    /// Returns `None` when the response carries no usable access token; the
    /// caller decides whether that is a hard failure or a no-op.
    #[must_use]
    pub fn from_response(response: &TokenResponse) -> Option<Self> {
        let access_token = response.access_token.clone().filter(|token| !token.is_empty())?;
        let now = Utc::now();
        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        Some(Self {
            access_token,
            refresh_token: response.refresh_token.clone(),
            access_expires_at: now + Duration::seconds(expires_in),
            refresh_expires_at: response
                .refresh_expires_in
                .map(|secs| now + Duration::seconds(secs)),
            id_token: response.id_token.clone(),
        })
    }

    /// Check if the access token is expired or expires within the threshold
    ///
    /// # Arguments
    /// * `threshold_seconds` - Lookahead window; 0 checks the current instant
    #[must_use]
    pub fn is_expired(&self, threshold_seconds: i64) -> bool {
        Utc::now() + Duration::seconds(threshold_seconds) >= self.access_expires_at
    }

    /// Seconds until access-token expiry; negative once expired
    #[must_use]
    pub fn seconds_until_expiry(&self) -> i64 {
        (self.access_expires_at - Utc::now()).num_seconds()
    }
}

/// Token response from the NTDoc backend exchange/refresh endpoints
///
/// Every field is optional at the wire layer; validation happens when the
/// exchange client inspects the body and when [`TokenSet::from_response`]
/// converts it. A body carrying `error` is a failure even under a 2xx
/// status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub refresh_expires_in: Option<i64>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Identity derived from the current token set
///
/// Always a pure function of the held tokens, recomputed on every token
/// change and never independently mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    /// Subject claim (`sub`); empty when the provider omitted it.
    pub id: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Realm-level roles, falling back to the client's resource roles.
    pub roles: Vec<String>,
}

impl SessionUser {
    /// Derive the session user from decoded JWT claims
    ///
    /// Roles come from the realm-level `realm_access.roles` claim, falling
    /// back to `resource_access.{client_id}.roles`, defaulting to empty.
    #[must_use]
    pub fn from_claims(claims: &Value, client_id: &str) -> Self {
        let text = |key: &str| claims.get(key).and_then(Value::as_str).map(str::to_owned);

        let username = text("preferred_username");
        let name = text("name").or_else(|| username.clone());

        Self {
            id: text("sub").unwrap_or_default(),
            username,
            name,
            email: text("email"),
            roles: extract_roles(claims, client_id),
        }
    }

    /// Derive the session user from the raw tokens
    ///
    /// Prefers the identity token because it is guaranteed to carry
    /// standard identity claims; falls back to decoding the access token.
    /// That fallback is a Keycloak convention (its access tokens are JWTs
    /// with user claims embedded), not a portable OAuth2 assumption.
    #[must_use]
    pub fn from_tokens(access_token: &str, id_token: Option<&str>, client_id: &str) -> Option<Self> {
        let source = id_token.filter(|token| !token.is_empty()).unwrap_or(access_token);
        if source.is_empty() {
            return None;
        }
        let claims = crate::client::decode_jwt(source)?;
        Some(Self::from_claims(&claims, client_id))
    }

    /// Whether the user carries the given role
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

fn extract_roles(claims: &Value, client_id: &str) -> Vec<String> {
    let realm_roles = claims.get("realm_access").and_then(|access| access.get("roles"));
    let client_roles = claims
        .get("resource_access")
        .and_then(|access| access.get(client_id))
        .and_then(|client| client.get("roles"));

    realm_roles
        .or(client_roles)
        .and_then(Value::as_array)
        .map(|roles| roles.iter().filter_map(Value::as_str).map(str::to_owned).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    //! Unit tests for types.
    use serde_json::json;

    use super::*;

    fn response(access: Option<&str>, expires_in: Option<i64>) -> TokenResponse {
        TokenResponse {
            access_token: access.map(str::to_owned),
            expires_in,
            ..Default::default()
        }
    }

    /// Validates `TokenSet::from_response` behavior for the full response
    /// scenario.
    ///
    /// Assertions:
    /// - Confirms tokens are carried over unchanged.
    /// - Ensures both absolute expiries land close to `now + expires_in`.
    #[test]
    fn test_token_set_from_response() {
        let response = TokenResponse {
            access_token: Some("access123".to_string()),
            refresh_token: Some("refresh456".to_string()),
            id_token: Some("id789".to_string()),
            expires_in: Some(3600),
            refresh_expires_in: Some(7200),
            ..Default::default()
        };

        let tokens = TokenSet::from_response(&response).unwrap();

        assert_eq!(tokens.access_token, "access123");
        assert_eq!(tokens.refresh_token, Some("refresh456".to_string()));
        assert_eq!(tokens.id_token, Some("id789".to_string()));

        let access_secs = tokens.seconds_until_expiry();
        assert!(access_secs > 3590 && access_secs <= 3600, "got {access_secs}");

        let refresh_secs =
            (tokens.refresh_expires_at.unwrap() - Utc::now()).num_seconds();
        assert!(refresh_secs > 7190 && refresh_secs <= 7200, "got {refresh_secs}");
    }

    /// Validates `TokenSet::from_response` behavior for the omitted
    /// `expires_in` scenario.
    ///
    /// Assertions:
    /// - Confirms the 300 second default applies.
    #[test]
    fn test_token_set_defaults_expires_in() {
        let tokens = TokenSet::from_response(&response(Some("abc"), None)).unwrap();

        let secs = tokens.seconds_until_expiry();
        assert!(secs > 290 && secs <= 300, "got {secs}");
        assert!(tokens.refresh_expires_at.is_none());
    }

    /// Validates `TokenSet::from_response` behavior for the missing access
    /// token scenario.
    ///
    /// Assertions:
    /// - Confirms absent and empty access tokens both yield `None`.
    #[test]
    fn test_token_set_requires_access_token() {
        assert!(TokenSet::from_response(&response(None, Some(300))).is_none());
        assert!(TokenSet::from_response(&response(Some(""), Some(300))).is_none());
    }

    /// Validates `TokenSet::is_expired` behavior across thresholds.
    #[test]
    fn test_token_expiry_check() {
        let tokens = TokenSet::from_response(&response(Some("abc"), Some(3600))).unwrap();

        assert!(!tokens.is_expired(300));
        assert!(tokens.is_expired(7200));
        assert!(!tokens.is_expired(0));
    }

    /// Validates the persisted-record layout for the serialization scenario.
    ///
    /// Assertions:
    /// - Confirms expiries serialize as epoch milliseconds.
    /// - Confirms absent optionals are omitted from the record.
    /// - Confirms the record deserializes back to the same instant.
    #[test]
    fn test_persisted_record_layout() {
        let tokens = TokenSet {
            access_token: "abc".to_string(),
            refresh_token: None,
            access_expires_at: Utc::now() + Duration::seconds(600),
            refresh_expires_at: None,
            id_token: None,
        };

        let record = serde_json::to_value(&tokens).unwrap();
        assert!(record["access_expires_at"].is_i64());
        assert!(record.get("refresh_token").is_none());
        assert!(record.get("refresh_expires_at").is_none());
        assert!(record.get("id_token").is_none());

        let restored: TokenSet = serde_json::from_value(record).unwrap();
        assert_eq!(
            restored.access_expires_at.timestamp_millis(),
            tokens.access_expires_at.timestamp_millis()
        );
        assert_eq!(restored.access_token, "abc");
    }

    /// Validates `SessionUser::from_claims` behavior for the realm roles
    /// scenario.
    #[test]
    fn test_user_from_claims_realm_roles() {
        let claims = json!({
            "sub": "user-1",
            "preferred_username": "ada",
            "name": "Ada Lovelace",
            "email": "ada@example.com",
            "realm_access": { "roles": ["admin", "uploader"] },
        });

        let user = SessionUser::from_claims(&claims, "ntdoc-web");

        assert_eq!(user.id, "user-1");
        assert_eq!(user.username.as_deref(), Some("ada"));
        assert_eq!(user.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(user.email.as_deref(), Some("ada@example.com"));
        assert_eq!(user.roles, vec!["admin", "uploader"]);
        assert!(user.has_role("admin"));
        assert!(!user.has_role("viewer"));
    }

    /// Validates `SessionUser::from_claims` behavior for the resource-roles
    /// fallback scenario.
    ///
    /// Assertions:
    /// - Confirms client-scoped roles apply when realm roles are absent.
    /// - Confirms roles for other clients are ignored.
    #[test]
    fn test_user_from_claims_resource_roles_fallback() {
        let claims = json!({
            "sub": "user-2",
            "preferred_username": "kit",
            "resource_access": {
                "ntdoc-web": { "roles": ["viewer"] },
                "other-app": { "roles": ["admin"] },
            },
        });

        let user = SessionUser::from_claims(&claims, "ntdoc-web");

        assert_eq!(user.roles, vec!["viewer"]);
        // Display name falls back to the username when `name` is absent.
        assert_eq!(user.name.as_deref(), Some("kit"));
    }

    /// Validates `SessionUser::from_claims` behavior for the sparse claims
    /// scenario.
    #[test]
    fn test_user_from_claims_sparse() {
        let user = SessionUser::from_claims(&json!({}), "ntdoc-web");

        assert_eq!(user.id, "");
        assert!(user.username.is_none());
        assert!(user.name.is_none());
        assert!(user.email.is_none());
        assert!(user.roles.is_empty());
    }
}

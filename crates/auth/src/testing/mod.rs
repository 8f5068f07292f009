//! Testing utilities and helpers
//!
//! This module provides the test doubles the session-lifecycle tests are
//! built on:
//! - **[`mocks`]**: In-memory implementations of [`AuthApiTrait`] and
//!   [`TokenStoreTrait`] with scripted responses and call capture
//! - JWT and token-response fixtures for driving claim extraction
//!
//! It is compiled unconditionally so the crate's integration tests can
//! share the same doubles as the unit tests. Nothing here is intended
//! for production use.
//!
//! [`AuthApiTrait`]: crate::traits::AuthApiTrait
//! [`TokenStoreTrait`]: crate::traits::TokenStoreTrait

pub mod mocks;

pub use mocks::{MockAuthApi, MockTokenStore};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::types::TokenResponse;

/// Build an unsigned JWT carrying the given claims
///
/// The token has the standard three-segment shape with a base64url header
/// and payload and a placeholder signature. Claim extraction never
/// verifies signatures, so this is all a test needs.
#[must_use]
pub fn make_unsigned_jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.unsigned")
}

/// Build a successful token response fixture
///
/// Fills only the fields the session lifecycle reads; everything else
/// stays at its default.
#[must_use]
pub fn token_response(
    access_token: &str,
    refresh_token: Option<&str>,
    expires_in: i64,
) -> TokenResponse {
    TokenResponse {
        access_token: Some(access_token.to_string()),
        refresh_token: refresh_token.map(ToOwned::to_owned),
        expires_in: Some(expires_in),
        ..TokenResponse::default()
    }
}

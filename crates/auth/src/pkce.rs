//! PKCE (Proof Key for Code Exchange) material for OAuth 2.0
//!
//! Implements RFC 7636 for secure authorization without client secrets,
//! plus the OIDC `state`/`nonce` tokens and the process-scoped temp store
//! that carries exchange material across the provider round-trip.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Random bytes drawn for a code verifier (86 base64url characters).
pub const DEFAULT_VERIFIER_BYTES: usize = 64;

/// Random bytes drawn for each of `state` and `nonce` (22 characters).
pub const STATE_NONCE_BYTES: usize = 16;

/// Temp-store key holding the PKCE code verifier across the redirect.
pub const TEMP_VERIFIER_KEY: &str = "pkce_verifier";
/// Temp-store key holding the CSRF `state` token.
pub const TEMP_STATE_KEY: &str = "oidc_state";
/// Temp-store key holding the OIDC `nonce`.
pub const TEMP_NONCE_KEY: &str = "oidc_nonce";
/// Temp-store key holding the post-login redirect path.
pub const TEMP_REDIRECT_KEY: &str = "post_login_redirect";

/// Generate a cryptographically secure code verifier
///
/// Returns a URL-safe base64-encoded random string of `byte_len` bytes.
/// Per RFC 7636, verifiers must be 43-128 characters long; byte lengths
/// of 32-96 stay inside that window.
///
/// # Arguments
/// * `byte_len` - Number of random bytes to draw before encoding
pub fn generate_code_verifier(byte_len: usize) -> String {
    random_urlsafe_token(byte_len)
}

/// Generate code challenge from verifier using SHA256
///
/// Per RFC 7636, the challenge is BASE64URL(SHA256(ASCII(code_verifier))).
/// Deterministic for a given verifier; always 43 characters.
///
/// # Arguments
/// * `verifier` - The code verifier string
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let hash = hasher.finalize();
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate a random state token for CSRF protection
#[must_use]
pub fn generate_state() -> String {
    random_urlsafe_token(STATE_NONCE_BYTES)
}

/// Generate a random OIDC nonce
///
/// Drawn independently of [`generate_state`] so the two values never
/// collide by construction.
#[must_use]
pub fn generate_nonce() -> String {
    random_urlsafe_token(STATE_NONCE_BYTES)
}

/// Validate that the state token matches
///
/// # Arguments
/// * `expected` - The state that was sent in the authorization request
/// * `actual` - The state received in the callback
///
/// # Returns
/// `true` if states match exactly, `false` otherwise
#[must_use]
pub fn validate_state(expected: &str, actual: &str) -> bool {
    expected == actual
}

fn random_urlsafe_token(byte_len: usize) -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..byte_len).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Single-use PKCE exchange material for one authorization round-trip
///
/// Bundles the code verifier (sent during token exchange), the code
/// challenge (sent in the authorization request), and the CSRF/OIDC
/// tokens. Created immediately before redirecting to the identity
/// provider; consumed exactly once by the callback handler.
#[derive(Debug, Clone)]
pub struct PkceMaterial {
    /// Random string (43-128 chars, base64url encoded).
    /// Kept secret until token exchange.
    pub code_verifier: String,

    /// SHA256 hash of `code_verifier` (base64url encoded).
    /// Sent in the authorization request for server validation.
    pub code_challenge: String,

    /// Random CSRF protection token.
    /// Must match between authorization request and callback.
    pub state: String,

    /// Random OIDC nonce bound into the identity token by the provider.
    pub nonce: String,
}

impl PkceMaterial {
    /// Generate fresh PKCE material with cryptographically secure random
    /// values
    ///
    /// # Returns
    /// A new `PkceMaterial` with:
    /// - `code_verifier`: 64 random bytes → 86 chars base64url (within RFC
    ///   7636 43-128 limit)
    /// - `code_challenge`: SHA256(code_verifier) → base64url (43 chars)
    /// - `state` / `nonce`: 16 random bytes each, drawn independently
    #[must_use]
    pub fn generate() -> Self {
        let code_verifier = generate_code_verifier(DEFAULT_VERIFIER_BYTES);
        let code_challenge = generate_code_challenge(&code_verifier);
        let state = generate_state();
        let nonce = generate_nonce();

        Self { code_verifier, code_challenge, state, nonce }
    }

    /// Get the challenge method (always "S256" for SHA256)
    #[must_use]
    pub fn challenge_method(&self) -> &str {
        "S256"
    }
}

/// Ephemeral key-value storage scoped to this process
///
/// Stands in for the browser's tab-session storage: it carries PKCE
/// material across the provider round-trip and nothing else. Contents
/// never touch disk and are not visible to other processes; that scoping
/// is a security boundary, so do not widen it.
#[derive(Debug, Default)]
pub struct TempStore {
    entries: Mutex<HashMap<String, String>>,
}

impl TempStore {
    /// Create an empty temp store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous value
    pub fn store(&self, key: &str, value: &str) {
        self.lock().insert(key.to_owned(), value.to_owned());
    }

    /// Read the value stored under `key`, if any
    #[must_use]
    pub fn read(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Remove the given keys; absent keys are ignored
    pub fn clear(&self, keys: &[&str]) {
        let mut entries = self.lock();
        for key in keys {
            entries.remove(*key);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Client-side OIDC authentication for the NTDoc document client.
//!
//! Implements the Authorization Code + PKCE lifecycle end to end:
//!
//! - [`pkce`]: verifier/challenge/state/nonce generation and temp parking
//! - [`client`]: backend-brokered token exchange, refresh and revocation
//! - [`store`]: persisted token record in the OS keychain, with a deletion
//!   watch for cross-instance logout
//! - [`session`]: the session manager (restore-on-startup, proactive
//!   refresh, logout)
//! - [`callback`]: provider-redirect processing for the callback page
//!
//! Construct one [`SessionManager`] per UI instance, [`initialize`] it at
//! startup, and drive interactive logins through [`SessionManager::login`]
//! plus a [`CallbackHandler`] mounted on the redirect URI.
//!
//! [`initialize`]: SessionManager::initialize

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod callback;
pub mod client;
pub mod config;
pub mod pkce;
pub mod session;
pub mod store;
pub mod traits;
pub mod types;

// Testing utilities
// ---------------------------------------------------------------
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use callback::{CallbackHandler, CallbackOutcome};
pub use client::{decode_jwt, AuthApiClient, AuthApiError};
pub use config::{OidcConfig, SessionTuning};
pub use pkce::{
    generate_code_challenge, generate_code_verifier, generate_nonce, generate_state,
    validate_state, PkceMaterial, TempStore,
};
pub use session::{
    LogoutOptions, SessionError, SessionManager, JUST_LOGGED_OUT_KEY, SESSION_EXPIRED_ERROR,
};
pub use store::{KeyringTokenStore, StoreError, StoreEvent};
pub use traits::{AuthApiTrait, TokenStoreTrait};
pub use types::{SessionUser, TokenResponse, TokenSet};

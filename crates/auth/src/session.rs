//! Authentication session manager
//!
//! Owns the client-side OIDC session lifecycle end to end:
//!
//! - Restore-on-startup from the persisted token record
//! - Authorization-URL construction for login and registration redirects
//! - Token ingestion: absolute expiry stamping, user derivation, persistence
//! - Proactive refresh scheduling ahead of access-token expiry
//! - Logout with best-effort server revocation and cross-instance propagation
//!
//! A [`SessionManager`] is an explicit handle over shared inner state; clone
//! it freely and hand clones to background tasks. Once logged out an instance
//! is terminal: construct a fresh manager to authenticate again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::client::AuthApiError;
use crate::config::{OidcConfig, SessionTuning};
use crate::pkce::{
    PkceMaterial, TempStore, TEMP_NONCE_KEY, TEMP_REDIRECT_KEY, TEMP_STATE_KEY, TEMP_VERIFIER_KEY,
};
use crate::store::{StoreError, StoreEvent};
use crate::traits::{AuthApiTrait, TokenStoreTrait};
use crate::types::{SessionUser, TokenResponse, TokenSet};

/// Temp-store key holding the epoch-millisecond timestamp of the last logout.
///
/// Lets a login page distinguish "user just signed out" from "session never
/// existed" without the manager navigating anywhere itself.
pub const JUST_LOGGED_OUT_KEY: &str = "just_logged_out";

/// Error message surfaced when a forced logout ends the session.
pub const SESSION_EXPIRED_ERROR: &str = "Session expired. Please sign in again.";

/// Navigation target returned by a redirecting logout with no explicit `to`.
const DEFAULT_LOGOUT_TARGET: &str = "/";

/// Errors from session-manager operations.
#[derive(Debug)]
pub enum SessionError {
    /// The auth API rejected or failed a token operation
    Api(AuthApiError),

    /// The persistent token store failed
    Store(StoreError),

    /// Operation requires an active session and none is held
    NotAuthenticated,

    /// This manager instance has been logged out and is terminal
    LoggedOut,

    /// The configured authorization endpoint is not a valid URL
    AuthorizationUrl(url::ParseError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Api(e) => write!(f, "Auth API error: {e}"),
            Self::Store(e) => write!(f, "Token store error: {e}"),
            Self::NotAuthenticated => write!(f, "Not authenticated (no active session)"),
            Self::LoggedOut => write!(f, "Session manager is logged out"),
            Self::AuthorizationUrl(e) => write!(f, "Failed to build authorization URL: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Api(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::AuthorizationUrl(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AuthApiError> for SessionError {
    fn from(e: AuthApiError) -> Self {
        Self::Api(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<url::ParseError> for SessionError {
    fn from(e: url::ParseError) -> Self {
        Self::AuthorizationUrl(e)
    }
}

/// Options for [`SessionManager::logout`].
#[derive(Debug, Clone, Default)]
pub struct LogoutOptions {
    /// Ask the call to return a post-logout navigation target. When unset
    /// the caller keeps the current page and decides navigation itself.
    pub redirect: bool,

    /// Navigation target when `redirect` is set; `/` when left unset.
    pub to: Option<String>,

    /// Error message to leave in session state after the logout, used by
    /// forced logouts to explain why the session ended.
    pub error: Option<String>,
}

/// Which authorization flow an authorization URL should start.
#[derive(Debug, Clone, Copy)]
enum AuthMode {
    Login,
    Register,
}

/// Mutable session state behind the manager's lock.
#[derive(Debug)]
struct SessionState {
    tokens: Option<TokenSet>,
    user: Option<SessionUser>,
    error: Option<String>,
    is_loading: bool,
}

struct SessionInner<A, S> {
    api: A,
    store: S,
    config: OidcConfig,
    tuning: SessionTuning,
    temp: TempStore,
    state: RwLock<SessionState>,
    logged_out: AtomicBool,
    timer_generation: AtomicU64,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to one authentication session.
///
/// All clones share the same state; background tasks (the refresh timer and
/// the store watcher) hold clones of the handle they were spawned from.
pub struct SessionManager<A: AuthApiTrait, S: TokenStoreTrait> {
    inner: Arc<SessionInner<A, S>>,
}

impl<A: AuthApiTrait, S: TokenStoreTrait> Clone for SessionManager<A, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: AuthApiTrait, S: TokenStoreTrait> std::fmt::Debug for SessionManager<A, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("client_id", &self.inner.config.client_id)
            .field("logged_out", &self.inner.logged_out.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<A: AuthApiTrait + 'static, S: TokenStoreTrait + 'static> SessionManager<A, S> {
    /// Create a session manager over an auth API client and a token store.
    ///
    /// The manager starts in the loading state; call [`initialize`] to
    /// restore any persisted session and settle into ready.
    ///
    /// [`initialize`]: SessionManager::initialize
    pub fn new(config: OidcConfig, tuning: SessionTuning, api: A, store: S) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                api,
                store,
                config,
                tuning,
                temp: TempStore::new(),
                state: RwLock::new(SessionState {
                    tokens: None,
                    user: None,
                    error: None,
                    is_loading: true,
                }),
                logged_out: AtomicBool::new(false),
                timer_generation: AtomicU64::new(0),
                refresh_task: Mutex::new(None),
                watch_task: Mutex::new(None),
            }),
        }
    }

    /// Restore a persisted session, then subscribe to store deletions.
    ///
    /// Returns `true` when a persisted record was adopted and the manager is
    /// authenticated. A record at or past its safety margin is deleted and
    /// ignored; a record close to expiry is refreshed before this returns,
    /// and discarded if that refresh fails. Either disposal leaves the
    /// manager ready for a fresh [`login`].
    ///
    /// The store watch starts only after restore settles, so this instance's
    /// own cleanup of a stale record is never treated as an external logout.
    ///
    /// [`login`]: SessionManager::login
    pub async fn initialize(&self) -> bool {
        let restored = match self.inner.store.load_tokens().await {
            Ok(Some(tokens)) => self.restore_session(tokens).await,
            Ok(None) => {
                debug!("No persisted token record found");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to read persisted tokens, starting unauthenticated");
                false
            }
        };

        {
            let mut state = self.inner.state.write().await;
            state.is_loading = false;
        }

        self.start_watch();

        restored
    }

    async fn restore_session(&self, tokens: TokenSet) -> bool {
        let remaining = tokens.seconds_until_expiry();
        let margin = self.inner.tuning.restore_safety_margin.as_secs() as i64;

        if remaining <= margin {
            debug!("Persisted token record expired, discarding");
            if let Err(e) = self.inner.store.clear_tokens().await {
                warn!(error = %e, "Failed to delete expired token record");
            }
            return false;
        }

        let user = SessionUser::from_tokens(
            &tokens.access_token,
            tokens.id_token.as_deref(),
            &self.inner.config.client_id,
        );
        let expires_at = tokens.access_expires_at;
        let has_refresh_token = tokens.refresh_token.is_some();
        {
            let mut state = self.inner.state.write().await;
            state.tokens = Some(tokens);
            state.user = user;
        }

        let window = self.inner.tuning.restore_refresh_window.as_secs() as i64;
        if remaining <= window && has_refresh_token {
            debug!(
                remaining_secs = remaining,
                "Restored session close to expiry, refreshing before ready"
            );
            if let Err(e) = self.refresh_session().await {
                warn!(error = %e, "Refresh during restore failed, discarding session");
                {
                    let mut state = self.inner.state.write().await;
                    state.tokens = None;
                    state.user = None;
                }
                if let Err(e) = self.inner.store.clear_tokens().await {
                    warn!(error = %e, "Failed to delete stale token record");
                }
                return false;
            }
        } else {
            self.schedule_refresh(expires_at);
        }

        info!("Restored persisted session");
        true
    }

    /// Build the authorization URL for an interactive login redirect.
    ///
    /// Generates fresh PKCE material, parks it (and the optional post-login
    /// redirect path) in the temp store for the callback handler, and returns
    /// the fully parameterized provider URL to navigate to.
    ///
    /// # Errors
    /// [`SessionError::LoggedOut`] on a terminal instance;
    /// [`SessionError::AuthorizationUrl`] when the configured endpoint does
    /// not parse.
    pub async fn login(&self, redirect_path: Option<&str>) -> Result<String, SessionError> {
        self.start_auth(AuthMode::Login, redirect_path).await
    }

    /// Build the authorization URL for a registration redirect.
    ///
    /// Identical to [`login`] plus the provider hint that opens the
    /// registration form instead of the credentials form.
    ///
    /// # Errors
    /// Same as [`login`].
    ///
    /// [`login`]: SessionManager::login
    pub async fn register(&self, redirect_path: Option<&str>) -> Result<String, SessionError> {
        self.start_auth(AuthMode::Register, redirect_path).await
    }

    async fn start_auth(
        &self,
        mode: AuthMode,
        redirect_path: Option<&str>,
    ) -> Result<String, SessionError> {
        if self.is_logged_out() {
            return Err(SessionError::LoggedOut);
        }

        {
            let mut state = self.inner.state.write().await;
            state.error = None;
        }

        let material = PkceMaterial::generate();
        self.inner.temp.store(TEMP_VERIFIER_KEY, &material.code_verifier);
        self.inner.temp.store(TEMP_STATE_KEY, &material.state);
        self.inner.temp.store(TEMP_NONCE_KEY, &material.nonce);
        if let Some(path) = redirect_path {
            self.inner.temp.store(TEMP_REDIRECT_KEY, path);
        }

        match self.build_authorization_url(mode, &material) {
            Ok(authorize_url) => {
                debug!(mode = ?mode, "Built authorization redirect URL");
                Ok(authorize_url)
            }
            Err(e) => {
                let mut state = self.inner.state.write().await;
                state.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn build_authorization_url(
        &self,
        mode: AuthMode,
        material: &PkceMaterial,
    ) -> Result<String, SessionError> {
        let config = &self.inner.config;
        let mut url = Url::parse(&config.authorization_endpoint())?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &config.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", &config.redirect_uri)
                .append_pair("scope", &config.scope_string())
                .append_pair("code_challenge", &material.code_challenge)
                .append_pair("code_challenge_method", material.challenge_method())
                .append_pair("state", &material.state)
                .append_pair("nonce", &material.nonce);
            if matches!(mode, AuthMode::Register) {
                query.append_pair("kc_action", "register");
            }
        }
        Ok(url.into())
    }

    /// Adopt a freshly exchanged token response and end the loading state.
    ///
    /// Persists the token record and updates in-memory state as one unit,
    /// derives the session user from the token claims, and arms the refresh
    /// timer. On a terminal instance the response is silently dropped.
    ///
    /// # Errors
    /// [`SessionError::Api`] when the response has no access token;
    /// [`SessionError::Store`] when persisting fails (in-memory state is
    /// left untouched).
    pub async fn complete_login(&self, response: TokenResponse) -> Result<(), SessionError> {
        let result = self.ingest_tokens(&response).await;
        {
            let mut state = self.inner.state.write().await;
            state.is_loading = false;
        }
        if result.is_ok() {
            debug!("Login completed, session active");
        }
        result
    }

    /// Refresh the session immediately using the held refresh token.
    ///
    /// The scheduled proactive refresh goes through this same path; it is
    /// public so embedders can force a refresh after e.g. a 401.
    ///
    /// # Errors
    /// [`SessionError::LoggedOut`] on a terminal instance;
    /// [`SessionError::NotAuthenticated`] when no session is held;
    /// [`SessionError::Api`] when no refresh token is held or the refresh
    /// call fails.
    pub async fn refresh_session(&self) -> Result<(), SessionError> {
        if self.is_logged_out() {
            return Err(SessionError::LoggedOut);
        }

        let refresh_token = {
            let state = self.inner.state.read().await;
            match state.tokens.as_ref() {
                Some(tokens) => tokens
                    .refresh_token
                    .clone()
                    .ok_or(SessionError::Api(AuthApiError::NoRefreshToken))?,
                None => return Err(SessionError::NotAuthenticated),
            }
        };

        let response = self.inner.api.refresh_tokens(&refresh_token).await?;
        self.ingest_tokens(&response).await
    }

    async fn ingest_tokens(&self, response: &TokenResponse) -> Result<(), SessionError> {
        if self.is_logged_out() {
            debug!("Dropping token response arriving after logout");
            return Ok(());
        }

        let Some(tokens) = TokenSet::from_response(response) else {
            return Err(SessionError::Api(AuthApiError::MissingAccessToken));
        };
        let user = SessionUser::from_tokens(
            &tokens.access_token,
            tokens.id_token.as_deref(),
            &self.inner.config.client_id,
        );
        let expires_at = tokens.access_expires_at;

        {
            // The persisted record and the in-memory state change as one
            // unit; the write lock spans both so readers never observe one
            // without the other.
            let mut state = self.inner.state.write().await;
            if self.is_logged_out() {
                debug!("Dropping token response arriving after logout");
                return Ok(());
            }
            self.inner.store.save_tokens(&tokens).await?;
            state.tokens = Some(tokens);
            state.user = user;
        }

        self.schedule_refresh(expires_at);
        Ok(())
    }

    fn schedule_refresh(&self, expires_at: DateTime<Utc>) {
        if self.is_logged_out() {
            return;
        }

        // Arming bumps the generation, so any timer already in flight finds
        // itself stale at fire time even if the abort below loses the race.
        let generation = self.inner.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.refresh_delay(expires_at);
        debug!(delay_ms = delay.as_millis() as u64, "Arming proactive refresh timer");

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.scheduled_refresh(generation).await;
        });

        let mut slot = self
            .inner
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn refresh_delay(&self, expires_at: DateTime<Utc>) -> Duration {
        let ms_left = expires_at.signed_duration_since(Utc::now()).num_milliseconds();
        let leeway = self.inner.tuning.refresh_leeway.as_millis() as i64;
        let floor = self.inner.tuning.min_refresh_delay.as_millis() as i64;
        Duration::from_millis((ms_left - leeway).max(floor) as u64)
    }

    async fn scheduled_refresh(&self, generation: u64) {
        if self.is_logged_out() {
            return;
        }
        if self.inner.timer_generation.load(Ordering::SeqCst) != generation {
            debug!("Superseded refresh timer fired, ignoring");
            return;
        }

        let has_refresh_token = {
            let state = self.inner.state.read().await;
            match state.tokens.as_ref() {
                Some(tokens) => tokens.refresh_token.is_some(),
                None => return,
            }
        };

        if !has_refresh_token {
            error!("Access token reaching expiry with no refresh token, ending session");
            self.drop_refresh_handle();
            self.force_session_expired_logout().await;
            return;
        }

        match self.refresh_session().await {
            Ok(()) => info!("Access token refreshed ahead of expiry"),
            Err(SessionError::LoggedOut) => {}
            Err(e) => {
                error!(error = %e, "Proactive token refresh failed, ending session");
                self.drop_refresh_handle();
                self.force_session_expired_logout().await;
            }
        }
    }

    /// Detach the stored refresh handle without aborting it.
    ///
    /// The timer task calls this before forcing a logout; the logout path
    /// aborts whatever handle is in the slot, which must not be the very
    /// task performing the logout.
    fn drop_refresh_handle(&self) {
        let _ = self
            .inner
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn force_session_expired_logout(&self) {
        let _ = self
            .logout(LogoutOptions {
                redirect: false,
                to: None,
                error: Some(SESSION_EXPIRED_ERROR.to_string()),
            })
            .await;
    }

    /// End the session: revoke server-side, clear local state, go terminal.
    ///
    /// Revocation is bounded by the configured timeout and its failure never
    /// blocks the local teardown. The persisted record is deleted (which
    /// notifies other instances sharing the store), PKCE temp material is
    /// cleared, and a timestamped logout marker is left for the next page.
    ///
    /// Returns the navigation target when `options.redirect` is set, `None`
    /// otherwise; the caller performs any actual navigation. Idempotent:
    /// repeat calls return `None` without side effects.
    pub async fn logout(&self, options: LogoutOptions) -> Option<String> {
        if self.inner.logged_out.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!("Logging out");

        // Invalidate and stop the background tasks before touching state.
        self.inner.timer_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self
            .inner
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if let Some(task) = self
            .inner
            .watch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        let (access_token, refresh_token, id_token) = {
            let state = self.inner.state.read().await;
            match state.tokens.as_ref() {
                Some(tokens) => (
                    Some(tokens.access_token.clone()),
                    tokens.refresh_token.clone(),
                    tokens.id_token.clone(),
                ),
                None => (None, None, None),
            }
        };

        let revocation = self.inner.api.revoke_session(
            access_token.as_deref(),
            refresh_token.as_deref(),
            id_token.as_deref(),
        );
        match tokio::time::timeout(self.inner.tuning.revoke_timeout, revocation).await {
            Ok(true) => debug!("Server-side session revocation confirmed"),
            Ok(false) => warn!("Server-side session revocation reported failure"),
            Err(_) => warn!("Server-side session revocation timed out"),
        }

        {
            let mut state = self.inner.state.write().await;
            state.tokens = None;
            state.user = None;
            state.error = options.error;
            state.is_loading = false;
        }

        if let Err(e) = self.inner.store.clear_tokens().await {
            warn!(error = %e, "Failed to delete persisted token record during logout");
        }

        self.inner.temp.clear(&[
            TEMP_VERIFIER_KEY,
            TEMP_STATE_KEY,
            TEMP_NONCE_KEY,
            TEMP_REDIRECT_KEY,
        ]);
        self.inner
            .temp
            .store(JUST_LOGGED_OUT_KEY, &Utc::now().timestamp_millis().to_string());

        options
            .redirect
            .then(|| options.to.unwrap_or_else(|| DEFAULT_LOGOUT_TARGET.to_string()))
    }

    fn start_watch(&self) {
        let mut events = self.inner.store.watch();
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::RecordCleared) => {
                        if manager.is_logged_out() {
                            continue;
                        }
                        // Deletions only matter while this instance holds a
                        // session; an unauthenticated instance hearing some
                        // other instance's cleanup must stay usable.
                        let holding = manager.inner.state.read().await.tokens.is_some();
                        if !holding {
                            continue;
                        }
                        info!("Persisted token record deleted elsewhere, ending session");
                        manager.dispose_after_external_logout().await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Store watch lagged, re-checking the persisted record");
                        let holding = manager.inner.state.read().await.tokens.is_some();
                        if holding
                            && !manager.is_logged_out()
                            && !manager.inner.store.has_tokens().await
                        {
                            manager.dispose_after_external_logout().await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut slot = self
            .inner
            .watch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Local teardown when another instance deleted the shared record.
    ///
    /// No revocation, no record deletion, no navigation and no error: the
    /// instance that initiated the logout already did all of that.
    async fn dispose_after_external_logout(&self) {
        if self.inner.logged_out.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.timer_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self
            .inner
            .refresh_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let mut state = self.inner.state.write().await;
        state.tokens = None;
        state.user = None;
    }

    /// Whether startup restore is still running.
    #[must_use]
    pub async fn is_loading(&self) -> bool {
        self.inner.state.read().await.is_loading
    }

    /// The user derived from the current token claims, if authenticated.
    #[must_use]
    pub async fn user(&self) -> Option<SessionUser> {
        self.inner.state.read().await.user.clone()
    }

    /// Whether an unexpired access token is currently held.
    #[must_use]
    pub async fn is_authenticated(&self) -> bool {
        let state = self.inner.state.read().await;
        state
            .tokens
            .as_ref()
            .is_some_and(|t| !t.access_token.is_empty() && !t.is_expired(0))
    }

    /// The current access token, if any.
    #[must_use]
    pub async fn access_token(&self) -> Option<String> {
        let state = self.inner.state.read().await;
        state.tokens.as_ref().map(|t| t.access_token.clone())
    }

    /// The current refresh token, if any.
    #[must_use]
    pub async fn refresh_token(&self) -> Option<String> {
        let state = self.inner.state.read().await;
        state.tokens.as_ref().and_then(|t| t.refresh_token.clone())
    }

    /// The last session-level error message, if any.
    #[must_use]
    pub async fn last_error(&self) -> Option<String> {
        self.inner.state.read().await.error.clone()
    }

    /// Whether the current user carries the given realm or client role.
    #[must_use]
    pub async fn has_role(&self, role: &str) -> bool {
        let state = self.inner.state.read().await;
        state.user.as_ref().is_some_and(|u| u.has_role(role))
    }

    /// Whether this instance has been logged out (terminal).
    #[must_use]
    pub fn is_logged_out(&self) -> bool {
        self.inner.logged_out.load(Ordering::SeqCst)
    }

    /// Whether a logout marker was stamped within the given window.
    #[must_use]
    pub fn just_logged_out_within(&self, window: Duration) -> bool {
        let Some(raw) = self.inner.temp.read(JUST_LOGGED_OUT_KEY) else {
            return false;
        };
        let Ok(stamped_ms) = raw.parse::<i64>() else {
            return false;
        };
        let elapsed_ms = Utc::now().timestamp_millis() - stamped_ms;
        (0..=window.as_millis() as i64).contains(&elapsed_ms)
    }

    /// The OIDC configuration this manager was built with.
    #[must_use]
    pub fn config(&self) -> &OidcConfig {
        &self.inner.config
    }

    pub(crate) fn api(&self) -> &A {
        &self.inner.api
    }

    pub(crate) fn temp(&self) -> &TempStore {
        &self.inner.temp
    }
}

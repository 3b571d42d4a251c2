//! OAuth token lifecycle against the SingleKey ID identity provider.
//!
//! - Holds the access/refresh token pair and its expiry behind one mutex.
//! - The mutex is held across the refresh exchange, so concurrent callers
//!   queue behind an in-flight refresh and pick up its result.
//! - Refresh tokens may rotate; the newest one is persisted when a tokens
//!   file is configured.

use chrono::{DateTime, TimeDelta, Utc};
use http::StatusCode;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::{fs, time::Duration};

use crate::client::TransientFetchError;
use crate::transport::Transport;

pub const OAUTH_TOKEN_URL: &str = "https://singlekey-id.com/auth/connect/token";
pub const OAUTH_CLIENT_ID: &str = "762162C0-FA2D-4540-AE66-6489F189FADC";
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch seconds on disk.
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    /// State seeded only with a refresh token; the first use triggers a refresh.
    pub fn from_refresh_token(refresh_token: impl Into<String>) -> Self {
        TokenState {
            access_token: String::new(),
            refresh_token: refresh_token.into().trim().to_string(),
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        let mut de = serde_json::Deserializer::from_str(&raw);
        serde_path_to_error::deserialize(&mut de).map_err(|e| format!("invalid tokens file {}: {}", path.display(), e))
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self).map_err(|e| format!("serialize tokens failed: {}", e))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| format!("failed to write {}: {}", tmp.display(), e))?;
        fs::rename(&tmp, path).map_err(|e| format!("failed to replace {}: {}", path.display(), e))
    }

    fn expires_within(&self, margin: TimeDelta, now: DateTime<Utc>) -> bool {
        self.access_token.is_empty() || now + margin >= self.expires_at
    }
}

/// Bearer credential handed out to API calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken(pub String);

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The identity provider refused the refresh token. Terminal until new
/// credentials are supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingRefreshToken,
    Rejected { status: u16, message: String },
}

impl core::fmt::Display for AuthError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AuthError::MissingRefreshToken => write!(f, "no refresh token available"),
            AuthError::Rejected { status, message } => write!(f, "credentials rejected (http {}): {}", status, message),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug)]
pub enum TokenError {
    Auth(AuthError),
    Transient(TransientFetchError),
}

impl core::fmt::Display for TokenError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TokenError::Auth(e) => write!(f, "token refresh failed: {}", e),
            TokenError::Transient(e) => write!(f, "token refresh failed: {}", e),
        }
    }
}

impl std::error::Error for TokenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TokenError::Auth(e) => Some(e),
            TokenError::Transient(e) => Some(e),
        }
    }
}

impl From<AuthError> for TokenError {
    fn from(value: AuthError) -> Self {
        TokenError::Auth(value)
    }
}

impl From<TransientFetchError> for TokenError {
    fn from(value: TransientFetchError) -> Self {
        TokenError::Transient(value)
    }
}

#[derive(Deserialize)]
struct GrantResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct TokenStore {
    transport: Arc<dyn Transport>,
    state: Mutex<TokenState>,
    /// Bumped on every successful refresh.
    generation: AtomicU64,
    margin: TimeDelta,
    tokens_file: Option<PathBuf>,
}

impl TokenStore {
    pub fn new(transport: Arc<dyn Transport>, initial: TokenState, margin: Duration) -> Self {
        debug!(
            "TokenStore init: refresh_token len={} hint={}",
            initial.refresh_token.len(),
            hint(&initial.refresh_token)
        );
        TokenStore {
            transport,
            state: Mutex::new(initial),
            generation: AtomicU64::new(0),
            margin: TimeDelta::from_std(margin).unwrap_or(TimeDelta::minutes(5)),
            tokens_file: None,
        }
    }

    /// Persist every refreshed state to `path`.
    pub fn with_tokens_file(mut self, path: Option<PathBuf>) -> Self {
        self.tokens_file = path;
        self
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Access token valid for at least the safety margin, refreshing first if needed.
    pub fn current_token(&self) -> Result<AccessToken, TokenError> {
        let mut state = self.lock();
        if state.expires_within(self.margin, Utc::now()) {
            debug!("Access token missing or within expiry margin; refreshing");
            self.refresh_locked(&mut state)?;
        }
        Ok(AccessToken(state.access_token.clone()))
    }

    /// Exchange the refresh token for a new pair. A caller that arrives while
    /// another refresh is in flight reuses that refresh's result.
    pub fn refresh(&self) -> Result<AccessToken, TokenError> {
        let seen = self.generation.load(Ordering::SeqCst);
        let mut state = self.lock();
        if self.generation.load(Ordering::SeqCst) == seen {
            self.refresh_locked(&mut state)?;
        } else {
            debug!("Refresh completed while waiting; reusing the new token");
        }
        Ok(AccessToken(state.access_token.clone()))
    }

    /// Drop `rejected` after the API refused it. Refreshes only if it is
    /// still the stored token, otherwise returns the replacement.
    pub fn invalidate(&self, rejected: &AccessToken) -> Result<AccessToken, TokenError> {
        let mut state = self.lock();
        if state.access_token == rejected.0 {
            info!("Access token rejected by API; forcing refresh");
            self.refresh_locked(&mut state)?;
        } else {
            debug!("Rejected token already replaced; reusing the new token");
        }
        Ok(AccessToken(state.access_token.clone()))
    }

    pub fn snapshot(&self) -> TokenState {
        self.lock().clone()
    }

    /// Install externally supplied credentials.
    pub fn replace(&self, new_state: TokenState) {
        let mut state = self.lock();
        *state = new_state;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("Token state replaced (refresh_token hint={})", hint(&state.refresh_token));
    }

    fn refresh_locked(&self, state: &mut TokenState) -> Result<(), TokenError> {
        let refresh_token = state.refresh_token.trim().to_string();
        if refresh_token.is_empty() {
            return Err(AuthError::MissingRefreshToken.into());
        }
        debug!(
            "POST {} grant_type=refresh_token refresh_token hint={}",
            OAUTH_TOKEN_URL,
            hint(&refresh_token)
        );

        let reply = self
            .transport
            .post_form(
                OAUTH_TOKEN_URL,
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", OAUTH_CLIENT_ID),
                    ("refresh_token", refresh_token.as_str()),
                ],
            )
            .map_err(TransientFetchError::Transport)?;

        match reply.status {
            s if s.is_success() => {}
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Token endpoint rejected refresh token (http {})", reply.status.as_u16());
                return Err(AuthError::Rejected {
                    status: reply.status.as_u16(),
                    message: reply.body,
                }
                .into());
            }
            s => {
                return Err(TransientFetchError::Http {
                    status: s.as_u16(),
                    message: reply.body,
                }
                .into());
            }
        }

        let mut de = serde_json::Deserializer::from_str(&reply.body);
        let grant: GrantResponse =
            serde_path_to_error::deserialize(&mut de).map_err(|e| TransientFetchError::Json(e.to_string()))?;

        let rotated = grant
            .refresh_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| refresh_token.clone());
        if rotated != refresh_token {
            debug!("Refresh token rotated old={} new={}", hint(&refresh_token), hint(&rotated));
        } else {
            debug!("Refresh token not rotated");
        }

        let (expires_in, expires_at) = expiry_after(grant.expires_in, Utc::now());
        *state = TokenState {
            access_token: grant.access_token,
            refresh_token: rotated,
            expires_at,
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!("Access token refreshed; expires in {}s", expires_in);

        if let Some(path) = &self.tokens_file
            && let Err(e) = state.save(path)
        {
            warn!("Persisting refreshed tokens failed: {}", e);
        }
        Ok(())
    }
}

/// Expiry for a grant's `expires_in`; missing, non-positive or out-of-range
/// values fall back to the default lifetime.
fn expiry_after(expires_in: Option<i64>, now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
    let requested = expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    let expiry = Some(requested)
        .filter(|secs| *secs > 0)
        .and_then(TimeDelta::try_seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime));
    match expiry {
        Some(at) => (requested, at),
        None => {
            warn!("Token endpoint sent unusable expires_in={}; assuming {}s", requested, DEFAULT_EXPIRES_IN_SECS);
            (DEFAULT_EXPIRES_IN_SECS, now + TimeDelta::seconds(DEFAULT_EXPIRES_IN_SECS))
        }
    }
}

/// Short, log-safe rendering of a secret.
pub fn hint(token: &str) -> String {
    let chars = token.chars().collect::<Vec<_>>();
    match chars.len() {
        0 => "<empty>".to_string(),
        n if n < 12 => "*".repeat(n),
        n => format!(
            "{}…{}",
            chars[..6].iter().collect::<String>(),
            chars[n - 6..].iter().collect::<String>()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportFailure;
    use crate::transport::testing::ScriptedTransport;
    use std::sync::Barrier;
    use std::thread;

    const GRANT: &str = r#"{"access_token":"access-2","refresh_token":"refresh-2","expires_in":3600}"#;

    fn store_with(transport: &Arc<ScriptedTransport>, state: TokenState) -> TokenStore {
        TokenStore::new(transport.clone(), state, Duration::from_secs(300))
    }

    fn valid_state() -> TokenState {
        TokenState {
            access_token: "access-1".into(),
            refresh_token: "refresh-1".into(),
            expires_at: Utc::now() + TimeDelta::hours(1),
        }
    }

    #[test]
    fn valid_token_needs_no_network() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = store_with(&transport, valid_state());

        for _ in 0..5 {
            assert_eq!(store.current_token().unwrap().as_str(), "access-1");
        }
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn token_within_margin_is_refreshed() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(OAUTH_TOKEN_URL, 200, GRANT);
        let mut state = valid_state();
        state.expires_at = Utc::now() + TimeDelta::minutes(4);
        let store = store_with(&transport, state);

        assert_eq!(store.current_token().unwrap().as_str(), "access-2");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.refresh_token, "refresh-2");
        assert!(snapshot.expires_at > Utc::now() + TimeDelta::minutes(59));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        let body = calls[0].body.as_deref().unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=refresh-1"));
        assert!(body.contains(OAUTH_CLIENT_ID));
    }

    #[test]
    fn seeded_refresh_token_refreshes_on_first_use() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(OAUTH_TOKEN_URL, 200, GRANT);
        let store = store_with(&transport, TokenState::from_refresh_token("  refresh-1\n"));

        assert_eq!(store.current_token().unwrap().as_str(), "access-2");
        assert!(transport.calls()[0].body.as_deref().unwrap().ends_with("refresh_token=refresh-1"));
    }

    #[test]
    fn concurrent_callers_share_one_refresh() {
        let transport = Arc::new(ScriptedTransport::with_delay(Duration::from_millis(50)));
        transport.push_ok(OAUTH_TOKEN_URL, 200, GRANT);
        let mut state = valid_state();
        state.expires_at = Utc::now();
        let store = store_with(&transport, state);

        let tokens = thread::scope(|s| {
            let handles = (0..8).map(|_| s.spawn(|| store.current_token())).collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect::<Vec<_>>()
        });

        assert_eq!(transport.calls_to(OAUTH_TOKEN_URL), 1);
        assert!(tokens.iter().all(|t| t.as_str() == "access-2"));
    }

    #[test]
    fn concurrent_explicit_refreshes_share_one_exchange() {
        let transport = Arc::new(ScriptedTransport::with_delay(Duration::from_millis(200)));
        transport.push_ok(OAUTH_TOKEN_URL, 200, GRANT);
        let store = store_with(&transport, valid_state());
        let barrier = Barrier::new(4);

        let tokens = thread::scope(|s| {
            let handles = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        store.refresh()
                    })
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect::<Vec<_>>()
        });

        assert_eq!(transport.calls_to(OAUTH_TOKEN_URL), 1);
        assert!(tokens.iter().all(|t| t.as_str() == "access-2"));
    }

    #[test]
    fn rejected_refresh_leaves_state_untouched() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(OAUTH_TOKEN_URL, 400, r#"{"error":"invalid_grant"}"#);
        let mut state = valid_state();
        state.expires_at = Utc::now();
        let store = store_with(&transport, state.clone());

        match store.current_token() {
            Err(TokenError::Auth(AuthError::Rejected { status, .. })) => assert_eq!(status, 400),
            other => panic!("expected auth error, got {:?}", other),
        }
        assert_eq!(store.snapshot(), state);
    }

    #[test]
    fn network_failure_during_refresh_is_transient() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(OAUTH_TOKEN_URL, Err(TransportFailure::Io("connection reset".into())));
        transport.push_ok(OAUTH_TOKEN_URL, 503, "maintenance");
        let mut state = valid_state();
        state.expires_at = Utc::now();
        let store = store_with(&transport, state.clone());

        assert!(matches!(store.current_token(), Err(TokenError::Transient(_))));
        assert!(matches!(
            store.current_token(),
            Err(TokenError::Transient(TransientFetchError::Http { status: 503, .. }))
        ));
        assert_eq!(store.snapshot(), state);
    }

    #[test]
    fn missing_rotation_keeps_previous_refresh_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(OAUTH_TOKEN_URL, 200, r#"{"access_token":"access-2"}"#);
        let store = store_with(&transport, TokenState::from_refresh_token("refresh-1"));

        store.current_token().unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.refresh_token, "refresh-1");
        let expected = Utc::now() + TimeDelta::seconds(DEFAULT_EXPIRES_IN_SECS);
        assert!((expected - snapshot.expires_at).num_seconds().abs() <= 5);
    }

    #[test]
    fn unusable_expires_in_falls_back_to_default_lifetime() {
        for expires_in in ["9223372036854775807", "-60", "0"] {
            let transport = Arc::new(ScriptedTransport::new());
            let grant = format!(
                r#"{{"access_token":"access-2","refresh_token":"refresh-2","expires_in":{}}}"#,
                expires_in
            );
            transport.push_ok(OAUTH_TOKEN_URL, 200, &grant);
            let store = store_with(&transport, TokenState::from_refresh_token("refresh-1"));

            assert_eq!(store.current_token().unwrap().as_str(), "access-2", "expires_in={}", expires_in);
            let snapshot = store.snapshot();
            assert_eq!(snapshot.refresh_token, "refresh-2");
            let expected = Utc::now() + TimeDelta::seconds(DEFAULT_EXPIRES_IN_SECS);
            assert!((expected - snapshot.expires_at).num_seconds().abs() <= 5, "expires_in={}", expires_in);

            // The stored token is usable without another exchange.
            store.current_token().unwrap();
            assert_eq!(transport.calls_to(OAUTH_TOKEN_URL), 1);
        }
    }

    #[test]
    fn empty_refresh_token_is_an_auth_error_without_network() {
        let transport = Arc::new(ScriptedTransport::new());
        let store = store_with(&transport, TokenState::from_refresh_token("   "));

        assert!(matches!(
            store.current_token(),
            Err(TokenError::Auth(AuthError::MissingRefreshToken))
        ));
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn invalidate_refreshes_only_the_current_token() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(OAUTH_TOKEN_URL, 200, GRANT);
        let store = store_with(&transport, valid_state());

        let stale = AccessToken("access-1".into());
        assert_eq!(store.invalidate(&stale).unwrap().as_str(), "access-2");
        // A second caller holding the same stale token reuses the refresh.
        assert_eq!(store.invalidate(&stale).unwrap().as_str(), "access-2");
        assert_eq!(transport.calls_to(OAUTH_TOKEN_URL), 1);
    }

    #[test]
    fn refreshed_state_is_persisted() {
        let dir = std::env::temp_dir().join(format!("tokens-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.json");

        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(OAUTH_TOKEN_URL, 200, GRANT);
        let store = store_with(&transport, TokenState::from_refresh_token("refresh-1")).with_tokens_file(Some(path.clone()));
        store.current_token().unwrap();

        let loaded = TokenState::load(&path).unwrap();
        assert_eq!(loaded.access_token, "access-2");
        assert_eq!(loaded.refresh_token, "refresh-2");
        assert_eq!(loaded.expires_at.timestamp(), store.snapshot().expires_at.timestamp());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn loads_epoch_seconds_tokens_file() {
        let state: TokenState =
            serde_json::from_str(r#"{"access_token":"a","refresh_token":"r","expires_at":1760000000}"#).unwrap();
        assert_eq!(state.expires_at.timestamp(), 1_760_000_000);
    }

    #[test]
    fn hint_redacts_secrets() {
        assert_eq!(hint(""), "<empty>");
        assert_eq!(hint("short"), "*****");
        assert_eq!(hint("abcdef0123456789uvwxyz"), "abcdef…uvwxyz");
    }
}

//! Blocking client for the Bosch/IVT Pointt API (gateway discovery and bulk
//! energy recordings).
//!
//! - Bearer tokens come from [`TokenStore`]; a 401/403 forces exactly one refresh
//!   and a single retry of the call.
//! - Two independent retry layers: network failures (timeouts, resets, 5xx)
//!   and the bulk endpoint's habit of answering with an empty payload.
//! - Every failure is classified as auth, transient or cancelled before it
//!   leaves this module.

use http::StatusCode;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::models::energy::{Recording, Window};
use crate::models::pointt::{BulkRequest, BulkResponse, Gateway, GatewayId, recordings_from_bulk};
use crate::shutdown::{Cancelled, Shutdown};
use crate::tokens::{AccessToken, AuthError, TokenError, TokenStore};
use crate::transport::{HttpReply, Transport, TransportFailure};

pub const BASE_URL: &str = "https://pointt-api.bosch-thermotechnology.com/pointt-api/api/v1";

/// Network-level failure that may clear up by the next cycle.
#[derive(Debug)]
pub enum TransientFetchError {
    Transport(TransportFailure),
    Http { status: u16, message: String },
    Json(String),
}

impl TransientFetchError {
    fn is_retryable(&self) -> bool {
        match self {
            TransientFetchError::Transport(_) => true,
            TransientFetchError::Http { status, .. } => *status >= 500 || *status == 429,
            TransientFetchError::Json(_) => false,
        }
    }
}

impl core::fmt::Display for TransientFetchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransientFetchError::Transport(t) => write!(f, "transport error: {}", t),
            TransientFetchError::Http { status, message } => write!(f, "http {}: {}", status, message),
            TransientFetchError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for TransientFetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransientFetchError::Transport(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    Auth(AuthError),
    Transient(TransientFetchError),
    Cancelled,
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Auth(e) => write!(f, "auth error: {}", e),
            ClientError::Transient(e) => write!(f, "{}", e),
            ClientError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Auth(e) => Some(e),
            ClientError::Transient(e) => Some(e),
            ClientError::Cancelled => None,
        }
    }
}

impl From<TokenError> for ClientError {
    fn from(value: TokenError) -> Self {
        match value {
            TokenError::Auth(e) => ClientError::Auth(e),
            TokenError::Transient(e) => ClientError::Transient(e),
        }
    }
}

impl From<TransientFetchError> for ClientError {
    fn from(value: TransientFetchError) -> Self {
        ClientError::Transient(value)
    }
}

impl From<TransportFailure> for ClientError {
    fn from(value: TransportFailure) -> Self {
        ClientError::Transient(TransientFetchError::Transport(value))
    }
}

impl From<Cancelled> for ClientError {
    fn from(_: Cancelled) -> Self {
        ClientError::Cancelled
    }
}

/// Bounded retry with linearly increasing delay (`base_delay * attempt`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: NonZeroU32::MIN.saturating_add(2),
            base_delay: Duration::from_millis(800),
        }
    }
}

/// Result of a bulk fetch. `NoData` is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOutcome {
    Recordings(Vec<Recording>),
    NoData,
}

fn rejects_token(status: StatusCode) -> bool {
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
}

pub struct PointtClient {
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenStore>,
    shutdown: Shutdown,
    /// Re-issues a bulk call that came back empty.
    empty_payload: RetryPolicy,
    /// Re-issues any call that failed below HTTP or with 5xx/429.
    network: RetryPolicy,
}

impl PointtClient {
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<TokenStore>, shutdown: Shutdown) -> Self {
        PointtClient {
            transport,
            tokens,
            shutdown,
            empty_payload: RetryPolicy::default(),
            network: RetryPolicy::default(),
        }
    }

    pub fn with_policies(mut self, empty_payload: RetryPolicy, network: RetryPolicy) -> Self {
        self.empty_payload = empty_payload;
        self.network = network;
        self
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    fn url(path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", BASE_URL, path)
        } else {
            format!("{}/{}", BASE_URL, path)
        }
    }

    /// Send with the current bearer token; on 401/403 refresh once and resend.
    fn authorized<F>(&self, send: F) -> Result<HttpReply, ClientError>
    where
        F: Fn(&AccessToken) -> Result<HttpReply, TransportFailure>,
    {
        let token = self.tokens.current_token()?;
        let reply = send(&token)?;
        if !rejects_token(reply.status) {
            return Ok(reply);
        }

        debug!("API answered {}; invalidating access token", reply.status.as_u16());
        let token = self.tokens.invalidate(&token)?;
        let reply = send(&token)?;
        if rejects_token(reply.status) {
            warn!("API rejected a freshly refreshed access token");
            return Err(ClientError::Auth(AuthError::Rejected {
                status: reply.status.as_u16(),
                message: reply.body,
            }));
        }
        Ok(reply)
    }

    fn decode<T: DeserializeOwned>(reply: HttpReply) -> Result<T, ClientError> {
        if !reply.status.is_success() {
            return Err(TransientFetchError::Http {
                status: reply.status.as_u16(),
                message: reply.body,
            }
            .into());
        }
        let mut de = serde_json::Deserializer::from_str(&reply.body);
        serde_path_to_error::deserialize(&mut de).map_err(|e| TransientFetchError::Json(e.to_string()).into())
    }

    /// Network retry layer.
    fn with_network_retry<T>(&self, what: &str, op: impl Fn() -> Result<T, ClientError>) -> Result<T, ClientError> {
        let attempts = self.network.max_attempts.get();
        let mut attempt = 1;
        loop {
            self.shutdown.check()?;
            match op() {
                Err(ClientError::Transient(e)) if e.is_retryable() && attempt < attempts => {
                    warn!("{} failed (attempt {}/{}): {}; retrying", what, attempt, attempts, e);
                    self.shutdown.sleep(self.network.delay_after(attempt))?;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    pub fn fetch_gateways(&self) -> Result<BTreeSet<GatewayId>, ClientError> {
        let url = Self::url("/gateways/");
        debug!("GET {}", url);
        let gateways: Vec<Gateway> = self.with_network_retry("gateways", || {
            let reply = self.authorized(|t| self.transport.get(&url, t.as_str()))?;
            Self::decode(reply)
        })?;
        for g in &gateways {
            debug!("Gateway {} (type={})", g.device_id, g.device_type.as_deref().unwrap_or("-"));
        }
        Ok(gateways.into_iter().map(|g| g.device_id).collect())
    }

    fn bulk_once(&self, gateway: &GatewayId, window: Window) -> Result<Vec<Recording>, ClientError> {
        let url = Self::url("/bulk");
        let body = serde_json::to_value([BulkRequest::for_window(gateway, window)])
            .map_err(|e| TransientFetchError::Json(e.to_string()))?;
        debug!("POST {} body={}", url, body);
        let reply = self.authorized(|t| self.transport.post_json(&url, t.as_str(), &body))?;
        let responses: Vec<BulkResponse> = Self::decode(reply)?;
        Ok(recordings_from_bulk(&responses, window))
    }

    /// Bulk recordings for `window`, re-asking while the payload is empty.
    pub fn fetch_bulk_recordings(&self, gateway: &GatewayId, window: Window) -> Result<BulkOutcome, ClientError> {
        let attempts = self.empty_payload.max_attempts.get();
        let what = format!("bulk {}", window);
        for attempt in 1..=attempts {
            let recordings = self.with_network_retry(&what, || self.bulk_once(gateway, window))?;
            if !recordings.is_empty() {
                debug!("{}: {} recording(s) on attempt {}", what, recordings.len(), attempt);
                return Ok(BulkOutcome::Recordings(recordings));
            }
            if attempt < attempts {
                warn!("{}: empty payload (attempt {}/{}); retrying", what, attempt, attempts);
                self.shutdown.sleep(self.empty_payload.delay_after(attempt))?;
            }
        }
        info!("{}: no data after {} attempt(s)", what, attempts);
        Ok(BulkOutcome::NoData)
    }
}

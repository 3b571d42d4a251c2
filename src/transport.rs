//! Blocking HTTP transport shared by the token store and the cloud client.
//!
//! Everything that talks to the network goes through [`Transport`], so the
//! OAuth and API layers only ever see a status code and a body.

use http::StatusCode;
use std::time::Duration;
use ureq::Agent;

#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        HttpReply {
            status,
            body: body.into(),
        }
    }
}

/// A request that never produced an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout(String),
    Io(String),
}

impl core::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportFailure::Timeout(s) => write!(f, "timeout: {}", s),
            TransportFailure::Io(s) => write!(f, "io: {}", s),
        }
    }
}

impl std::error::Error for TransportFailure {}

impl From<ureq::Error> for TransportFailure {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Timeout(t) => TransportFailure::Timeout(t.to_string()),
            other => TransportFailure::Io(other.to_string()),
        }
    }
}

pub trait Transport: Send + Sync {
    fn get(&self, url: &str, bearer: &str) -> Result<HttpReply, TransportFailure>;

    fn post_json(&self, url: &str, bearer: &str, body: &serde_json::Value) -> Result<HttpReply, TransportFailure>;

    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpReply, TransportFailure>;
}

pub struct UreqTransport {
    agent: Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        // Statuses are classified by the callers, not turned into errors here.
        let agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        UreqTransport { agent }
    }

    fn into_reply(mut resp: http::Response<ureq::Body>) -> Result<HttpReply, TransportFailure> {
        let status = resp.status();
        let body = resp.body_mut().read_to_string()?;
        Ok(HttpReply::new(status, body))
    }
}

impl Transport for UreqTransport {
    fn get(&self, url: &str, bearer: &str) -> Result<HttpReply, TransportFailure> {
        let resp = self
            .agent
            .get(url)
            .header("Accept", "application/json")
            .header("Authorization", &format!("Bearer {}", bearer))
            .call()?;
        Self::into_reply(resp)
    }

    fn post_json(&self, url: &str, bearer: &str, body: &serde_json::Value) -> Result<HttpReply, TransportFailure> {
        let resp = self
            .agent
            .post(url)
            .header("Accept", "application/json")
            .header("Authorization", &format!("Bearer {}", bearer))
            .send_json(body)?;
        Self::into_reply(resp)
    }

    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpReply, TransportFailure> {
        let resp = self
            .agent
            .post(url)
            .header("Accept", "application/json")
            .send_form(form.iter().copied())?;
        Self::into_reply(resp)
    }
}

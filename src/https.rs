// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::time::Duration;
use std::io::Read;
use thiserror::Error;

/// Upper bound for a single outbound request, including connect and body.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("HTTP error")]
    Http(#[from] Box<ureq::Error>),
    #[error("failed to read HTTP response")]
    Io(#[from] std::io::Error),
    #[error("no response for {0}")]
    NotFound(String),
}

/// Outbound HTTP(S) access used by issuers and validators.
///
/// Every request carries its own timeout so a hanging endpoint fails the
/// surrounding issue or validate call instead of blocking it.
pub trait HttpsGetter: Send + Sync {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, HttpError>;

    fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<Vec<u8>, HttpError>;
}

pub struct UreqGetter {
    agent: ureq::Agent,
}

impl UreqGetter {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl Default for UreqGetter {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

fn read_body(response: ureq::Response) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();
    response.into_reader().read_to_end(&mut body)?;
    Ok(body)
}

impl HttpsGetter for UreqGetter {
    fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, HttpError> {
        let mut request = self.agent.get(url);
        for (name, value) in headers {
            request = request.set(name, value);
        }
        let response = request.call().map_err(Box::new)?;
        read_body(response)
    }

    fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<Vec<u8>, HttpError> {
        let mut request = self.agent.post(url);
        for (name, value) in headers {
            request = request.set(name, value);
        }
        let response = request.send_json(body).map_err(Box::new)?;
        read_body(response)
    }
}

/// Serves canned bodies keyed by URL. Unknown URLs fail like an unreachable host.
#[cfg(any(test, feature = "simulator"))]
#[derive(Default, Clone)]
pub struct StaticGetter {
    responses: std::collections::HashMap<String, Vec<u8>>,
    requests: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(any(test, feature = "simulator"))]
impl StaticGetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.responses.insert(url.to_string(), body.into());
        self
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn respond(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_string());
        }
        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| HttpError::NotFound(url.to_string()))
    }
}

#[cfg(any(test, feature = "simulator"))]
impl HttpsGetter for StaticGetter {
    fn get(&self, url: &str, _headers: &[(&str, &str)]) -> Result<Vec<u8>, HttpError> {
        self.respond(url)
    }

    fn post_json(
        &self,
        url: &str,
        _headers: &[(&str, &str)],
        _body: &serde_json::Value,
    ) -> Result<Vec<u8>, HttpError> {
        self.respond(url)
    }
}

//! Typed HTTP client for synchronous service-to-service calls.
//!
//! Every call site gets an explicit timeout and an explicit error taxonomy;
//! no downstream call is allowed to hang a worker indefinitely.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::instrument;

use crate::registry::{RegistryError, ServiceRegistry};

/// Default service-to-service timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Downstream call failure. User-facing callers map this to 502; internal
/// callers treat it as a saga/action failure.
#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("downstream '{service}' timed out")]
    Timeout { service: String },

    #[error("downstream '{service}' returned {status}")]
    Status { service: String, status: u16 },

    #[error("downstream '{service}' unreachable: {detail}")]
    Transport { service: String, detail: String },

    #[error("downstream '{service}' returned malformed body: {detail}")]
    Decode { service: String, detail: String },
}

impl DownstreamError {
    /// Transient failures are worth retrying (timeouts, 5xx, transport).
    pub fn is_transient(&self) -> bool {
        match self {
            DownstreamError::Timeout { .. } | DownstreamError::Transport { .. } => true,
            DownstreamError::Status { status, .. } => *status >= 500,
            DownstreamError::Registry(_) | DownstreamError::Decode { .. } => false,
        }
    }
}

/// Blocking client bound to one logical service.
///
/// Used from worker threads (action executors, saga steps); request handlers
/// never call downstream services inline.
pub struct ServiceClient {
    service: String,
    base_url: String,
    http: reqwest::blocking::Client,
}

impl ServiceClient {
    pub fn new(registry: &ServiceRegistry, service: &str) -> Result<Self, DownstreamError> {
        Self::with_timeout(registry, service, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        registry: &ServiceRegistry,
        service: &str,
        timeout: Duration,
    ) -> Result<Self, DownstreamError> {
        let base_url = registry.get_api_url(service)?;
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DownstreamError::Transport {
                service: service.to_string(),
                detail: e.to_string(),
            })?;
        Ok(Self {
            service: service.to_string(),
            base_url,
            http,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// POST a JSON body to `<api root><path>`, propagating the caller's
    /// bearer token when present.
    #[instrument(skip(self, body, bearer), fields(service = %self.service, path = %path), err)]
    pub fn post_json(
        &self,
        path: &str,
        body: &JsonValue,
        bearer: Option<&str>,
    ) -> Result<JsonValue, DownstreamError> {
        let mut req = self.http.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req.send().map_err(|e| self.map_transport(e))?;
        self.decode(resp)
    }

    #[instrument(skip(self, bearer), fields(service = %self.service, path = %path), err)]
    pub fn get_json(
        &self,
        path: &str,
        bearer: Option<&str>,
    ) -> Result<JsonValue, DownstreamError> {
        let mut req = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req.send().map_err(|e| self.map_transport(e))?;
        self.decode(resp)
    }

    fn map_transport(&self, e: reqwest::Error) -> DownstreamError {
        if e.is_timeout() {
            DownstreamError::Timeout {
                service: self.service.clone(),
            }
        } else {
            DownstreamError::Transport {
                service: self.service.clone(),
                detail: e.to_string(),
            }
        }
    }

    fn decode<T: DeserializeOwned>(
        &self,
        resp: reqwest::blocking::Response,
    ) -> Result<T, DownstreamError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(DownstreamError::Status {
                service: self.service.clone(),
                status: status.as_u16(),
            });
        }
        resp.json().map_err(|e| DownstreamError::Decode {
            service: self.service.clone(),
            detail: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout = DownstreamError::Timeout {
            service: "pos".to_string(),
        };
        let server_err = DownstreamError::Status {
            service: "pos".to_string(),
            status: 503,
        };
        let client_err = DownstreamError::Status {
            service: "pos".to_string(),
            status: 404,
        };
        assert!(timeout.is_transient());
        assert!(server_err.is_transient());
        assert!(!client_err.is_transient());
    }

    #[test]
    fn unknown_service_fails_at_construction() {
        let registry = ServiceRegistry::from_map(Default::default());
        assert!(ServiceClient::new(&registry, "nope").is_err());
    }
}

use std::time::Duration;

use reqwest::{header::USER_AGENT, Client, StatusCode};
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use crate::{config::RelayConfig, relay::OutboundPayload};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("API_ENDPOINT is not configured")]
    NotConfigured,

    #[error("couldn't reach {endpoint}: {source}")]
    Unreachable {
        endpoint: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} didn't respond within {timeout:?}")]
    Timeout { endpoint: Url, timeout: Duration },

    #[error("{endpoint} responded with {status}: {body}")]
    Status {
        endpoint: Url,
        status: StatusCode,
        body: String,
    },

    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: Url,
        #[source]
        source: reqwest::Error,
    },
}

/// What the downstream API answered to a successful delivery.
#[derive(Debug)]
pub struct ForwardResponse {
    pub status: StatusCode,
    pub body: String,
}

/// Sends assembled payloads to the downstream analysis API, once each.
pub struct Forwarder {
    http: Client,
    endpoint: Option<Url>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(config: &RelayConfig) -> reqwest::Result<Self> {
        let http = Client::builder().timeout(config.forward_timeout).build()?;

        Ok(Self {
            http,
            endpoint: config.api_endpoint.clone(),
            timeout: config.forward_timeout,
        })
    }

    pub async fn forward(&self, payload: &OutboundPayload) -> Result<ForwardResponse, ForwardError> {
        let endpoint = self.endpoint.as_ref().ok_or(ForwardError::NotConfigured)?;
        trace!("forwarding payload to {}", endpoint);

        let response = self
            .http
            .post(endpoint.clone())
            .header(USER_AGENT, concat!("prrelay/", env!("CARGO_PKG_VERSION")))
            .json(payload)
            .send()
            .await
            .map_err(|e| self.classify(endpoint, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.classify(endpoint, e))?;

        if !status.is_success() {
            return Err(ForwardError::Status {
                endpoint: endpoint.clone(),
                status,
                body,
            });
        }

        debug!("{} accepted the payload with {}", endpoint, status);
        Ok(ForwardResponse { status, body })
    }

    fn classify(&self, endpoint: &Url, source: reqwest::Error) -> ForwardError {
        let endpoint = endpoint.clone();
        if source.is_timeout() {
            ForwardError::Timeout {
                endpoint,
                timeout: self.timeout,
            }
        } else if source.is_connect() {
            ForwardError::Unreachable { endpoint, source }
        } else {
            ForwardError::Request { endpoint, source }
        }
    }
}

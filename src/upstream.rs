//! Upstream forwarding capability.
//!
//! The priced API behind the gateway is opaque: the engine forwards the
//! authorized request under a bounded timeout and classifies the outcome as
//! success, business reject (the service explicitly refused the request),
//! timeout, or transport failure. The coordinator turns those outcomes
//! into settle/refund decisions.

use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

/// The request to forward after payment is escrowed.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// HTTP method.
    pub method: String,
    /// Resource path (joined onto the upstream base URL).
    pub path: String,
    /// Request body.
    pub body: Bytes,
    /// Content type of the body, if any.
    pub content_type: Option<String>,
}

impl ForwardRequest {
    /// Convenience constructor for a JSON POST.
    #[must_use]
    pub fn post_json(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            method: "POST".to_string(),
            path: path.into(),
            body: body.into(),
            content_type: Some("application/json".to_string()),
        }
    }
}

/// The upstream service's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    /// HTTP status returned by the upstream.
    pub status: u16,
    /// Response body, passed through untouched.
    pub body: Bytes,
    /// Content type of the body, if any.
    pub content_type: Option<String>,
}

/// Why a forward failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// The service explicitly rejected the request (4xx-equivalent).
    /// The claim is refunded and the rejection is relayed to the agent.
    #[error("upstream rejected request with status {status}")]
    BusinessReject {
        /// Upstream status code.
        status: u16,
        /// Upstream error body, relayed to the agent.
        body: Bytes,
    },

    /// The forward exceeded its deadline.
    #[error("upstream call timed out")]
    Timeout,

    /// Connection-level failure or upstream server fault.
    #[error("upstream transport failure: {0}")]
    Transport(String),
}

/// Capability for executing the real call against the priced API.
#[async_trait::async_trait]
pub trait UpstreamGateway: Send + Sync {
    /// Forward `request`, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns the classified [`UpstreamError`] on any non-success outcome.
    async fn forward(
        &self,
        request: &ForwardRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

/// Configuration for the HTTP upstream forwarder.
#[derive(Debug, Clone)]
pub struct HttpUpstreamConfig {
    /// Base URL of the priced API.
    pub base_url: String,
}

/// Forwards requests to the priced API over HTTP.
pub struct HttpUpstream {
    config: HttpUpstreamConfig,
    client: reqwest::Client,
}

impl HttpUpstream {
    /// Create a new upstream forwarder.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is empty or the client fails to
    /// build.
    pub fn new(config: HttpUpstreamConfig) -> crate::Result<Self> {
        if config.base_url.is_empty() {
            return Err(crate::Error::Config(
                "upstream base URL is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| crate::Error::Startup(format!("failed to build upstream client: {e}")))?;

        debug!("HTTP upstream initialized (base_url={})", config.base_url);

        Ok(Self { config, client })
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait::async_trait]
impl UpstreamGateway for HttpUpstream {
    async fn forward(
        &self,
        request: &ForwardRequest,
        timeout: Duration,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|_| UpstreamError::Transport(format!("bad method {}", request.method)))?;

        let mut builder = self
            .client
            .request(method, self.url_for(&request.path))
            .body(request.body.clone());
        if let Some(ct) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, ct.as_str());
        }

        let response = match tokio::time::timeout(timeout, builder.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                warn!("upstream {} timed out", request.path);
                return Err(UpstreamError::Timeout);
            }
            Ok(Err(e)) => {
                warn!("upstream {} transport failure: {e}", request.path);
                return Err(UpstreamError::Transport(e.to_string()));
            }
            Err(_) => {
                warn!("upstream {} exceeded {timeout:?}", request.path);
                return Err(UpstreamError::Timeout);
            }
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = match tokio::time::timeout(timeout, response.bytes()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Err(UpstreamError::Transport(e.to_string())),
            Err(_) => return Err(UpstreamError::Timeout),
        };

        if status.is_success() {
            Ok(UpstreamResponse {
                status: status.as_u16(),
                body,
                content_type,
            })
        } else if status.is_client_error() {
            Err(UpstreamError::BusinessReject {
                status: status.as_u16(),
                body,
            })
        } else {
            // 5xx is a service fault, not an explicit rejection.
            Err(UpstreamError::Transport(format!(
                "upstream returned {status}"
            )))
        }
    }
}

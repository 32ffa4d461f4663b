//! Settlement webhook notifications.
//!
//! Posts claim settlement and refund events to a configured endpoint as
//! JSON, signed with HMAC-SHA256 when a secret is set. Delivery is
//! best-effort with bounded retries and runs off the event channel, so it
//! never blocks claim processing.

use crate::error::{Error, Result};
use crate::event::{GatewayEvent, GatewayEventsChannel};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Signature header attached to webhook deliveries.
pub const SIGNATURE_HEADER: &str = "X-Gateway-Signature";

/// Configuration for webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Destination URL for event POSTs.
    pub url: String,
    /// HMAC secret; deliveries are unsigned when absent.
    pub secret: Option<String>,
    /// Timeout per delivery attempt.
    pub timeout: Duration,
    /// Delivery attempts per event.
    pub attempts: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: None,
            timeout: Duration::from_secs(5),
            attempts: 3,
        }
    }
}

/// Delivers settlement events to a webhook endpoint.
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Create a new notifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is empty or the HTTP client fails to
    /// build.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::Config("webhook URL is not configured".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Startup(format!("failed to build webhook client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Run the notifier until the event channel closes or shutdown fires.
    ///
    /// Only settlement-relevant events are delivered; the rest of the
    /// event stream is ignored.
    pub fn spawn(
        self,
        mut events: GatewayEventsChannel,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => {
                        match event {
                            Ok(event) => {
                                if let Some(payload) = payload_for(&event) {
                                    self.deliver(&payload).await;
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("webhook notifier lagged; {missed} events dropped");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!("webhook notifier stopped");
        })
    }

    async fn deliver(&self, payload: &serde_json::Value) {
        let body = payload.to_string();
        let signature = self
            .config
            .secret
            .as_deref()
            .map(|secret| sign(secret, body.as_bytes()));

        for attempt in 1..=self.config.attempts.max(1) {
            let mut request = self
                .client
                .post(&self.config.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
            if let Some(sig) = &signature {
                request = request.header(SIGNATURE_HEADER, sig.as_str());
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("webhook delivered (attempt {attempt})");
                    return;
                }
                Ok(response) => {
                    warn!("webhook returned {} (attempt {attempt})", response.status());
                }
                Err(e) => {
                    warn!("webhook delivery failed (attempt {attempt}): {e}");
                }
            }
            tokio::time::sleep(Duration::from_millis(200 * u64::from(attempt))).await;
        }
        warn!("webhook delivery abandoned after {} attempts", self.config.attempts);
    }
}

/// Compute the hex HMAC-SHA256 signature for a payload.
#[must_use]
pub fn sign(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a webhook signature (for receiver-side tooling and tests).
#[must_use]
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    sign(secret, payload) == signature
}

fn payload_for(event: &GatewayEvent) -> Option<serde_json::Value> {
    match event {
        GatewayEvent::ClaimSettled {
            claim_id,
            agent,
            resource,
            amount,
        } => Some(serde_json::json!({
            "event": "claim.settled",
            "claim_id": claim_id.to_string(),
            "agent": agent,
            "resource": resource,
            "amount": amount,
        })),
        GatewayEvent::ClaimRefunded {
            claim_id,
            agent,
            amount,
            reason,
        } => Some(serde_json::json!({
            "event": "claim.refunded",
            "claim_id": claim_id.to_string(),
            "agent": agent,
            "amount": amount,
            "reason": reason,
        })),
        _ => None,
    }
}

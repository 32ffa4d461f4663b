//! External attestation of payment proofs.
//!
//! The gateway never interprets proof bytes itself; an attestation source
//! (typically an x402 facilitator service) decodes the proof and reports the
//! payer, amount, token, and issue time it commits to. The engine then
//! checks those attested facts against policy.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Facts about a payment proof, as attested by the external source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    /// Payer address the proof commits to.
    pub payer: String,
    /// Amount the proof authorizes, in micro-units of `token`.
    pub amount: u64,
    /// Denomination the proof is made out in.
    pub token: String,
    /// When the proof was issued.
    pub issued_at: DateTime<Utc>,
}

/// Capability for validating proof bytes against an external source.
#[async_trait::async_trait]
pub trait Attestor: Send + Sync {
    /// Attest the given proof bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Payment`] if the source rejects the proof as
    /// invalid, or if the source cannot be reached (the caller fails
    /// closed on either).
    async fn attest(&self, proof: &[u8]) -> Result<Attestation>;
}

/// Configuration for the HTTP attestation client.
#[derive(Debug, Clone)]
pub struct HttpAttestorConfig {
    /// Base URL of the facilitator service.
    pub url: String,
    /// Timeout for attestation queries.
    pub timeout: Duration,
}

impl Default for HttpAttestorConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Attestation client querying a facilitator service over HTTP.
///
/// Posts the hex-encoded proof to `{url}/verify`; the facilitator responds
/// with the attested payer, amount, token, and issue timestamp.
pub struct HttpAttestor {
    config: HttpAttestorConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    payer: Option<String>,
    #[serde(default)]
    amount: Option<u64>,
    #[serde(default)]
    token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    issued_at: Option<i64>,
}

impl HttpAttestor {
    /// Create a new HTTP attestor.
    ///
    /// # Errors
    ///
    /// Returns an error if the facilitator URL is empty or the HTTP client
    /// fails to build.
    pub fn new(config: HttpAttestorConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::Config(
                "attestation facilitator URL is not configured".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Startup(format!("failed to build attestation client: {e}")))?;

        debug!("HTTP attestor initialized (url={})", config.url);

        Ok(Self { config, client })
    }
}

#[async_trait::async_trait]
impl Attestor for HttpAttestor {
    async fn attest(&self, proof: &[u8]) -> Result<Attestation> {
        let url = format!("{}/verify", self.config.url.trim_end_matches('/'));
        let body = serde_json::json!({ "proof": hex::encode(proof) });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("attestation query failed: {e}");
                Error::Payment(format!("attestation source unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            return Err(Error::Payment(format!(
                "attestation source returned {}",
                response.status()
            )));
        }

        let verdict: VerifyResponse = response
            .json()
            .await
            .map_err(|e| Error::Payment(format!("bad attestation response: {e}")))?;

        if !verdict.valid {
            let reason = verdict.reason.unwrap_or_else(|| "proof invalid".to_string());
            return Err(Error::Payment(format!("proof rejected: {reason}")));
        }

        let issued_at = verdict
            .issued_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| Error::Payment("attestation missing issue time".to_string()))?;

        Ok(Attestation {
            payer: verdict
                .payer
                .ok_or_else(|| Error::Payment("attestation missing payer".to_string()))?,
            amount: verdict
                .amount
                .ok_or_else(|| Error::Payment("attestation missing amount".to_string()))?,
            token: verdict
                .token
                .ok_or_else(|| Error::Payment("attestation missing token".to_string()))?,
            issued_at,
        })
    }
}

/// Attestor for devnets and tests: decodes self-describing proofs.
///
/// Proof bytes are expected as UTF-8 `payer:amount:unix_ts`. NO
/// CRYPTOGRAPHIC SECURITY — anyone can mint such a proof. Only for local
/// development where no facilitator is running.
#[derive(Debug, Clone)]
pub struct LocalAttestor {
    token: String,
}

impl LocalAttestor {
    /// Create a local attestor that stamps attestations with `token`.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl Attestor for LocalAttestor {
    async fn attest(&self, proof: &[u8]) -> Result<Attestation> {
        let text = std::str::from_utf8(proof)
            .map_err(|_| Error::Payment("devnet proof is not UTF-8".to_string()))?;

        let mut parts = text.splitn(3, ':');
        let payer = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Payment("devnet proof missing payer".to_string()))?;
        let amount = parts
            .next()
            .and_then(|a| a.parse::<u64>().ok())
            .ok_or_else(|| Error::Payment("devnet proof missing amount".to_string()))?;
        let issued_at = parts
            .next()
            .and_then(|t| t.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| Error::Payment("devnet proof missing timestamp".to_string()))?;

        Ok(Attestation {
            payer: payer.to_string(),
            amount,
            token: self.token.clone(),
            issued_at,
        })
    }
}

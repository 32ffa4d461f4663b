//! Escrow ledger capability.
//!
//! The ledger holds the custodial relationship between a claim and its
//! funds. The engine never mutates escrow state directly; it only calls the
//! operations defined here, always keyed by claim id, and relies on their
//! idempotency: repeating an operation for a claim that already completed
//! it returns the original result without moving funds again.
//!
//! Two implementations ship with the crate: [`MemoryLedger`] (in-process,
//! for devnets and tests) and [`HttpLedger`] (client for a remote
//! settlement service).

use crate::claim::ClaimId;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Receipt returned when funds are first placed in escrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowReceipt {
    /// The claim the funds are held for.
    pub claim_id: ClaimId,
    /// Amount held.
    pub amount: u64,
    /// Denomination held.
    pub token: String,
}

/// Acknowledgement of a terminal ledger operation (release or refund).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementAck {
    /// The claim the operation applied to.
    pub claim_id: ClaimId,
    /// Amount moved.
    pub amount: u64,
}

/// Authoritative state of a claim's escrow record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowState {
    /// Funds are held in escrow.
    Held {
        /// Amount held.
        amount: u64,
        /// Denomination held.
        token: String,
    },
    /// Funds were released to the provider.
    Released {
        /// Amount released.
        amount: u64,
    },
    /// Funds were returned to the agent.
    Refunded {
        /// Amount refunded.
        amount: u64,
    },
}

/// Errors from ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Transient failure; the call may be retried with the same claim id.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The ledger refused the operation permanently.
    #[error("ledger rejected operation: {0}")]
    Rejected(String),

    /// Release/refund was called for a claim with no escrow record.
    #[error("no escrow record for claim {0}")]
    UnknownClaim(ClaimId),

    /// The operation conflicts with the record's terminal state
    /// (e.g. refund after release).
    #[error("conflicting ledger state for claim {claim_id}: {details}")]
    Conflict {
        /// The claim in conflict.
        claim_id: ClaimId,
        /// What the record already says.
        details: String,
    },
}

impl LedgerError {
    /// Whether retrying the same call can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Abstract escrow ledger; all operations are idempotent keyed by claim id.
#[async_trait::async_trait]
pub trait EscrowLedger: Send + Sync {
    /// Hold `amount` of `token` for `claim_id`.
    ///
    /// Calling again with a claim id that already has a record returns the
    /// original receipt without holding additional funds.
    async fn escrow(
        &self,
        claim_id: ClaimId,
        amount: u64,
        token: &str,
    ) -> Result<EscrowReceipt, LedgerError>;

    /// Release held funds to the provider.
    async fn release(&self, claim_id: ClaimId) -> Result<SettlementAck, LedgerError>;

    /// Return held funds to the agent.
    async fn refund(&self, claim_id: ClaimId) -> Result<SettlementAck, LedgerError>;

    /// Query the authoritative record for a claim. Used by recovery;
    /// never trusts in-memory engine state.
    async fn lookup(&self, claim_id: ClaimId) -> Result<Option<EscrowState>, LedgerError>;
}

/// Call counters for the in-memory ledger, used to assert exactly-once
/// properties in tests.
#[derive(Debug, Default, Clone)]
pub struct LedgerStats {
    /// Escrow calls that created a new record (not idempotent replays).
    pub escrows: u64,
    /// Release calls that moved funds.
    pub releases: u64,
    /// Refund calls that moved funds.
    pub refunds: u64,
    /// Calls answered from an existing record.
    pub idempotent_hits: u64,
}

/// In-process escrow ledger.
///
/// Implements the full idempotency contract; suitable for devnets and as
/// the reference implementation the e2e suite runs against.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<ClaimId, EscrowState>>,
    stats: Mutex<LedgerStats>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of call counters.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        self.stats.lock().clone()
    }

    /// Number of records (any state).
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the ledger holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl EscrowLedger for MemoryLedger {
    async fn escrow(
        &self,
        claim_id: ClaimId,
        amount: u64,
        token: &str,
    ) -> Result<EscrowReceipt, LedgerError> {
        let mut records = self.records.lock();
        match records.get(&claim_id) {
            Some(EscrowState::Held {
                amount: held,
                token: held_token,
            }) => {
                self.stats.lock().idempotent_hits += 1;
                Ok(EscrowReceipt {
                    claim_id,
                    amount: *held,
                    token: held_token.clone(),
                })
            }
            Some(state) => Err(LedgerError::Conflict {
                claim_id,
                details: format!("record already terminal: {state:?}"),
            }),
            None => {
                records.insert(
                    claim_id,
                    EscrowState::Held {
                        amount,
                        token: token.to_string(),
                    },
                );
                self.stats.lock().escrows += 1;
                debug!("escrowed {amount} {token} for {claim_id}");
                Ok(EscrowReceipt {
                    claim_id,
                    amount,
                    token: token.to_string(),
                })
            }
        }
    }

    async fn release(&self, claim_id: ClaimId) -> Result<SettlementAck, LedgerError> {
        let mut records = self.records.lock();
        match records.get(&claim_id) {
            Some(EscrowState::Held { amount, .. }) => {
                let amount = *amount;
                records.insert(claim_id, EscrowState::Released { amount });
                self.stats.lock().releases += 1;
                debug!("released {amount} for {claim_id}");
                Ok(SettlementAck { claim_id, amount })
            }
            Some(EscrowState::Released { amount }) => {
                self.stats.lock().idempotent_hits += 1;
                Ok(SettlementAck {
                    claim_id,
                    amount: *amount,
                })
            }
            Some(EscrowState::Refunded { .. }) => Err(LedgerError::Conflict {
                claim_id,
                details: "already refunded".to_string(),
            }),
            None => Err(LedgerError::UnknownClaim(claim_id)),
        }
    }

    async fn refund(&self, claim_id: ClaimId) -> Result<SettlementAck, LedgerError> {
        let mut records = self.records.lock();
        match records.get(&claim_id) {
            Some(EscrowState::Held { amount, .. }) => {
                let amount = *amount;
                records.insert(claim_id, EscrowState::Refunded { amount });
                self.stats.lock().refunds += 1;
                debug!("refunded {amount} for {claim_id}");
                Ok(SettlementAck { claim_id, amount })
            }
            Some(EscrowState::Refunded { amount }) => {
                self.stats.lock().idempotent_hits += 1;
                Ok(SettlementAck {
                    claim_id,
                    amount: *amount,
                })
            }
            Some(EscrowState::Released { .. }) => Err(LedgerError::Conflict {
                claim_id,
                details: "already released".to_string(),
            }),
            None => Err(LedgerError::UnknownClaim(claim_id)),
        }
    }

    async fn lookup(&self, claim_id: ClaimId) -> Result<Option<EscrowState>, LedgerError> {
        Ok(self.records.lock().get(&claim_id).cloned())
    }
}

/// Configuration for the remote settlement service client.
#[derive(Debug, Clone)]
pub struct HttpLedgerConfig {
    /// Base URL of the settlement service.
    pub url: String,
    /// Timeout per ledger call.
    pub timeout: Duration,
}

impl Default for HttpLedgerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Client for a remote settlement service implementing the escrow contract.
pub struct HttpLedger {
    config: HttpLedgerConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LedgerResponse {
    amount: u64,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl HttpLedger {
    /// Create a new settlement service client.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is empty or the client fails to build.
    pub fn new(config: HttpLedgerConfig) -> crate::Result<Self> {
        if config.url.is_empty() {
            return Err(crate::Error::Config(
                "settlement service URL is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| crate::Error::Startup(format!("failed to build ledger client: {e}")))?;

        debug!("HTTP ledger initialized (url={})", config.url);

        Ok(Self { config, client })
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/{op}", self.config.url.trim_end_matches('/'))
    }

    async fn post(
        &self,
        op: &str,
        body: serde_json::Value,
    ) -> Result<LedgerResponse, LedgerError> {
        let response = self
            .client
            .post(self.endpoint(op))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!("ledger {op} call failed: {e}");
                LedgerError::Unavailable(e.to_string())
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(LedgerError::Unavailable(format!("{op} returned {status}")));
        }
        if status == reqwest::StatusCode::CONFLICT {
            let details = response.text().await.unwrap_or_default();
            // Claim id is echoed back by the caller; embed what we know.
            return Err(LedgerError::Rejected(format!("{op} conflict: {details}")));
        }
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(LedgerError::Rejected(format!("{op} returned {status}: {details}")));
        }

        response
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("bad {op} response: {e}")))
    }
}

#[async_trait::async_trait]
impl EscrowLedger for HttpLedger {
    async fn escrow(
        &self,
        claim_id: ClaimId,
        amount: u64,
        token: &str,
    ) -> Result<EscrowReceipt, LedgerError> {
        let body = serde_json::json!({
            "claim_id": claim_id.to_string(),
            "amount": amount,
            "token": token,
        });
        let response = self.post("escrow", body).await?;
        Ok(EscrowReceipt {
            claim_id,
            amount: response.amount,
            token: response.token.unwrap_or_else(|| token.to_string()),
        })
    }

    async fn release(&self, claim_id: ClaimId) -> Result<SettlementAck, LedgerError> {
        let body = serde_json::json!({ "claim_id": claim_id.to_string() });
        let response = self.post("release", body).await?;
        Ok(SettlementAck {
            claim_id,
            amount: response.amount,
        })
    }

    async fn refund(&self, claim_id: ClaimId) -> Result<SettlementAck, LedgerError> {
        let body = serde_json::json!({ "claim_id": claim_id.to_string() });
        let response = self.post("refund", body).await?;
        Ok(SettlementAck {
            claim_id,
            amount: response.amount,
        })
    }

    async fn lookup(&self, claim_id: ClaimId) -> Result<Option<EscrowState>, LedgerError> {
        let url = format!("{}/{claim_id}", self.endpoint("escrows"));
        let response = self.client.get(&url).send().await.map_err(|e| {
            warn!("ledger lookup failed: {e}");
            LedgerError::Unavailable(e.to_string())
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(LedgerError::Unavailable(format!(
                "lookup returned {}",
                response.status()
            )));
        }

        let record: LedgerResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("bad lookup response: {e}")))?;

        match record.state.as_deref() {
            Some("held") => Ok(Some(EscrowState::Held {
                amount: record.amount,
                token: record.token.unwrap_or_default(),
            })),
            Some("released") => Ok(Some(EscrowState::Released {
                amount: record.amount,
            })),
            Some("refunded") => Ok(Some(EscrowState::Refunded {
                amount: record.amount,
            })),
            other => Err(LedgerError::Unavailable(format!(
                "unknown escrow state {other:?}"
            ))),
        }
    }
}

//! Proof verification against pricing policy.
//!
//! This is the policy gate in front of escrow: a parsed proof is attested
//! by the external source, then checked against the resource's advertised
//! price, the accepted denomination, and the freshness window. The whole
//! check is side-effect-free and idempotent; nothing financial happens here.

use crate::claim::{AgentId, ClaimId};
use crate::error::Error;
use crate::payment::attestor::Attestor;
use crate::payment::proof::PaymentProof;
use crate::pricing::Resource;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the proof verifier.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Accepted payment denomination.
    pub accepted_token: String,
    /// Maximum age of a proof before it is considered expired.
    pub freshness_window: Duration,
    /// Timeout applied to the attestation query.
    pub attestation_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            accepted_token: "USDC".to_string(),
            freshness_window: Duration::from_secs(300),
            attestation_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a payment claim failed verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// The payment header or proof bytes could not be parsed.
    #[error("malformed payment: {0}")]
    Malformed(String),

    /// The proof authorizes less than the resource's advertised price.
    #[error("insufficient amount: required {required}, offered {offered}")]
    InsufficientAmount {
        /// Advertised price of the resource.
        required: u64,
        /// Amount the proof/header authorizes.
        offered: u64,
    },

    /// The proof is denominated in a token the gateway does not accept.
    #[error("wrong token: expected {expected}, got {got}")]
    WrongToken {
        /// Accepted denomination.
        expected: String,
        /// Denomination the proof carries.
        got: String,
    },

    /// The proof is older than the freshness window.
    #[error("proof expired: {age_secs}s old, window {window_secs}s")]
    Expired {
        /// Age of the proof in seconds.
        age_secs: i64,
        /// Configured freshness window in seconds.
        window_secs: u64,
    },

    /// The proof's claim id has already been consumed.
    #[error("payment proof already consumed")]
    AlreadyConsumed,

    /// The attestation source could not be reached; the engine fails
    /// closed rather than accept an unverified proof.
    #[error("attestation unavailable: {0}")]
    AttestationUnavailable(String),
}

/// A claim that passed verification and is ready to escrow.
#[derive(Debug, Clone)]
pub struct VerifiedClaim {
    /// Idempotency key derived from the proof.
    pub claim_id: ClaimId,
    /// Paying agent, from the attested payer address.
    pub agent: AgentId,
    /// Amount to charge: the resource's advertised price.
    pub amount: u64,
    /// Ceiling the agent authorized.
    pub max_amount: u64,
    /// Denomination.
    pub token: String,
    /// Requested resource path.
    pub resource: String,
    /// Issue time the attestation committed to.
    pub attested_at: DateTime<Utc>,
}

/// Verifies payment proofs against policy and the attestation source.
pub struct ProofVerifier {
    attestor: Arc<dyn Attestor>,
    config: VerifierConfig,
}

impl ProofVerifier {
    /// Create a new verifier over the given attestation source.
    #[must_use]
    pub fn new(attestor: Arc<dyn Attestor>, config: VerifierConfig) -> Self {
        Self { attestor, config }
    }

    /// Verify a parsed proof against the resource's advertised price.
    ///
    /// Checks, in order: header token and ceiling, attestation (bounded by
    /// the configured timeout), attested token and amount, freshness.
    /// Replay protection is the coordinator's job — it owns the journal
    /// and the consumed-claim cache.
    ///
    /// # Errors
    ///
    /// Returns the specific [`VerificationError`] for the first failed
    /// check.
    pub async fn verify(
        &self,
        proof: &PaymentProof,
        resource: &Resource,
    ) -> Result<VerifiedClaim, VerificationError> {
        let claim_id = proof.claim_id();

        // Header-level policy first: no attestation round-trip for
        // obviously unpayable requests.
        if !proof.token.eq_ignore_ascii_case(&self.config.accepted_token) {
            return Err(VerificationError::WrongToken {
                expected: self.config.accepted_token.clone(),
                got: proof.token.clone(),
            });
        }
        if proof.max_amount < resource.price {
            return Err(VerificationError::InsufficientAmount {
                required: resource.price,
                offered: proof.max_amount,
            });
        }

        let attestation = match tokio::time::timeout(
            self.config.attestation_timeout,
            self.attestor.attest(&proof.proof_bytes),
        )
        .await
        {
            Ok(Ok(att)) => att,
            Ok(Err(Error::Payment(reason))) => {
                debug!("proof {claim_id} failed attestation: {reason}");
                return Err(VerificationError::Malformed(reason));
            }
            Ok(Err(e)) => {
                warn!("attestation error for {claim_id}: {e}");
                return Err(VerificationError::AttestationUnavailable(e.to_string()));
            }
            Err(_) => {
                warn!("attestation timed out for {claim_id}");
                return Err(VerificationError::AttestationUnavailable(
                    "attestation query timed out".to_string(),
                ));
            }
        };

        if !attestation
            .token
            .eq_ignore_ascii_case(&self.config.accepted_token)
        {
            return Err(VerificationError::WrongToken {
                expected: self.config.accepted_token.clone(),
                got: attestation.token,
            });
        }

        if attestation.amount < resource.price {
            return Err(VerificationError::InsufficientAmount {
                required: resource.price,
                offered: attestation.amount,
            });
        }

        let age_secs = (Utc::now() - attestation.issued_at).num_seconds();
        let window_secs = self.config.freshness_window.as_secs();
        // A negative age means a proof dated in the future; reject those too.
        if u64::try_from(age_secs).map_or(true, |age| age > window_secs) {
            return Err(VerificationError::Expired {
                age_secs,
                window_secs,
            });
        }

        debug!(
            "proof {claim_id} verified (payer={}, price={})",
            attestation.payer, resource.price
        );

        Ok(VerifiedClaim {
            claim_id,
            agent: AgentId::new(attestation.payer),
            amount: resource.price,
            max_amount: proof.max_amount,
            token: resource.token.clone(),
            resource: resource.path.clone(),
            attested_at: attestation.issued_at,
        })
    }
}

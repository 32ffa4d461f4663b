//! Inbound payment header parsing.
//!
//! Agents submit payment as an `X-Payment` header of the form:
//!
//! ```text
//! X-Payment: proof=<hex>, max_amount=<n>, token=USDC
//! ```
//!
//! `proof` is an opaque blob understood by the attestation source;
//! `max_amount` is the ceiling the agent authorizes for this request.

use crate::claim::ClaimId;
use crate::payment::verifier::VerificationError;

/// Parsed payment assertion from the `X-Payment` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentProof {
    /// Opaque proof bytes, as submitted (hex-decoded).
    pub proof_bytes: Vec<u8>,
    /// Maximum amount the agent authorizes for this request.
    pub max_amount: u64,
    /// Denomination the agent is paying in.
    pub token: String,
}

impl PaymentProof {
    /// Parse an `X-Payment` header value.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::Malformed`] if the header is not a
    /// well-formed `key=value` list or a required field is missing or
    /// unparseable.
    pub fn from_header(value: &str) -> Result<Self, VerificationError> {
        let mut proof_hex = None;
        let mut max_amount = None;
        let mut token = None;

        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some((key, val)) = part.split_once('=') else {
                return Err(VerificationError::Malformed(format!(
                    "expected key=value, got '{part}'"
                )));
            };
            match key.trim() {
                "proof" => proof_hex = Some(val.trim().to_string()),
                "max_amount" => max_amount = Some(val.trim().to_string()),
                "token" => token = Some(val.trim().to_string()),
                // Unknown keys are ignored for forward compatibility.
                _ => {}
            }
        }

        let proof_hex =
            proof_hex.ok_or_else(|| VerificationError::Malformed("missing proof".to_string()))?;
        let proof_bytes = hex::decode(&proof_hex)
            .map_err(|e| VerificationError::Malformed(format!("proof is not valid hex: {e}")))?;
        if proof_bytes.is_empty() {
            return Err(VerificationError::Malformed("empty proof".to_string()));
        }

        let max_amount = max_amount
            .ok_or_else(|| VerificationError::Malformed("missing max_amount".to_string()))?
            .parse::<u64>()
            .map_err(|e| VerificationError::Malformed(format!("bad max_amount: {e}")))?;

        let token =
            token.ok_or_else(|| VerificationError::Malformed("missing token".to_string()))?;

        Ok(Self {
            proof_bytes,
            max_amount,
            token,
        })
    }

    /// The claim id this proof deterministically maps to.
    #[must_use]
    pub fn claim_id(&self) -> ClaimId {
        ClaimId::from_proof(&self.proof_bytes)
    }
}

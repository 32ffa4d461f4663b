//! x402 wire surface.
//!
//! Header grammar and status mapping for the payment-gated proxy. The
//! actual HTTP server in front of the engine is an external collaborator;
//! this module defines what travels over it:
//!
//! - inbound `X-Payment: proof=<hex>, max_amount=<n>, token=USDC`
//! - `402` challenges advertising `X-Payment-Required: amount=<n>,
//!   token=USDC, resource=<path>`
//! - settlement and refund confirmations
//!   (`X-Payment-Settled`/`X-Payment-Refunded`: `claim_id=<id>, amount=<n>`)

use crate::claim::ClaimId;
use crate::coordinator::{Disposition, RefundReason, RejectReason};
use crate::payment::VerificationError;
use crate::pricing::Resource;
use crate::ratelimit::RateLimitError;
use bytes::Bytes;
use std::fmt;

/// Inbound payment header name.
pub const PAYMENT_HEADER: &str = "X-Payment";
/// Inbound client address header name.
pub const CLIENT_ADDRESS_HEADER: &str = "X-Client-Address";
/// Challenge header returned with 402 responses.
pub const CHALLENGE_HEADER: &str = "X-Payment-Required";
/// Settlement confirmation header.
pub const SETTLED_HEADER: &str = "X-Payment-Settled";
/// Refund confirmation header.
pub const REFUNDED_HEADER: &str = "X-Payment-Refunded";

/// Challenge advertising the terms an agent must meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentChallenge {
    /// Required amount in micro-units of `token`.
    pub amount: u64,
    /// Accepted denomination.
    pub token: String,
    /// The resource being priced.
    pub resource: String,
}

impl From<&Resource> for PaymentChallenge {
    fn from(resource: &Resource) -> Self {
        Self {
            amount: resource.price,
            token: resource.token.clone(),
            resource: resource.path.clone(),
        }
    }
}

impl fmt::Display for PaymentChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "amount={}, token={}, resource={}",
            self.amount, self.token, self.resource
        )
    }
}

/// Render the settlement confirmation header value.
#[must_use]
pub fn settled_header_value(claim_id: ClaimId, amount: u64) -> String {
    format!("claim_id={claim_id}, amount={amount}")
}

/// Render the refund confirmation header value.
#[must_use]
pub fn refunded_header_value(claim_id: ClaimId, amount: u64) -> String {
    format!("claim_id={claim_id}, amount={amount}")
}

/// A framework-agnostic HTTP response: status, headers, body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
}

impl GatewayResponse {
    fn error(status: u16, code: &str, message: &str) -> Self {
        let body = serde_json::json!({ "error": message, "code": code });
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    fn with_header(mut self, name: &str, value: String) -> Self {
        self.headers.push((name.to_string(), value));
        self
    }
}

/// Map a claim disposition onto the wire.
///
/// The agent always receives either the paid-for response with settlement
/// confirmation, or an error that states whether funds were refunded or
/// never taken.
#[must_use]
pub fn respond(disposition: &Disposition) -> GatewayResponse {
    match disposition {
        Disposition::Settled {
            claim_id,
            amount,
            response,
        } => {
            let mut headers = Vec::new();
            if let Some(ct) = &response.content_type {
                headers.push(("Content-Type".to_string(), ct.clone()));
            }
            headers.push((
                SETTLED_HEADER.to_string(),
                settled_header_value(*claim_id, *amount),
            ));
            GatewayResponse {
                status: response.status,
                headers,
                body: response.body.clone(),
            }
        }

        Disposition::Rejected { reason } => respond_rejected(reason),

        Disposition::Refunded {
            claim_id,
            amount,
            reason,
            response,
        } => {
            let refund_header = refunded_header_value(*claim_id, *amount);
            match reason {
                RefundReason::BusinessReject { status } => {
                    let body = response
                        .as_ref()
                        .map_or_else(Bytes::new, |r| r.body.clone());
                    GatewayResponse {
                        status: *status,
                        headers: Vec::new(),
                        body,
                    }
                    .with_header(REFUNDED_HEADER, refund_header)
                }
                RefundReason::UpstreamTimeout => GatewayResponse::error(
                    504,
                    "GATEWAY_UNAVAILABLE",
                    "upstream timed out; payment refunded",
                )
                .with_header(REFUNDED_HEADER, refund_header),
                RefundReason::UpstreamUnavailable => GatewayResponse::error(
                    502,
                    "GATEWAY_UNAVAILABLE",
                    "upstream unavailable; payment refunded",
                )
                .with_header(REFUNDED_HEADER, refund_header),
                RefundReason::SettlementFailed => GatewayResponse::error(
                    502,
                    "SETTLEMENT_FAILED",
                    "settlement failed; payment refunded",
                )
                .with_header(REFUNDED_HEADER, refund_header),
            }
        }
    }
}

fn respond_rejected(reason: &RejectReason) -> GatewayResponse {
    match reason {
        RejectReason::NoPayment { resource } => {
            let challenge = PaymentChallenge::from(resource);
            GatewayResponse::error(402, "PAYMENT_REQUIRED", "payment required")
                .with_header(CHALLENGE_HEADER, challenge.to_string())
        }
        RejectReason::RateLimited(RateLimitError::RateLimited { retry_after_secs }) => {
            GatewayResponse::error(429, "RATE_LIMITED", "rate limit exceeded")
                .with_header("Retry-After", retry_after_secs.to_string())
        }
        RejectReason::RateLimited(RateLimitError::TooManyConcurrent { cap }) => {
            GatewayResponse::error(
                429,
                "TOO_MANY_CONCURRENT",
                &format!("too many concurrent claims (cap {cap})"),
            )
        }
        RejectReason::Verification(e) => respond_verification(e),
        RejectReason::EscrowFailed(e) => {
            GatewayResponse::error(503, "ESCROW_FAILED", &format!("escrow failed: {e}"))
        }
        RejectReason::JournalUnavailable(_) => GatewayResponse::error(
            503,
            "TEMPORARILY_UNAVAILABLE",
            "gateway cannot record payments right now",
        ),
        RejectReason::Internal(e) => {
            GatewayResponse::error(500, "INTERNAL", &format!("internal error: {e}"))
        }
    }
}

fn respond_verification(error: &VerificationError) -> GatewayResponse {
    match error {
        VerificationError::Malformed(e) => {
            GatewayResponse::error(400, "MALFORMED", &format!("invalid payment: {e}"))
        }
        VerificationError::InsufficientAmount { required, offered } => GatewayResponse::error(
            402,
            "INSUFFICIENT_AMOUNT",
            &format!("insufficient payment: required {required}, offered {offered}"),
        ),
        VerificationError::WrongToken { expected, got } => GatewayResponse::error(
            402,
            "WRONG_TOKEN",
            &format!("unsupported token {got}; only {expected} is accepted"),
        ),
        VerificationError::Expired {
            age_secs,
            window_secs,
        } => GatewayResponse::error(
            402,
            "EXPIRED",
            &format!("proof is {age_secs}s old; freshness window is {window_secs}s"),
        ),
        VerificationError::AlreadyConsumed => {
            GatewayResponse::error(409, "ALREADY_CONSUMED", "payment proof already consumed")
        }
        VerificationError::AttestationUnavailable(_) => GatewayResponse::error(
            503,
            "TEMPORARILY_UNAVAILABLE",
            "payment verification is unavailable right now",
        ),
    }
}

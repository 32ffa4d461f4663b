//! # paygate
//!
//! A payment-gated API proxy engine. Paygate sits in front of a priced
//! API and requires each inbound request to carry proof of a small USDC
//! payment (x402-style): it validates the proof, escrows the payment,
//! forwards the request upstream, and settles or refunds the escrowed
//! amount based on the outcome. Clients are autonomous agents with no
//! account or API key - the payment itself is the authorization.
//!
//! ## Architecture
//!
//! The core is the escrow coordinator, a per-claim state machine:
//!
//! ```text
//! received -> verifying -> verified -> escrowing -> escrowed
//!      -> forwarding -> settled | refunding -> refunded
//! ```
//!
//! Every transition is journaled durably before the next side-effecting
//! call, all ledger operations are idempotent on the claim id, and
//! startup recovery drives any non-terminal claim to settlement or refund
//! from the ledger's authoritative record.
//!
//! ## Example
//!
//! ```rust,no_run
//! use paygate::{GatewayBuilder, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default();
//!     let mut gateway = GatewayBuilder::new(config).build().await?;
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod claim;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod http;
pub mod journal;
pub mod ledger;
pub mod node;
pub mod payment;
pub mod pricing;
pub mod ratelimit;
pub mod stats;
pub mod upstream;
pub mod webhook;

pub use claim::{AgentId, ClaimId, ClaimState, PaymentClaim};
pub use config::{GatewayConfig, LedgerMode};
pub use coordinator::{
    CoordinatorConfig, Disposition, EscrowCoordinator, PaidRequest, RefundReason, RejectReason,
};
pub use error::{Error, Result};
pub use event::{GatewayEvent, GatewayEventsChannel};
pub use http::{GatewayResponse, PaymentChallenge};
pub use journal::{JournalConfig, JournalEntry, SettlementJournal};
pub use ledger::{EscrowLedger, EscrowReceipt, EscrowState, LedgerError, MemoryLedger};
pub use node::{GatewayBuilder, RunningGateway};
pub use payment::{PaymentProof, ProofVerifier, VerificationError, VerifierConfig};
pub use pricing::{PriceTable, Resource};
pub use ratelimit::{RateLimitError, RateLimiter, RateLimiterConfig};
pub use stats::RevenueReport;
pub use upstream::{ForwardRequest, UpstreamError, UpstreamGateway, UpstreamResponse};

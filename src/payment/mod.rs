//! Payment proof verification for paygate.
//!
//! This module implements the verification half of the payment pipeline:
//! parse the agent's payment header, attest the proof against the external
//! attestation source, and check it against pricing policy. Verification is
//! deliberately side-effect-free so it can be retried freely; only escrow
//! (owned by the coordinator) has financial consequence.
//!
//! # Architecture
//!
//! ```text
//! X-Payment header received
//!        │
//!        ▼
//! ┌─────────────────────┐
//! │ Parse proof header  │──malformed──▶ reject 402
//! └─────────┬───────────┘
//!           ▼
//! ┌─────────────────────┐
//! │ Replay check        │──consumed───▶ reject 409
//! │ (journal + LRU)     │
//! └─────────┬───────────┘
//!           ▼
//! ┌─────────────────────┐
//! │ Attest + policy     │──invalid────▶ reject 402
//! │ (amount/token/age)  │
//! └─────────┬───────────┘
//!           ▼
//!      VerifiedClaim ──▶ coordinator escrows
//! ```

mod attestor;
mod proof;
mod replay_cache;
mod verifier;

pub use attestor::{Attestation, Attestor, HttpAttestor, HttpAttestorConfig, LocalAttestor};
pub use proof::PaymentProof;
pub use replay_cache::{CacheStats, ConsumedCache};
pub use verifier::{ProofVerifier, VerificationError, VerifiedClaim, VerifierConfig};

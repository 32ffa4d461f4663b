//! Payment claim lifecycle types.
//!
//! A [`PaymentClaim`] tracks one agent's payment assertion for one request,
//! from admission through final disposition. The [`ClaimState`] machine only
//! moves forward along defined edges; no state is revisited once departed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier of a payment claim.
///
/// Derived deterministically from the payment proof bytes (SHA-256), so the
/// same proof always maps to the same claim. This is the idempotency key for
/// the entire pipeline: admission dedup, ledger calls, and journal entries
/// are all keyed by it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimId([u8; 32]);

impl ClaimId {
    /// Derive a claim id from raw proof bytes.
    #[must_use]
    pub fn from_proof(proof: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(proof);
        let digest = hasher.finalize();

        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Raw bytes of the claim id.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimId({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for ClaimId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ClaimId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let id: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("claim id must be 32 bytes"))?;
        Ok(Self(id))
    }
}

/// Identifier of the paying agent, derived from the proof's payer address.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent id from a payer address string.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The underlying address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a payment claim.
///
/// Transitions only move forward along the edges defined by
/// [`ClaimState::can_transition_to`]. `Escrowed` claims may move to either
/// `Forwarding` or directly to `Refunding` when an upstream failure is
/// detected before forwarding begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    /// Claim received, not yet examined.
    Received,
    /// Proof verification in progress.
    Verifying,
    /// Proof verified against policy; funds not yet touched.
    Verified,
    /// Terminal: claim rejected before any funds were taken.
    Rejected,
    /// Escrow call to the ledger in flight.
    Escrowing,
    /// Funds held in escrow for this claim.
    Escrowed,
    /// Upstream forward in flight.
    Forwarding,
    /// Terminal: funds released to the provider.
    Settled,
    /// Refund call to the ledger in flight.
    Refunding,
    /// Terminal: funds returned to the agent.
    Refunded,
    /// Terminal: claim exceeded its processing deadline before escrow
    /// committed; no funds were retained.
    Expired,
}

impl ClaimState {
    /// Whether this state is terminal (no outgoing edges).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Settled | Self::Refunded | Self::Expired
        )
    }

    /// Whether escrowed funds are (or may be) held in this state.
    ///
    /// Recovery and the sweep use this to decide whether a stuck claim
    /// needs a compensating refund rather than plain expiry.
    #[must_use]
    pub fn funds_in_flight(&self) -> bool {
        matches!(
            self,
            Self::Escrowing | Self::Escrowed | Self::Forwarding | Self::Refunding
        )
    }

    /// Whether the edge `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use ClaimState::{
            Escrowed, Escrowing, Expired, Forwarding, Received, Refunded, Refunding, Rejected,
            Settled, Verified, Verifying,
        };
        match self {
            Received => matches!(next, Verifying | Expired),
            Verifying => matches!(next, Verified | Rejected | Expired),
            Verified => matches!(next, Escrowing | Expired),
            // Escrowing may expire only when recovery has confirmed the
            // ledger holds no record for the claim.
            Escrowing => matches!(next, Escrowed | Rejected | Refunding | Expired),
            Escrowed => matches!(next, Forwarding | Refunding),
            Forwarding => matches!(next, Settled | Refunding),
            Refunding => matches!(next, Refunded),
            Rejected | Settled | Refunded | Expired => false,
        }
    }
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
            Self::Escrowing => "escrowing",
            Self::Escrowed => "escrowed",
            Self::Forwarding => "forwarding",
            Self::Settled => "settled",
            Self::Refunding => "refunding",
            Self::Refunded => "refunded",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A single agent's payment assertion for one request.
#[derive(Debug, Clone)]
pub struct PaymentClaim {
    /// Idempotency key derived from the proof bytes.
    pub claim_id: ClaimId,
    /// The paying agent.
    pub agent: AgentId,
    /// Amount actually charged (the resource's advertised price).
    pub amount: u64,
    /// Ceiling the agent authorized in the payment header.
    pub max_amount: u64,
    /// Payment denomination.
    pub token: String,
    /// Requested resource path.
    pub resource: String,
    /// Current lifecycle state.
    pub state: ClaimState,
    /// When the claim was first received.
    pub created_at: DateTime<Utc>,
    /// When the claim last changed state.
    pub state_changed_at: DateTime<Utc>,
}

impl PaymentClaim {
    /// Create a fresh claim in the `Received` state.
    #[must_use]
    pub fn new(
        claim_id: ClaimId,
        agent: AgentId,
        amount: u64,
        max_amount: u64,
        token: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            claim_id,
            agent,
            amount,
            max_amount,
            token: token.into(),
            resource: resource.into(),
            state: ClaimState::Received,
            created_at: now,
            state_changed_at: now,
        }
    }

    /// Advance the claim to `next`, enforcing the forward-only edges.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidTransition`] if the edge is not legal.
    pub fn transition(&mut self, next: ClaimState) -> crate::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(crate::Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.state_changed_at = Utc::now();
        Ok(())
    }

    /// Time the claim has spent in its current state.
    #[must_use]
    pub fn time_in_state(&self) -> chrono::Duration {
        Utc::now() - self.state_changed_at
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATES: [ClaimState; 11] = [
        ClaimState::Received,
        ClaimState::Verifying,
        ClaimState::Verified,
        ClaimState::Rejected,
        ClaimState::Escrowing,
        ClaimState::Escrowed,
        ClaimState::Forwarding,
        ClaimState::Settled,
        ClaimState::Refunding,
        ClaimState::Refunded,
        ClaimState::Expired,
    ];

    /// Rank used to check that transitions never move backwards.
    fn rank(state: ClaimState) -> u8 {
        match state {
            ClaimState::Received => 0,
            ClaimState::Verifying => 1,
            ClaimState::Verified => 2,
            ClaimState::Escrowing => 3,
            ClaimState::Escrowed => 4,
            ClaimState::Forwarding => 5,
            ClaimState::Refunding => 6,
            ClaimState::Settled => 7,
            ClaimState::Refunded => 8,
            ClaimState::Rejected => 9,
            ClaimState::Expired => 10,
        }
    }

    #[test]
    fn test_claim_id_deterministic() {
        let a = ClaimId::from_proof(b"proof-bytes");
        let b = ClaimId::from_proof(b"proof-bytes");
        let c = ClaimId::from_proof(b"other-proof");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_claim_id_display_is_hex() {
        let id = ClaimId::from_proof(b"x");
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 64);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_claim_id_serde_round_trip() {
        let id = ClaimId::from_proof(b"serde");
        let json = serde_json::to_string(&id).unwrap();
        let back: ClaimId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut claim = PaymentClaim::new(
            ClaimId::from_proof(b"p"),
            AgentId::from("0xagent"),
            1000,
            2000,
            "USDC",
            "/v1/predict",
        );

        for next in [
            ClaimState::Verifying,
            ClaimState::Verified,
            ClaimState::Escrowing,
            ClaimState::Escrowed,
            ClaimState::Forwarding,
            ClaimState::Settled,
        ] {
            claim.transition(next).expect("legal edge");
        }
        assert!(claim.state.is_terminal());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL_STATES {
            if from.is_terminal() {
                for to in ALL_STATES {
                    assert!(!from.can_transition_to(to), "{from} -> {to} should be illegal");
                }
            }
        }
    }

    #[test]
    fn test_settled_claim_cannot_reopen() {
        let mut claim = PaymentClaim::new(
            ClaimId::from_proof(b"p"),
            AgentId::from("0xagent"),
            1000,
            1000,
            "USDC",
            "/v1/predict",
        );
        claim.transition(ClaimState::Verifying).unwrap();
        claim.transition(ClaimState::Rejected).unwrap();

        let err = claim.transition(ClaimState::Verifying).unwrap_err();
        assert!(err.to_string().contains("invalid claim transition"));
    }

    #[test]
    fn test_escrowed_can_refund_without_forwarding() {
        assert!(ClaimState::Escrowed.can_transition_to(ClaimState::Refunding));
    }

    #[test]
    fn test_funds_in_flight_classification() {
        assert!(ClaimState::Escrowed.funds_in_flight());
        assert!(ClaimState::Forwarding.funds_in_flight());
        assert!(!ClaimState::Verifying.funds_in_flight());
        assert!(!ClaimState::Settled.funds_in_flight());
    }

    proptest! {
        /// Every legal edge strictly increases the state rank, so no state
        /// can ever be revisited once departed.
        #[test]
        fn prop_transitions_only_move_forward(a in 0usize..11, b in 0usize..11) {
            let from = ALL_STATES[a];
            let to = ALL_STATES[b];
            if from.can_transition_to(to) {
                prop_assert!(rank(to) > rank(from));
            }
        }
    }
}

//! Gateway event system.

use crate::claim::ClaimId;
use tokio::sync::broadcast;

/// Events emitted by the gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Gateway has started successfully.
    Started,

    /// Gateway is shutting down.
    ShuttingDown,

    /// A claim settled: funds released, response delivered.
    ClaimSettled {
        /// The settled claim.
        claim_id: ClaimId,
        /// The paying agent.
        agent: String,
        /// The resource served.
        resource: String,
        /// Amount released to the provider.
        amount: u64,
    },

    /// A claim was refunded after escrow.
    ClaimRefunded {
        /// The refunded claim.
        claim_id: ClaimId,
        /// The paying agent.
        agent: String,
        /// Amount returned to the agent.
        amount: u64,
        /// Why the refund happened.
        reason: String,
    },

    /// A claim was rejected before any funds were taken.
    ClaimRejected {
        /// The paying agent, where known.
        agent: String,
        /// Why the claim was rejected.
        reason: String,
    },

    /// Startup recovery finished.
    RecoveryComplete {
        /// Claims driven to a terminal state.
        resolved: usize,
    },

    /// A background sweep re-drove stuck claims.
    SweepComplete {
        /// Claims driven to a terminal state.
        resolved: usize,
    },

    /// Error occurred.
    Error {
        /// Error message.
        message: String,
    },
}

/// Channel for receiving gateway events.
pub type GatewayEventsChannel = broadcast::Receiver<GatewayEvent>;

/// Sender for gateway events.
pub type GatewayEventsSender = broadcast::Sender<GatewayEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (GatewayEventsSender, GatewayEventsChannel) {
    broadcast::channel(256)
}

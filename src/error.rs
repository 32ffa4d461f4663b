//! Error types for paygate.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in paygate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Gateway startup error.
    #[error("gateway startup failed: {0}")]
    Startup(String),

    /// Payment verification or proof error.
    #[error("payment error: {0}")]
    Payment(String),

    /// Escrow ledger call failed.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Settlement journal error.
    #[error("journal error: {0}")]
    Journal(String),

    /// The journal store is unavailable; the engine fails closed.
    #[error("journal unavailable: {0}")]
    JournalUnavailable(String),

    /// Illegal claim state transition.
    #[error("invalid claim transition: {from} -> {to}")]
    InvalidTransition {
        /// State the claim was in.
        from: String,
        /// State the transition attempted to reach.
        to: String,
    },

    /// Upstream forward error.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Webhook delivery error.
    #[error("webhook error: {0}")]
    Webhook(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Gateway is shutting down.
    #[error("gateway is shutting down")]
    ShuttingDown,
}

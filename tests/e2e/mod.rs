//! E2E test infrastructure for paygate.
//!
//! The harness wires a real coordinator and journal to scripted
//! collaborators, so the full settlement pipeline runs end to end with
//! deterministic upstream and ledger behavior:
//!
//! ```text
//! TestHarness
//!     ├── EscrowCoordinator (real)
//!     ├── SettlementJournal (real, temp dir)
//!     ├── FlakyLedger  (MemoryLedger + failure injection)
//!     └── ScriptedUpstream (programmable outcomes + call counters)
//! ```

mod harness;

#[cfg(test)]
mod settlement;

pub use harness::{FlakyLedger, HarnessConfig, ScriptedUpstream, TestHarness, UpstreamBehavior};

//! Revenue projection over the settlement journal.
//!
//! A read-only view for dashboards and operator tooling. The projection is
//! computed from journal entries alone and is never consulted by the
//! coordinator; it can lag, be rebuilt, or be dropped without affecting
//! settlement correctness.

use crate::claim::ClaimState;
use crate::error::Result;
use crate::journal::SettlementJournal;
use std::collections::{HashMap, HashSet};

/// Per-resource revenue aggregate.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResourceRevenue {
    /// Settled requests for this resource.
    pub settled: u64,
    /// Gross amount settled for this resource.
    pub revenue: u64,
}

/// Aggregate revenue view of the journal.
#[derive(Debug, Default, Clone)]
pub struct RevenueReport {
    /// Claims settled (funds released to the provider).
    pub settled: u64,
    /// Claims refunded after escrow.
    pub refunded: u64,
    /// Claims rejected after commitment (escrow failures).
    pub rejected: u64,
    /// Claims expired without funds taken.
    pub expired: u64,
    /// Gross settled amount.
    pub gross_revenue: u64,
    /// Total amount refunded.
    pub refunded_amount: u64,
    /// Distinct paying agents seen.
    pub unique_agents: usize,
    /// Settled revenue broken down by resource.
    pub by_resource: HashMap<String, ResourceRevenue>,
}

impl RevenueReport {
    /// Build the projection by replaying the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read.
    pub fn from_journal(journal: &SettlementJournal) -> Result<Self> {
        let mut report = Self::default();
        let mut agents = HashSet::new();
        // Resource context is recorded on a claim's first entry; terminal
        // entries are attributed through this map.
        let mut claim_resources = HashMap::new();

        for entry in journal.read_all()? {
            if let Some(agent) = &entry.agent {
                agents.insert(agent.clone());
            }
            if let Some(resource) = &entry.resource {
                claim_resources.insert(entry.claim_id, resource.clone());
            }

            match entry.to_state {
                ClaimState::Settled => {
                    report.settled += 1;
                    let amount = entry.amount.unwrap_or(0);
                    report.gross_revenue += amount;
                    if let Some(resource) = claim_resources.get(&entry.claim_id) {
                        let slot = report.by_resource.entry(resource.clone()).or_default();
                        slot.settled += 1;
                        slot.revenue += amount;
                    }
                }
                ClaimState::Refunded => {
                    report.refunded += 1;
                    report.refunded_amount += entry.amount.unwrap_or(0);
                }
                ClaimState::Rejected => report.rejected += 1,
                ClaimState::Expired => report.expired += 1,
                _ => {}
            }
        }

        report.unique_agents = agents.len();
        Ok(report)
    }

    /// Total terminal claims in the report.
    #[must_use]
    pub fn total_terminal(&self) -> u64 {
        self.settled + self.refunded + self.rejected + self.expired
    }
}

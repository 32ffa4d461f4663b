//! Escrow coordinator - the claim state machine owner.
//!
//! The coordinator is the single writer of claim state. [`EscrowCoordinator::submit`]
//! is the only entry point for new claims: admission, verification, escrow,
//! upstream forward, and settlement or refund all run through it, with every
//! transition journaled before the next side-effecting call (write-ahead
//! discipline). [`EscrowCoordinator::recover_on_startup`] and the periodic
//! sweep re-drive any claim the pipeline left non-terminal, deriving the
//! correct action from the ledger's authoritative record.
//!
//! Concurrency model: claims progress independently; all transitions for a
//! single claim id are serialized by a claim-scoped async mutex. Once escrow
//! begins, the rest of the pipeline runs on a detached task, so a client
//! disconnect never cancels the financial commitment.

use crate::claim::{AgentId, ClaimId, ClaimState, PaymentClaim};
use crate::error::{Error, Result};
use crate::event::{GatewayEvent, GatewayEventsSender};
use crate::journal::{JournalEntry, SettlementJournal};
use crate::ledger::{EscrowLedger, EscrowState, LedgerError};
use crate::payment::{ConsumedCache, PaymentProof, ProofVerifier, VerificationError};
use crate::pricing::{PriceTable, Resource};
use crate::ratelimit::{RateLimitError, RateLimiter};
use crate::upstream::{ForwardRequest, UpstreamError, UpstreamGateway, UpstreamResponse};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for the escrow coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Deadline for the upstream forward call.
    pub upstream_timeout: Duration,
    /// Retries for a failed (retryable) ledger call.
    pub ledger_retries: u32,
    /// Base backoff between ledger retries; doubles per attempt.
    pub ledger_backoff: Duration,
    /// Maximum claim processing time before the sweep re-drives it.
    pub claim_deadline: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(30),
            ledger_retries: 3,
            ledger_backoff: Duration::from_millis(100),
            claim_deadline: Duration::from_secs(120),
        }
    }
}

/// An inbound paid request: who is paying, the payment assertion, and the
/// request to forward once payment clears.
#[derive(Debug, Clone)]
pub struct PaidRequest {
    /// Declared paying agent (from the client address header). Must match
    /// the attested payer.
    pub agent: AgentId,
    /// Raw `X-Payment` header value, if any was sent.
    pub payment_header: Option<String>,
    /// The request to forward upstream.
    pub request: ForwardRequest,
}

/// Why a claim was rejected before any funds were taken.
#[derive(Debug, Clone)]
pub enum RejectReason {
    /// No payment header was present; the challenge advertises terms.
    NoPayment {
        /// The resource the agent must pay for.
        resource: Resource,
    },
    /// Admission refused the request.
    RateLimited(RateLimitError),
    /// The payment claim failed verification.
    Verification(VerificationError),
    /// The ledger refused or could not complete the escrow call.
    EscrowFailed(String),
    /// The journal could not durably record the claim; fail closed.
    JournalUnavailable(String),
    /// Internal engine fault (settlement task failure).
    Internal(String),
}

/// Why escrowed funds were returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundReason {
    /// The upstream explicitly rejected the request.
    BusinessReject {
        /// Upstream status code.
        status: u16,
    },
    /// The upstream forward exceeded its deadline.
    UpstreamTimeout,
    /// The upstream could not be reached or faulted.
    UpstreamUnavailable,
    /// The service was delivered but the release call failed; the engine
    /// falls back to refunding the agent.
    SettlementFailed,
}

/// Final outcome of one submitted request.
#[derive(Debug)]
pub enum Disposition {
    /// Funds released; the upstream response is delivered to the agent.
    Settled {
        /// The settled claim.
        claim_id: ClaimId,
        /// Amount released.
        amount: u64,
        /// The upstream response to relay.
        response: UpstreamResponse,
    },
    /// Rejected before any funds were taken.
    Rejected {
        /// The specific rejection.
        reason: RejectReason,
    },
    /// Funds were escrowed and then returned to the agent.
    Refunded {
        /// The refunded claim.
        claim_id: ClaimId,
        /// Amount refunded.
        amount: u64,
        /// Why the refund happened.
        reason: RefundReason,
        /// Upstream response to relay (business rejects carry one).
        response: Option<UpstreamResponse>,
    },
}

/// Outcome counts from a recovery or sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolutionStats {
    /// Claims confirmed settled from the ledger record.
    pub settled: usize,
    /// Claims driven to refunded.
    pub refunded: usize,
    /// Claims expired (no funds were ever taken).
    pub expired: usize,
    /// Claims that could not be resolved this pass.
    pub failed: usize,
}

impl ResolutionStats {
    /// Total claims driven to a terminal state.
    #[must_use]
    pub fn resolved(&self) -> usize {
        self.settled + self.refunded + self.expired
    }
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    verifier: ProofVerifier,
    limiter: RateLimiter,
    ledger: Arc<dyn EscrowLedger>,
    upstream: Arc<dyn UpstreamGateway>,
    journal: Arc<SettlementJournal>,
    prices: PriceTable,
    consumed: ConsumedCache,
    events: GatewayEventsSender,
    locks: Mutex<HashMap<ClaimId, Arc<tokio::sync::Mutex<()>>>>,
}

/// The claim state machine owner. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EscrowCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl EscrowCoordinator {
    /// Create a new coordinator over the given collaborators.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        verifier: ProofVerifier,
        limiter: RateLimiter,
        ledger: Arc<dyn EscrowLedger>,
        upstream: Arc<dyn UpstreamGateway>,
        journal: Arc<SettlementJournal>,
        prices: PriceTable,
        consumed: ConsumedCache,
        events: GatewayEventsSender,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                verifier,
                limiter,
                ledger,
                upstream,
                journal,
                prices,
                consumed,
                events,
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Process one paid request to a final disposition.
    ///
    /// This is the only entry point. Admission runs strictly before
    /// verification; verification never touches the ledger; the ledger is
    /// never called without a durable journal receipt for the preceding
    /// transition.
    pub async fn submit(&self, request: PaidRequest) -> Disposition {
        let inner = &self.inner;
        let resource = inner.prices.resource(&request.request.path);

        let Some(header) = request.payment_header.as_deref() else {
            debug!("no payment header for {} from {}", resource.path, request.agent);
            return Disposition::Rejected {
                reason: RejectReason::NoPayment { resource },
            };
        };

        // Admission before any payment processing.
        let slot = match inner.limiter.admit(&request.agent) {
            Ok(slot) => slot,
            Err(e) => {
                debug!("admission refused for {}: {e}", request.agent);
                return Disposition::Rejected {
                    reason: RejectReason::RateLimited(e),
                };
            }
        };

        let proof = match PaymentProof::from_header(header) {
            Ok(proof) => proof,
            Err(e) => return self.reject(&request.agent, RejectReason::Verification(e)),
        };
        let claim_id = proof.claim_id();

        // Serialize all work for this claim id.
        let lock = self.claim_lock(claim_id);
        let guard = lock.lock_owned().await;

        // Replay protection: a claim id the engine has committed to escrow
        // (journal) or recently seen consumed (cache) is never re-run.
        if inner.consumed.contains(&claim_id) || inner.journal.contains(&claim_id) {
            let prior = inner.journal.last_state(&claim_id);
            debug!("replayed proof {claim_id} (prior state {prior:?})");
            return self.reject(
                &request.agent,
                RejectReason::Verification(VerificationError::AlreadyConsumed),
            );
        }

        // Pure policy check; retryable freely, no financial consequence.
        let verified = match inner.verifier.verify(&proof, &resource).await {
            Ok(v) => v,
            Err(e) => return self.reject(&request.agent, RejectReason::Verification(e)),
        };

        // The admitted agent must be the attested payer, or an agent could
        // spend another's rate budget.
        if verified.agent != request.agent {
            return self.reject(
                &request.agent,
                RejectReason::Verification(VerificationError::Malformed(format!(
                    "attested payer {} does not match client address {}",
                    verified.agent, request.agent
                ))),
            );
        }

        // Commit to escrow: journal the verified prefix durably before the
        // ledger sees the claim. From here the proof counts as consumed.
        let mut claim = PaymentClaim::new(
            claim_id,
            verified.agent.clone(),
            verified.amount,
            verified.max_amount,
            verified.token.clone(),
            verified.resource.clone(),
        );
        for to in [
            ClaimState::Verifying,
            ClaimState::Verified,
            ClaimState::Escrowing,
        ] {
            let mut entry = JournalEntry::new(claim_id, claim.state, to);
            if claim.state == ClaimState::Received {
                entry = entry.with_context(claim.agent.as_str(), &claim.resource, claim.amount);
            }
            if let Err(e) = self.advance(&mut claim, entry) {
                warn!("failed to journal {claim_id} -> {to}: {e}");
                return self.reject(
                    &request.agent,
                    RejectReason::JournalUnavailable(e.to_string()),
                );
            }
        }
        inner.consumed.insert(claim_id);

        let amount = claim.amount;
        let token = claim.token.clone();
        match self
            .ledger_with_retry("escrow", || {
                let ledger = Arc::clone(&inner.ledger);
                let token = token.clone();
                async move { ledger.escrow(claim_id, amount, &token).await }
            })
            .await
        {
            Ok(receipt) => {
                debug!("escrowed {} {} for {claim_id}", receipt.amount, receipt.token);
            }
            Err(e) => {
                error!("escrow failed for {claim_id}: {e}");
                let entry = JournalEntry::new(claim_id, claim.state, ClaimState::Rejected)
                    .with_reason(format!("escrow failed: {e}"));
                if let Err(journal_err) = self.advance(&mut claim, entry) {
                    // Recovery will expire the claim from the ledger record.
                    warn!("failed to journal escrow failure for {claim_id}: {journal_err}");
                }
                return self.reject(&request.agent, RejectReason::EscrowFailed(e.to_string()));
            }
        }

        let from_state = claim.state;
        if let Err(e) = self.advance(
            &mut claim,
            JournalEntry::new(claim_id, from_state, ClaimState::Escrowed),
        ) {
            // Funds are held but the receipt is not durable: compensate
            // immediately rather than forward without a recoverable record.
            warn!("failed to journal escrowed for {claim_id}: {e}");
            return self
                .refund_claim(&mut claim, RefundReason::UpstreamUnavailable, None)
                .await;
        }

        // Detached settlement: a dropped client connection must not cancel
        // the financial commitment. The admission slot and claim lock ride
        // along and release when the task finishes.
        let this = self.clone();
        let forward = request.request;
        let handle = tokio::spawn(async move {
            let _slot = slot;
            let _guard = guard;
            this.settle_claim(claim, forward).await
        });

        let disposition = match handle.await {
            Ok(disposition) => disposition,
            Err(e) => {
                error!("settlement task for {claim_id} failed: {e}");
                Disposition::Rejected {
                    reason: RejectReason::Internal(format!("settlement task failed: {e}")),
                }
            }
        };
        self.prune_lock(claim_id);
        disposition
    }

    /// Forward the request and settle or refund. The claim is `Escrowed`
    /// and journaled when this runs.
    async fn settle_claim(&self, mut claim: PaymentClaim, request: ForwardRequest) -> Disposition {
        let inner = &self.inner;
        let claim_id = claim.claim_id;

        let from_state = claim.state;
        if let Err(e) = self.advance(
            &mut claim,
            JournalEntry::new(claim_id, from_state, ClaimState::Forwarding),
        ) {
            // No durable receipt for the forward: fail closed and return
            // the payment instead.
            warn!("failed to journal forwarding for {claim_id}: {e}");
            return self
                .refund_claim(&mut claim, RefundReason::UpstreamUnavailable, None)
                .await;
        }

        let resource = claim.resource.clone();
        // The deadline is enforced here as well as inside the gateway
        // implementation: whichever fires first is authoritative, and a
        // late upstream response is discarded with the cancelled future.
        let outcome = match tokio::time::timeout(
            inner.config.upstream_timeout,
            inner.upstream.forward(&request, inner.config.upstream_timeout),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(UpstreamError::Timeout),
        };
        match outcome {
            Ok(response) => {
                match self
                    .ledger_with_retry("release", || {
                        let ledger = Arc::clone(&inner.ledger);
                        async move { ledger.release(claim_id).await }
                    })
                    .await
                {
                    Ok(ack) => {
                        let entry = JournalEntry::new(claim_id, claim.state, ClaimState::Settled)
                            .with_amount(ack.amount);
                        if let Err(e) = self.advance(&mut claim, entry) {
                            // Funds are correctly released; recovery will
                            // reconcile the journal from the ledger record.
                            warn!("failed to journal settled for {claim_id}: {e}");
                        }
                        info!("claim {claim_id} settled ({} {resource})", ack.amount);
                        let _ = inner.events.send(GatewayEvent::ClaimSettled {
                            claim_id,
                            agent: claim.agent.to_string(),
                            resource,
                            amount: ack.amount,
                        });
                        Disposition::Settled {
                            claim_id,
                            amount: ack.amount,
                            response,
                        }
                    }
                    Err(e) => {
                        // Service was delivered but funds cannot be
                        // released; resolve toward the agent.
                        error!("release failed for {claim_id}: {e}");
                        self.refund_claim(&mut claim, RefundReason::SettlementFailed, Some(response))
                            .await
                    }
                }
            }
            Err(UpstreamError::BusinessReject { status, body }) => {
                debug!("upstream rejected {claim_id} with {status}");
                self.refund_claim(
                    &mut claim,
                    RefundReason::BusinessReject { status },
                    Some(UpstreamResponse {
                        status,
                        body,
                        content_type: None,
                    }),
                )
                .await
            }
            Err(UpstreamError::Timeout) => {
                warn!("upstream timed out for {claim_id}");
                self.refund_claim(&mut claim, RefundReason::UpstreamTimeout, None)
                    .await
            }
            Err(UpstreamError::Transport(e)) => {
                warn!("upstream transport failure for {claim_id}: {e}");
                self.refund_claim(&mut claim, RefundReason::UpstreamUnavailable, None)
                    .await
            }
        }
    }

    /// Drive an escrowed claim to `Refunded`.
    async fn refund_claim(
        &self,
        claim: &mut PaymentClaim,
        reason: RefundReason,
        response: Option<UpstreamResponse>,
    ) -> Disposition {
        let inner = &self.inner;
        let claim_id = claim.claim_id;

        if claim.state != ClaimState::Refunding {
            let entry = JournalEntry::new(claim_id, claim.state, ClaimState::Refunding)
                .with_reason(format!("{reason:?}"));
            if let Err(e) = self.advance(claim, entry) {
                // Proceed with the refund regardless: the ledger call is
                // idempotent and recovery reconciles the journal from it.
                warn!("failed to journal refunding for {claim_id}: {e}");
            }
        }

        match self
            .ledger_with_retry("refund", || {
                let ledger = Arc::clone(&inner.ledger);
                async move { ledger.refund(claim_id).await }
            })
            .await
        {
            Ok(ack) => {
                if claim.state == ClaimState::Refunding {
                    let entry =
                        JournalEntry::new(claim_id, ClaimState::Refunding, ClaimState::Refunded)
                            .with_amount(ack.amount);
                    if let Err(e) = self.advance(claim, entry) {
                        warn!("failed to journal refunded for {claim_id}: {e}");
                    }
                }
                info!("claim {claim_id} refunded ({}, {reason:?})", ack.amount);
                let _ = inner.events.send(GatewayEvent::ClaimRefunded {
                    claim_id,
                    agent: claim.agent.to_string(),
                    amount: ack.amount,
                    reason: format!("{reason:?}"),
                });
                Disposition::Refunded {
                    claim_id,
                    amount: ack.amount,
                    reason,
                    response,
                }
            }
            Err(e) => {
                // Never silently dropped: the claim stays non-terminal in
                // the journal and the sweep re-drives it.
                error!("refund failed for {claim_id}: {e} (sweep will retry)");
                Disposition::Refunded {
                    claim_id,
                    amount: claim.amount,
                    reason,
                    response,
                }
            }
        }
    }

    /// Durably journal `claim` moving along `entry`, then advance the
    /// in-memory claim. Write-ahead: nothing side-effecting runs until the
    /// append has returned durably.
    fn advance(&self, claim: &mut PaymentClaim, entry: JournalEntry) -> Result<()> {
        let to = entry.to_state;
        self.inner.journal.append(&entry)?;
        claim.transition(to)?;
        Ok(())
    }

    /// Drive every non-terminal journaled claim to a terminal state,
    /// deriving the action from the ledger's authoritative record.
    ///
    /// Called once before the gateway accepts traffic.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read.
    pub async fn recover_on_startup(&self) -> Result<ResolutionStats> {
        let pending = self.inner.journal.scan_non_terminal();
        if pending.is_empty() {
            info!("recovery: journal is clean");
            return Ok(ResolutionStats::default());
        }

        info!("recovery: {} non-terminal claims", pending.len());
        let mut stats = ResolutionStats::default();
        for claim_id in pending {
            let lock = self.claim_lock(claim_id);
            let _guard = lock.lock_owned().await;
            match self.resolve_claim(claim_id).await {
                Ok(Some(ClaimState::Settled)) => stats.settled += 1,
                Ok(Some(ClaimState::Refunded)) => stats.refunded += 1,
                Ok(Some(ClaimState::Expired)) => stats.expired += 1,
                Ok(_) => {}
                Err(e) => {
                    error!("recovery failed for {claim_id}: {e}");
                    stats.failed += 1;
                }
            }
            self.prune_lock(claim_id);
        }

        info!(
            "recovery complete: {} settled, {} refunded, {} expired, {} failed",
            stats.settled, stats.refunded, stats.expired, stats.failed
        );
        let _ = self.inner.events.send(GatewayEvent::RecoveryComplete {
            resolved: stats.resolved(),
        });
        Ok(stats)
    }

    /// Re-drive claims stuck non-terminal past the claim deadline.
    ///
    /// Claims still actively processing hold their claim lock and are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read.
    pub async fn sweep_stale(&self) -> Result<ResolutionStats> {
        let deadline = chrono::Duration::from_std(self.inner.config.claim_deadline)
            .map_err(|e| Error::Config(format!("claim deadline out of range: {e}")))?;
        self.prune_idle_locks();
        let mut stats = ResolutionStats::default();

        for claim_id in self.inner.journal.scan_non_terminal() {
            let history = self.inner.journal.read(&claim_id)?;
            let Some(last) = history.last() else { continue };
            if Utc::now() - last.timestamp < deadline {
                continue;
            }

            let lock = self.claim_lock(claim_id);
            // A held lock means the claim is in flight; leave it alone.
            let Ok(_guard) = lock.try_lock() else { continue };

            match self.resolve_claim(claim_id).await {
                Ok(Some(ClaimState::Settled)) => stats.settled += 1,
                Ok(Some(ClaimState::Refunded)) => stats.refunded += 1,
                Ok(Some(ClaimState::Expired)) => stats.expired += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!("sweep failed for {claim_id}: {e}");
                    stats.failed += 1;
                }
            }
        }

        if stats.resolved() > 0 {
            info!(
                "sweep: {} settled, {} refunded, {} expired",
                stats.settled, stats.refunded, stats.expired
            );
            let _ = self.inner.events.send(GatewayEvent::SweepComplete {
                resolved: stats.resolved(),
            });
        }
        Ok(stats)
    }

    /// Resolve one non-terminal claim from the ledger's record. Returns the
    /// terminal state reached, or `None` if the claim was already terminal
    /// or cannot be classified.
    async fn resolve_claim(&self, claim_id: ClaimId) -> Result<Option<ClaimState>> {
        let inner = &self.inner;
        let Some(last) = inner.journal.last_state(&claim_id) else {
            return Ok(None);
        };
        if last.is_terminal() {
            return Ok(Some(last));
        }

        let record = inner
            .ledger
            .lookup(claim_id)
            .await
            .map_err(|e| Error::Ledger(e.to_string()))?;

        match record {
            None => {
                // The ledger never saw the claim; nothing was taken.
                if last.can_transition_to(ClaimState::Expired) {
                    inner.journal.append(
                        &JournalEntry::new(claim_id, last, ClaimState::Expired)
                            .with_reason("no escrow record"),
                    )?;
                    Ok(Some(ClaimState::Expired))
                } else {
                    error!("claim {claim_id} journaled {last} but ledger has no record");
                    Ok(None)
                }
            }
            Some(EscrowState::Held { amount, .. }) => {
                // Outcome unknown; the agent-favoring resolution is refund.
                if last != ClaimState::Refunding {
                    inner.journal.append(
                        &JournalEntry::new(claim_id, last, ClaimState::Refunding)
                            .with_reason("stale claim with funds held"),
                    )?;
                }
                inner
                    .ledger
                    .refund(claim_id)
                    .await
                    .map_err(|e| Error::Ledger(e.to_string()))?;
                inner.journal.append(
                    &JournalEntry::new(claim_id, ClaimState::Refunding, ClaimState::Refunded)
                        .with_amount(amount),
                )?;
                // Agent context lives on the claim's first journal entry.
                let agent = inner
                    .journal
                    .read(&claim_id)
                    .ok()
                    .and_then(|entries| entries.first().and_then(|e| e.agent.clone()))
                    .unwrap_or_default();
                let _ = inner.events.send(GatewayEvent::ClaimRefunded {
                    claim_id,
                    agent,
                    amount,
                    reason: "recovered".to_string(),
                });
                Ok(Some(ClaimState::Refunded))
            }
            Some(EscrowState::Released { amount }) => {
                if last == ClaimState::Forwarding {
                    inner.journal.append(
                        &JournalEntry::new(claim_id, last, ClaimState::Settled)
                            .with_amount(amount),
                    )?;
                    Ok(Some(ClaimState::Settled))
                } else {
                    error!("claim {claim_id} journaled {last} but ledger shows released");
                    Ok(None)
                }
            }
            Some(EscrowState::Refunded { amount }) => {
                if last != ClaimState::Refunding {
                    inner.journal.append(
                        &JournalEntry::new(claim_id, last, ClaimState::Refunding)
                            .with_reason("ledger shows refunded"),
                    )?;
                }
                inner.journal.append(
                    &JournalEntry::new(claim_id, ClaimState::Refunding, ClaimState::Refunded)
                        .with_amount(amount),
                )?;
                Ok(Some(ClaimState::Refunded))
            }
        }
    }

    fn reject(&self, agent: &AgentId, reason: RejectReason) -> Disposition {
        let _ = self.inner.events.send(GatewayEvent::ClaimRejected {
            agent: agent.to_string(),
            reason: format!("{reason:?}"),
        });
        Disposition::Rejected { reason }
    }

    /// Run a ledger operation with bounded backoff on retryable failures.
    /// The operation is keyed by claim id, so retries are safe.
    async fn ledger_with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> std::result::Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, LedgerError>>,
    {
        let mut backoff = self.inner.config.ledger_backoff;
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.inner.config.ledger_retries => {
                    attempt += 1;
                    warn!("ledger {op} attempt {attempt} failed: {e}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn claim_lock(&self, claim_id: ClaimId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.locks.lock();
        Arc::clone(
            locks
                .entry(claim_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn prune_lock(&self, claim_id: ClaimId) {
        let mut locks = self.inner.locks.lock();
        if let Some(lock) = locks.get(&claim_id) {
            // Only the map still references the lock: nobody is waiting.
            if Arc::strong_count(lock) == 1 {
                locks.remove(&claim_id);
            }
        }
    }

    fn prune_idle_locks(&self) {
        self.inner
            .locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// The rate limiter, for per-agent overrides.
    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// The settlement journal, for read-model projections.
    #[must_use]
    pub fn journal(&self) -> &Arc<SettlementJournal> {
        &self.inner.journal
    }
}

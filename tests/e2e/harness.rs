//! Test harness wiring the coordinator to scripted collaborators.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use chrono::Utc;
use paygate::claim::AgentId;
use paygate::coordinator::{CoordinatorConfig, EscrowCoordinator, PaidRequest};
use paygate::event::create_event_channel;
use paygate::journal::{JournalConfig, SettlementJournal};
use paygate::ledger::{
    EscrowLedger, EscrowReceipt, EscrowState, LedgerError, LedgerStats, MemoryLedger,
    SettlementAck,
};
use paygate::payment::{ConsumedCache, LocalAttestor, ProofVerifier, VerifierConfig};
use paygate::pricing::PriceTable;
use paygate::ratelimit::{RateLimiter, RateLimiterConfig};
use paygate::upstream::{ForwardRequest, UpstreamError, UpstreamGateway, UpstreamResponse};
use paygate::ClaimId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Scripted outcome for upstream forwards.
#[derive(Debug, Clone)]
pub enum UpstreamBehavior {
    /// Respond successfully.
    Succeed {
        /// Status to return.
        status: u16,
        /// Body to return.
        body: Vec<u8>,
    },
    /// Explicitly reject the request.
    Reject {
        /// Status to return.
        status: u16,
        /// Error body to return.
        body: Vec<u8>,
    },
    /// Fail at the transport level.
    Fail,
    /// Respond successfully, but only after a delay. Combined with a short
    /// upstream timeout this simulates a late response racing the deadline.
    Hang {
        /// Delay before responding.
        delay: Duration,
    },
}

/// Programmable upstream with call counters.
pub struct ScriptedUpstream {
    behavior: parking_lot::Mutex<UpstreamBehavior>,
    calls: AtomicU64,
    completions: AtomicU64,
}

impl ScriptedUpstream {
    pub fn new(behavior: UpstreamBehavior) -> Self {
        Self {
            behavior: parking_lot::Mutex::new(behavior),
            calls: AtomicU64::new(0),
            completions: AtomicU64::new(0),
        }
    }

    /// Swap the scripted behavior.
    pub fn set_behavior(&self, behavior: UpstreamBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Forwards started.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Forwards that ran to completion (late responses included).
    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl UpstreamGateway for ScriptedUpstream {
    async fn forward(
        &self,
        _request: &ForwardRequest,
        _timeout: Duration,
    ) -> Result<UpstreamResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        let outcome = match behavior {
            UpstreamBehavior::Succeed { status, body } => Ok(UpstreamResponse {
                status,
                body: Bytes::from(body),
                content_type: Some("application/json".to_string()),
            }),
            UpstreamBehavior::Reject { status, body } => Err(UpstreamError::BusinessReject {
                status,
                body: Bytes::from(body),
            }),
            UpstreamBehavior::Fail => {
                Err(UpstreamError::Transport("connection refused".to_string()))
            }
            UpstreamBehavior::Hang { delay } => {
                tokio::time::sleep(delay).await;
                Ok(UpstreamResponse {
                    status: 200,
                    body: Bytes::from_static(b"{\"late\":true}"),
                    content_type: Some("application/json".to_string()),
                })
            }
        };
        self.completions.fetch_add(1, Ordering::SeqCst);
        outcome
    }
}

/// Memory ledger with failure injection for escrow/release/refund.
#[derive(Default)]
pub struct FlakyLedger {
    inner: MemoryLedger,
    fail_escrows: AtomicBool,
    fail_releases: AtomicBool,
    fail_refunds: AtomicBool,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_escrows(&self, fail: bool) {
        self.fail_escrows.store(fail, Ordering::SeqCst);
    }

    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self) -> LedgerStats {
        self.inner.stats()
    }
}

#[async_trait::async_trait]
impl EscrowLedger for FlakyLedger {
    async fn escrow(
        &self,
        claim_id: ClaimId,
        amount: u64,
        token: &str,
    ) -> Result<EscrowReceipt, LedgerError> {
        if self.fail_escrows.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("injected escrow failure".to_string()));
        }
        self.inner.escrow(claim_id, amount, token).await
    }

    async fn release(&self, claim_id: ClaimId) -> Result<SettlementAck, LedgerError> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("injected release failure".to_string()));
        }
        self.inner.release(claim_id).await
    }

    async fn refund(&self, claim_id: ClaimId) -> Result<SettlementAck, LedgerError> {
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("injected refund failure".to_string()));
        }
        self.inner.refund(claim_id).await
    }

    async fn lookup(&self, claim_id: ClaimId) -> Result<Option<EscrowState>, LedgerError> {
        self.inner.lookup(claim_id).await
    }
}

/// Knobs for harness construction.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub upstream_timeout: Duration,
    pub max_requests: u32,
    pub max_concurrent: u32,
    pub default_price: u64,
    pub ledger_retries: u32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(5),
            max_requests: 100,
            max_concurrent: 16,
            default_price: 1000,
            ledger_retries: 1,
        }
    }
}

/// A coordinator wired to scripted collaborators over a real journal.
pub struct TestHarness {
    pub coordinator: EscrowCoordinator,
    pub ledger: Arc<FlakyLedger>,
    pub upstream: Arc<ScriptedUpstream>,
    pub price: u64,
    _dir: TempDir,
}

impl TestHarness {
    /// Harness with a succeeding upstream and default limits.
    pub fn setup() -> Self {
        Self::setup_with(
            UpstreamBehavior::Succeed {
                status: 200,
                body: b"{\"result\":\"ok\"}".to_vec(),
            },
            HarnessConfig::default(),
        )
    }

    /// Harness with explicit upstream behavior and limits.
    pub fn setup_with(behavior: UpstreamBehavior, config: HarnessConfig) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let journal = Arc::new(
            SettlementJournal::open(JournalConfig {
                path: dir.path().join("settlement.journal"),
                max_terminal_entries: 100_000,
            })
            .expect("open journal"),
        );

        let ledger = Arc::new(FlakyLedger::new());
        let upstream = Arc::new(ScriptedUpstream::new(behavior));
        let (events_tx, _events_rx) = create_event_channel();

        let coordinator = EscrowCoordinator::new(
            CoordinatorConfig {
                upstream_timeout: config.upstream_timeout,
                ledger_retries: config.ledger_retries,
                ledger_backoff: Duration::from_millis(10),
                claim_deadline: Duration::from_secs(60),
            },
            ProofVerifier::new(
                Arc::new(LocalAttestor::new("USDC")),
                VerifierConfig::default(),
            ),
            RateLimiter::new(RateLimiterConfig {
                window: Duration::from_secs(60),
                max_requests: config.max_requests,
                max_concurrent: config.max_concurrent,
            }),
            Arc::clone(&ledger) as Arc<dyn EscrowLedger>,
            Arc::clone(&upstream) as Arc<dyn UpstreamGateway>,
            Arc::clone(&journal),
            PriceTable {
                default_price: config.default_price,
                token: "USDC".to_string(),
                endpoints: std::collections::HashMap::new(),
            },
            ConsumedCache::new(),
            events_tx,
        );

        Self {
            coordinator,
            ledger,
            upstream,
            price: config.default_price,
            _dir: dir,
        }
    }

    /// Render a devnet payment header: the proof attests `amount` from
    /// `agent`, issued now. `nonce` makes distinct proofs for one agent.
    pub fn payment_header(agent: &str, amount: u64, max_amount: u64, nonce: u64) -> String {
        let ts = Utc::now().timestamp() - i64::try_from(nonce % 120).expect("small nonce");
        let proof = format!("{agent}:{amount}:{ts}");
        format!(
            "proof={}, max_amount={max_amount}, token=USDC",
            hex::encode(proof.as_bytes())
        )
    }

    /// A fully-formed paid request for `/v1/predict`.
    pub fn paid_request(&self, agent: &str, nonce: u64) -> PaidRequest {
        PaidRequest {
            agent: AgentId::new(agent),
            payment_header: Some(Self::payment_header(agent, self.price, self.price, nonce)),
            request: ForwardRequest::post_json("/v1/predict", &b"{\"input\":\"data\"}"[..]),
        }
    }

    /// A request with no payment header at all.
    pub fn unpaid_request(&self, agent: &str) -> PaidRequest {
        PaidRequest {
            agent: AgentId::new(agent),
            payment_header: None,
            request: ForwardRequest::post_json("/v1/predict", &b"{}"[..]),
        }
    }
}

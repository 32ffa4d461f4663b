//! End-to-end settlement tests.
//!
//! These exercise the full pipeline - admission, verification, escrow,
//! forward, settle/refund, journal - against scripted collaborators, and
//! assert the engine's financial guarantees: exactly-once escrow,
//! conservation (one release xor one refund per terminal claim), idempotent
//! replay handling, rate enforcement, and crash recovery.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::{HarnessConfig, TestHarness, UpstreamBehavior};
use paygate::claim::ClaimState;
use paygate::coordinator::{Disposition, RefundReason, RejectReason};
use paygate::http;
use paygate::journal::JournalEntry;
use paygate::ledger::EscrowLedger;
use paygate::payment::{PaymentProof, VerificationError};
use paygate::ratelimit::RateLimitError;
use std::time::Duration;

fn claim_id_for(header: &str) -> paygate::ClaimId {
    let value = header.strip_prefix("proof=").unwrap();
    let value = value.split(',').next().unwrap().trim();
    PaymentProof::from_header(&format!("proof={value}, max_amount=1, token=USDC"))
        .unwrap()
        .claim_id()
}

#[tokio::test]
async fn test_valid_payment_settles_and_relays_response() {
    let harness = TestHarness::setup();

    let disposition = harness
        .coordinator
        .submit(harness.paid_request("0xalice", 0))
        .await;

    let Disposition::Settled {
        claim_id,
        amount,
        response,
    } = &disposition
    else {
        panic!("expected settled, got {disposition:?}");
    };
    assert_eq!(*amount, harness.price);
    assert_eq!(response.status, 200);

    // Exactly one escrow and one release; nothing refunded.
    let stats = harness.ledger.stats();
    assert_eq!(stats.escrows, 1);
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.refunds, 0);

    // Journal agrees.
    assert_eq!(
        harness.coordinator.journal().last_state(claim_id),
        Some(ClaimState::Settled)
    );

    // Wire mapping carries the settlement confirmation.
    let wire = http::respond(&disposition);
    assert_eq!(wire.status, 200);
    assert!(wire
        .headers
        .iter()
        .any(|(name, value)| name == http::SETTLED_HEADER && value.contains("amount=1000")));
}

#[tokio::test]
async fn test_business_error_refunds_payment() {
    let harness = TestHarness::setup_with(
        UpstreamBehavior::Reject {
            status: 422,
            body: b"{\"error\":\"bad input\"}".to_vec(),
        },
        HarnessConfig::default(),
    );

    let disposition = harness
        .coordinator
        .submit(harness.paid_request("0xalice", 0))
        .await;

    let Disposition::Refunded {
        claim_id,
        amount,
        reason,
        response,
    } = &disposition
    else {
        panic!("expected refunded, got {disposition:?}");
    };
    assert_eq!(*reason, RefundReason::BusinessReject { status: 422 });
    assert_eq!(*amount, harness.price);
    assert!(response.is_some());

    let stats = harness.ledger.stats();
    assert_eq!(stats.escrows, 1);
    assert_eq!(stats.refunds, 1);
    assert_eq!(stats.releases, 0);
    assert_eq!(
        harness.coordinator.journal().last_state(claim_id),
        Some(ClaimState::Refunded)
    );

    // The agent sees the upstream rejection plus the refund confirmation.
    let wire = http::respond(&disposition);
    assert_eq!(wire.status, 422);
    assert!(wire
        .headers
        .iter()
        .any(|(name, _)| name == http::REFUNDED_HEADER));
}

#[tokio::test]
async fn test_upstream_transport_failure_refunds() {
    let harness = TestHarness::setup_with(UpstreamBehavior::Fail, HarnessConfig::default());

    let disposition = harness
        .coordinator
        .submit(harness.paid_request("0xalice", 0))
        .await;

    let Disposition::Refunded { reason, .. } = &disposition else {
        panic!("expected refunded, got {disposition:?}");
    };
    assert_eq!(*reason, RefundReason::UpstreamUnavailable);

    let stats = harness.ledger.stats();
    assert_eq!(stats.refunds, 1);
    assert_eq!(stats.releases, 0);

    let wire = http::respond(&disposition);
    assert_eq!(wire.status, 502);
}

#[tokio::test]
async fn test_replayed_proof_rejected_without_new_escrow() {
    let harness = TestHarness::setup();
    let request = harness.paid_request("0xalice", 0);
    let replay = request.clone();

    let first = harness.coordinator.submit(request).await;
    assert!(matches!(first, Disposition::Settled { .. }));

    let second = harness.coordinator.submit(replay).await;
    let Disposition::Rejected {
        reason: RejectReason::Verification(VerificationError::AlreadyConsumed),
    } = &second
    else {
        panic!("expected already-consumed, got {second:?}");
    };

    // The replay never reached the ledger.
    assert_eq!(harness.ledger.stats().escrows, 1);
    assert_eq!(http::respond(&second).status, 409);
}

#[tokio::test]
async fn test_concurrent_duplicate_submissions_escrow_once() {
    let harness = TestHarness::setup();
    let request = harness.paid_request("0xalice", 0);
    let duplicate = request.clone();

    let coordinator_a = harness.coordinator.clone();
    let coordinator_b = harness.coordinator.clone();
    let (first, second) = tokio::join!(
        tokio::spawn(async move { coordinator_a.submit(request).await }),
        tokio::spawn(async move { coordinator_b.submit(duplicate).await }),
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    let settled = outcomes
        .iter()
        .filter(|d| matches!(d, Disposition::Settled { .. }))
        .count();
    let consumed = outcomes
        .iter()
        .filter(|d| {
            matches!(
                d,
                Disposition::Rejected {
                    reason: RejectReason::Verification(VerificationError::AlreadyConsumed)
                }
            )
        })
        .count();

    assert_eq!(settled, 1, "exactly one submission settles");
    assert_eq!(consumed, 1, "the other resolves as already consumed");
    assert_eq!(harness.ledger.stats().escrows, 1);
    assert_eq!(harness.ledger.stats().releases, 1);
}

#[tokio::test]
async fn test_concurrency_cap_rejects_excess_without_ledger_calls() {
    let harness = TestHarness::setup_with(
        UpstreamBehavior::Hang {
            delay: Duration::from_millis(300),
        },
        HarnessConfig {
            max_concurrent: 2,
            upstream_timeout: Duration::from_secs(5),
            ..HarnessConfig::default()
        },
    );

    // Two claims enter the pipeline and park in the forward.
    let slow_a = {
        let coordinator = harness.coordinator.clone();
        let request = harness.paid_request("0xalice", 1);
        tokio::spawn(async move { coordinator.submit(request).await })
    };
    let slow_b = {
        let coordinator = harness.coordinator.clone();
        let request = harness.paid_request("0xalice", 2);
        tokio::spawn(async move { coordinator.submit(request).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The third is over the cap and must be refused at admission.
    let third = harness
        .coordinator
        .submit(harness.paid_request("0xalice", 3))
        .await;
    let Disposition::Rejected {
        reason: RejectReason::RateLimited(RateLimitError::TooManyConcurrent { cap }),
    } = &third
    else {
        panic!("expected concurrency rejection, got {third:?}");
    };
    assert_eq!(*cap, 2);
    assert_eq!(http::respond(&third).status, 429);

    // The rejected claim never touched the ledger.
    assert!(harness.ledger.stats().escrows <= 2);

    let (a, b) = tokio::join!(slow_a, slow_b);
    assert!(matches!(a.unwrap(), Disposition::Settled { .. }));
    assert!(matches!(b.unwrap(), Disposition::Settled { .. }));
    assert_eq!(harness.ledger.stats().escrows, 2);
}

#[tokio::test]
async fn test_upstream_timeout_refunds_and_discards_late_response() {
    let harness = TestHarness::setup_with(
        UpstreamBehavior::Hang {
            delay: Duration::from_millis(400),
        },
        HarnessConfig {
            upstream_timeout: Duration::from_millis(100),
            ..HarnessConfig::default()
        },
    );

    let disposition = harness
        .coordinator
        .submit(harness.paid_request("0xalice", 0))
        .await;

    let Disposition::Refunded {
        claim_id, reason, ..
    } = &disposition
    else {
        panic!("expected refunded, got {disposition:?}");
    };
    assert_eq!(*reason, RefundReason::UpstreamTimeout);
    assert_eq!(http::respond(&disposition).status, 504);

    // Wait past the point the late response would have landed.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The refund decision stands; the late response changed nothing.
    assert_eq!(
        harness.coordinator.journal().last_state(claim_id),
        Some(ClaimState::Refunded)
    );
    let stats = harness.ledger.stats();
    assert_eq!(stats.refunds, 1);
    assert_eq!(stats.releases, 0);
    assert_eq!(harness.upstream.completions(), 0, "late response was discarded");
}

#[tokio::test]
async fn test_missing_payment_header_gets_challenge() {
    let harness = TestHarness::setup();

    let disposition = harness
        .coordinator
        .submit(harness.unpaid_request("0xalice"))
        .await;

    assert!(matches!(
        disposition,
        Disposition::Rejected {
            reason: RejectReason::NoPayment { .. }
        }
    ));
    let wire = http::respond(&disposition);
    assert_eq!(wire.status, 402);
    let challenge = wire
        .headers
        .iter()
        .find(|(name, _)| name == http::CHALLENGE_HEADER)
        .map(|(_, value)| value.clone())
        .expect("challenge header present");
    assert_eq!(challenge, "amount=1000, token=USDC, resource=/v1/predict");

    assert_eq!(harness.ledger.stats().escrows, 0);
}

#[tokio::test]
async fn test_insufficient_ceiling_rejected_before_ledger() {
    let harness = TestHarness::setup();

    let mut request = harness.paid_request("0xalice", 0);
    request.payment_header = Some(TestHarness::payment_header(
        "0xalice",
        harness.price,
        harness.price / 2, // ceiling below the advertised price
        0,
    ));

    let disposition = harness.coordinator.submit(request).await;
    let Disposition::Rejected {
        reason: RejectReason::Verification(VerificationError::InsufficientAmount { required, offered }),
    } = &disposition
    else {
        panic!("expected insufficient amount, got {disposition:?}");
    };
    assert_eq!(*required, 1000);
    assert_eq!(*offered, 500);
    assert_eq!(http::respond(&disposition).status, 402);
    assert_eq!(harness.ledger.stats().escrows, 0);
}

#[tokio::test]
async fn test_payer_mismatch_rejected_before_ledger() {
    let harness = TestHarness::setup();

    // Proof attests 0xalice but the request claims 0xmallory.
    let mut request = harness.paid_request("0xmallory", 0);
    request.payment_header = Some(TestHarness::payment_header(
        "0xalice",
        harness.price,
        harness.price,
        0,
    ));

    let disposition = harness.coordinator.submit(request).await;
    assert!(matches!(
        disposition,
        Disposition::Rejected {
            reason: RejectReason::Verification(VerificationError::Malformed(_))
        }
    ));
    assert_eq!(harness.ledger.stats().escrows, 0);
}

#[tokio::test]
async fn test_rate_window_exhaustion_rejected_before_ledger() {
    let harness = TestHarness::setup_with(
        UpstreamBehavior::Succeed {
            status: 200,
            body: b"{}".to_vec(),
        },
        HarnessConfig {
            max_requests: 2,
            ..HarnessConfig::default()
        },
    );

    for nonce in 0..2 {
        let disposition = harness
            .coordinator
            .submit(harness.paid_request("0xalice", nonce))
            .await;
        assert!(matches!(disposition, Disposition::Settled { .. }));
    }

    let third = harness
        .coordinator
        .submit(harness.paid_request("0xalice", 2))
        .await;
    assert!(matches!(
        third,
        Disposition::Rejected {
            reason: RejectReason::RateLimited(RateLimitError::RateLimited { .. })
        }
    ));
    assert_eq!(http::respond(&third).status, 429);
    assert_eq!(harness.ledger.stats().escrows, 2);
}

#[tokio::test]
async fn test_escrow_failure_rejects_without_forwarding() {
    let harness = TestHarness::setup();
    harness.ledger.fail_escrows(true);

    let request = harness.paid_request("0xalice", 0);
    let claim_id = claim_id_for(request.payment_header.as_deref().unwrap());
    let disposition = harness.coordinator.submit(request).await;

    assert!(matches!(
        disposition,
        Disposition::Rejected {
            reason: RejectReason::EscrowFailed(_)
        }
    ));
    assert_eq!(harness.upstream.calls(), 0, "no forward without escrow");
    assert_eq!(http::respond(&disposition).status, 503);

    // The claim is journaled terminal with no funds taken.
    assert_eq!(
        harness.coordinator.journal().last_state(&claim_id),
        Some(ClaimState::Rejected)
    );
}

#[tokio::test]
async fn test_release_failure_falls_back_to_refund() {
    let harness = TestHarness::setup();
    harness.ledger.fail_releases(true);

    let disposition = harness
        .coordinator
        .submit(harness.paid_request("0xalice", 0))
        .await;

    let Disposition::Refunded {
        claim_id,
        reason,
        response,
        ..
    } = &disposition
    else {
        panic!("expected refund fallback, got {disposition:?}");
    };
    assert_eq!(*reason, RefundReason::SettlementFailed);
    // The upstream response was delivered and is still relayed.
    assert!(response.is_some());

    // Conservation: no release ever committed, exactly one refund did.
    let stats = harness.ledger.stats();
    assert_eq!(stats.releases, 0);
    assert_eq!(stats.refunds, 1);
    assert_eq!(
        harness.coordinator.journal().last_state(claim_id),
        Some(ClaimState::Refunded)
    );
}

#[tokio::test]
async fn test_recovery_drives_escrowed_claim_to_terminal_state() {
    let harness = TestHarness::setup();

    // Simulate a crash after escrow, before the forward: the journal stops
    // at escrowed and the ledger holds the funds.
    let claim_id = paygate::ClaimId::from_proof(b"crashed-claim");
    harness.ledger.escrow(claim_id, 1000, "USDC").await.unwrap();
    for (from, to) in [
        (ClaimState::Received, ClaimState::Verifying),
        (ClaimState::Verifying, ClaimState::Verified),
        (ClaimState::Verified, ClaimState::Escrowing),
        (ClaimState::Escrowing, ClaimState::Escrowed),
    ] {
        harness
            .coordinator
            .journal()
            .append(&JournalEntry::new(claim_id, from, to))
            .unwrap();
    }

    let stats = harness.coordinator.recover_on_startup().await.unwrap();
    assert_eq!(stats.refunded, 1);
    assert_eq!(
        harness.coordinator.journal().last_state(&claim_id),
        Some(ClaimState::Refunded)
    );

    // Recovery never leaves the claim non-terminal, and running it again
    // changes nothing.
    let again = harness.coordinator.recover_on_startup().await.unwrap();
    assert_eq!(again.resolved(), 0);
    assert_eq!(harness.ledger.stats().refunds, 1);
}

#[tokio::test]
async fn test_conservation_across_mixed_outcomes() {
    let harness = TestHarness::setup();

    // Settled claim.
    let settled = harness
        .coordinator
        .submit(harness.paid_request("0xalice", 10))
        .await;
    assert!(matches!(settled, Disposition::Settled { .. }));

    // Business-rejected claim.
    harness.upstream.set_behavior(UpstreamBehavior::Reject {
        status: 400,
        body: b"no".to_vec(),
    });
    let rejected = harness
        .coordinator
        .submit(harness.paid_request("0xbob", 11))
        .await;
    assert!(matches!(rejected, Disposition::Refunded { .. }));

    // Transport-failed claim.
    harness.upstream.set_behavior(UpstreamBehavior::Fail);
    let failed = harness
        .coordinator
        .submit(harness.paid_request("0xcarol", 12))
        .await;
    assert!(matches!(failed, Disposition::Refunded { .. }));

    // Every escrowed claim saw exactly one of release or refund.
    let stats = harness.ledger.stats();
    assert_eq!(stats.escrows, 3);
    assert_eq!(stats.releases, 1);
    assert_eq!(stats.refunds, 2);
    assert_eq!(stats.releases + stats.refunds, stats.escrows);
    assert!(harness.coordinator.journal().scan_non_terminal().is_empty());
}

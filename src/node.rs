//! Gateway assembly and lifecycle.
//!
//! [`GatewayBuilder`] wires the configured collaborators (journal, ledger,
//! attestor, upstream) into an [`crate::coordinator::EscrowCoordinator`];
//! [`RunningGateway`] runs startup recovery, the background sweep, and
//! webhook delivery until shutdown.

use crate::config::{AttestationMode, GatewayConfig, LedgerMode};
use crate::coordinator::{CoordinatorConfig, EscrowCoordinator, PaidRequest};
use crate::error::Result;
use crate::event::{create_event_channel, GatewayEvent, GatewayEventsChannel, GatewayEventsSender};
use crate::http::GatewayResponse;
use crate::journal::{JournalConfig, SettlementJournal};
use crate::ledger::{EscrowLedger, HttpLedger, HttpLedgerConfig, MemoryLedger};
use crate::payment::{
    Attestor, ConsumedCache, HttpAttestor, HttpAttestorConfig, LocalAttestor, ProofVerifier,
    VerifierConfig,
};
use crate::ratelimit::{RateLimiter, RateLimiterConfig};
use crate::upstream::{HttpUpstream, HttpUpstreamConfig};
use crate::webhook::{WebhookConfig, WebhookNotifier};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Builder for constructing a gateway.
pub struct GatewayBuilder {
    config: GatewayConfig,
}

impl GatewayBuilder {
    /// Create a new gateway builder with the given configuration.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Build the gateway: open the journal, wire the collaborators, and
    /// construct the coordinator. Recovery runs in
    /// [`RunningGateway::run`], before traffic is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if any collaborator fails to initialize.
    pub async fn build(self) -> Result<RunningGateway> {
        let config = self.config;
        info!("building paygate gateway (root_dir={:?})", config.root_dir);

        std::fs::create_dir_all(&config.root_dir)?;

        let journal = Arc::new(SettlementJournal::open(JournalConfig {
            path: config.root_dir.join("settlement.journal"),
            max_terminal_entries: config.policy.journal_max_terminal_entries,
        })?);

        let attestor: Arc<dyn Attestor> = match config.attestation.mode {
            AttestationMode::Local => {
                warn!("local attestation enabled - devnet proofs only, no cryptographic security");
                Arc::new(LocalAttestor::new(config.policy.accepted_token.clone()))
            }
            AttestationMode::Http => Arc::new(HttpAttestor::new(HttpAttestorConfig {
                url: config.attestation.url.clone(),
                timeout: Duration::from_secs(config.attestation.timeout_secs),
            })?),
        };

        let ledger: Arc<dyn EscrowLedger> = match config.ledger.mode {
            LedgerMode::Memory => {
                warn!("in-memory ledger enabled - escrow state is lost on restart");
                Arc::new(MemoryLedger::new())
            }
            LedgerMode::Http => Arc::new(HttpLedger::new(HttpLedgerConfig {
                url: config.ledger.url.clone(),
                timeout: Duration::from_secs(config.ledger.timeout_secs),
            })?),
        };

        let upstream = Arc::new(HttpUpstream::new(HttpUpstreamConfig {
            base_url: config.upstream.base_url.clone(),
        })?);

        let verifier = ProofVerifier::new(
            attestor,
            VerifierConfig {
                accepted_token: config.policy.accepted_token.clone(),
                freshness_window: Duration::from_secs(config.policy.freshness_secs),
                attestation_timeout: Duration::from_secs(config.attestation.timeout_secs),
            },
        );

        let limiter = RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(config.rate_limit.window_secs),
            max_requests: config.rate_limit.max_requests,
            max_concurrent: config.rate_limit.max_concurrent,
        });

        let (events_tx, events_rx) = create_event_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = EscrowCoordinator::new(
            CoordinatorConfig {
                upstream_timeout: Duration::from_secs(config.upstream.timeout_secs),
                ledger_retries: config.ledger.retries,
                ledger_backoff: Duration::from_millis(config.ledger.backoff_ms),
                claim_deadline: Duration::from_secs(config.policy.claim_deadline_secs),
            },
            verifier,
            limiter,
            ledger,
            upstream,
            Arc::clone(&journal),
            config.pricing.clone(),
            ConsumedCache::with_capacity(config.policy.replay_cache_capacity),
            events_tx.clone(),
        );

        let webhook = if config.webhook.url.is_empty() {
            None
        } else {
            Some(WebhookNotifier::new(WebhookConfig {
                url: config.webhook.url.clone(),
                secret: (!config.webhook.secret.is_empty())
                    .then(|| config.webhook.secret.clone()),
                timeout: Duration::from_secs(config.webhook.timeout_secs),
                attempts: 3,
            })?)
        };

        Ok(RunningGateway {
            config,
            coordinator,
            journal,
            events_tx,
            events_rx: Some(events_rx),
            shutdown_tx,
            shutdown_rx,
            webhook,
        })
    }
}

/// A running gateway.
pub struct RunningGateway {
    config: GatewayConfig,
    coordinator: EscrowCoordinator,
    journal: Arc<SettlementJournal>,
    events_tx: GatewayEventsSender,
    events_rx: Option<GatewayEventsChannel>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    webhook: Option<WebhookNotifier>,
}

impl RunningGateway {
    /// The gateway's root directory.
    #[must_use]
    pub fn root_dir(&self) -> &PathBuf {
        &self.config.root_dir
    }

    /// The claim coordinator; the HTTP front end submits through this.
    #[must_use]
    pub fn coordinator(&self) -> &EscrowCoordinator {
        &self.coordinator
    }

    /// The settlement journal, for read-model projections.
    #[must_use]
    pub fn journal(&self) -> &Arc<SettlementJournal> {
        &self.journal
    }

    /// Process a paid request end to end and map the outcome onto the wire.
    pub async fn handle(&self, request: PaidRequest) -> GatewayResponse {
        let disposition = self.coordinator.submit(request).await;
        crate::http::respond(&disposition)
    }

    /// Get a receiver for gateway events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<GatewayEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to gateway events.
    #[must_use]
    pub fn subscribe_events(&self) -> GatewayEventsChannel {
        self.events_tx.subscribe()
    }

    /// Run the gateway until shutdown is requested.
    ///
    /// Startup recovery runs first - non-terminal claims in the journal
    /// are driven to a terminal state before any new claim is processed.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery fails.
    pub async fn run(&mut self) -> Result<()> {
        info!("starting paygate gateway");

        let recovered = self.coordinator.recover_on_startup().await?;
        if recovered.failed > 0 {
            warn!("{} claims could not be recovered; sweep will retry", recovered.failed);
        }

        let _ = self.events_tx.send(GatewayEvent::Started);

        // Webhook delivery off the event channel.
        if let Some(webhook) = self.webhook.take() {
            webhook.spawn(self.events_tx.subscribe(), self.shutdown_rx.clone());
        }

        // Background sweep re-drives claims stuck past their deadline.
        {
            let coordinator = self.coordinator.clone();
            let events_tx = self.events_tx.clone();
            let mut shutdown_rx = self.shutdown_rx.clone();
            let interval = Duration::from_secs(self.config.policy.sweep_interval_secs.max(1));

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        () = tokio::time::sleep(interval) => {
                            if let Err(e) = coordinator.sweep_stale().await {
                                warn!("sweep failed: {e}");
                                let _ = events_tx.send(GatewayEvent::Error {
                                    message: format!("sweep failed: {e}"),
                                });
                            }
                        }
                    }
                }
            });
        }

        info!("gateway running, waiting for shutdown signal");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("shutdown signal received");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("ctrl-c received, initiating shutdown");
                    self.shutdown();
                    break;
                }
            }
        }

        let _ = self.events_tx.send(GatewayEvent::ShuttingDown);
        info!("gateway shutdown complete");
        Ok(())
    }

    /// Request the gateway to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{AttestationMode, LedgerMode};

    fn devnet_config(dir: &tempfile::TempDir) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.root_dir = dir.path().to_path_buf();
        config.upstream.base_url = "http://127.0.0.1:9".to_string();
        config.ledger.mode = LedgerMode::Memory;
        config.attestation.mode = AttestationMode::Local;
        config
    }

    #[tokio::test]
    async fn test_build_devnet_gateway() {
        let dir = tempfile::TempDir::new().unwrap();
        let gateway = GatewayBuilder::new(devnet_config(&dir)).build().await;
        assert!(gateway.is_ok());
    }

    #[tokio::test]
    async fn test_build_requires_upstream_url() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = devnet_config(&dir);
        config.upstream.base_url = String::new();

        let gateway = GatewayBuilder::new(config).build().await;
        assert!(gateway.is_err());
    }

    #[tokio::test]
    async fn test_http_ledger_requires_url() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = devnet_config(&dir);
        config.ledger.mode = LedgerMode::Http;
        config.ledger.url = String::new();

        let gateway = GatewayBuilder::new(config).build().await;
        assert!(gateway.is_err());
    }

    #[tokio::test]
    async fn test_events_receiver_taken_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut gateway = GatewayBuilder::new(devnet_config(&dir)).build().await.unwrap();

        assert!(gateway.events().is_some());
        assert!(gateway.events().is_none());
    }
}

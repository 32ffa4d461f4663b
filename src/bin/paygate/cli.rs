//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use paygate::config::{AttestationMode, GatewayConfig, LedgerMode};
use std::path::PathBuf;

/// Payment-gated API proxy: x402 verification, escrow, and settlement.
#[derive(Parser, Debug)]
#[command(name = "paygate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for gateway data.
    #[arg(long, env = "PAYGATE_ROOT_DIR")]
    pub root_dir: Option<PathBuf>,

    /// Base URL of the priced upstream API.
    #[arg(long, env = "PAYGATE_UPSTREAM_URL")]
    pub upstream_url: Option<String>,

    /// Escrow ledger backend.
    #[arg(long, value_enum, default_value = "http", env = "PAYGATE_LEDGER_MODE")]
    pub ledger_mode: CliLedgerMode,

    /// Settlement service URL (http ledger mode).
    #[arg(long, env = "PAYGATE_LEDGER_URL")]
    pub ledger_url: Option<String>,

    /// Proof attestation backend.
    #[arg(long, value_enum, default_value = "http", env = "PAYGATE_ATTESTATION_MODE")]
    pub attestation_mode: CliAttestationMode,

    /// Facilitator URL (http attestation mode).
    #[arg(long, env = "PAYGATE_ATTESTATION_URL")]
    pub attestation_url: Option<String>,

    /// Default price per request in micro-USDC.
    #[arg(long, env = "PAYGATE_DEFAULT_PRICE")]
    pub default_price: Option<u64>,

    /// Webhook URL for settlement notifications.
    #[arg(long, env = "PAYGATE_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

/// Ledger backend CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliLedgerMode {
    /// In-process ledger (devnet only).
    Memory,
    /// Remote settlement service.
    Http,
}

/// Attestation backend CLI enum.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliAttestationMode {
    /// Self-describing devnet proofs.
    Local,
    /// Facilitator service.
    Http,
}

impl Cli {
    /// Convert CLI arguments into a `GatewayConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<GatewayConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            GatewayConfig::from_file(path)?
        } else {
            GatewayConfig::default()
        };

        // Override with CLI arguments
        if let Some(root_dir) = self.root_dir {
            config.root_dir = root_dir;
        }
        if let Some(upstream_url) = self.upstream_url {
            config.upstream.base_url = upstream_url;
        }
        if let Some(ledger_url) = self.ledger_url {
            config.ledger.url = ledger_url;
        }
        if let Some(attestation_url) = self.attestation_url {
            config.attestation.url = attestation_url;
        }
        if let Some(default_price) = self.default_price {
            config.pricing.default_price = default_price;
        }
        if let Some(webhook_url) = self.webhook_url {
            config.webhook.url = webhook_url;
        }

        config.ledger.mode = self.ledger_mode.into();
        config.attestation.mode = self.attestation_mode.into();
        config.log_level = self.log_level;

        Ok(config)
    }
}

impl From<CliLedgerMode> for LedgerMode {
    fn from(m: CliLedgerMode) -> Self {
        match m {
            CliLedgerMode::Memory => LedgerMode::Memory,
            CliLedgerMode::Http => LedgerMode::Http,
        }
    }
}

impl From<CliAttestationMode> for AttestationMode {
    fn from(m: CliAttestationMode) -> Self {
        match m {
            CliAttestationMode::Local => AttestationMode::Local,
            CliAttestationMode::Http => AttestationMode::Http,
        }
    }
}

//! Configuration for paygate.

use crate::pricing::PriceTable;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Escrow ledger backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    /// In-process ledger (devnet only; state is lost on restart).
    Memory,
    /// Remote settlement service.
    #[default]
    Http,
}

/// Attestation backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationMode {
    /// Self-describing devnet proofs (NO CRYPTOGRAPHIC SECURITY).
    Local,
    /// Facilitator service.
    #[default]
    Http,
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Root directory for gateway data (journal lives here).
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upstream (priced API) configuration.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Escrow ledger configuration.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Proof attestation configuration.
    #[serde(default)]
    pub attestation: AttestationConfig,

    /// Payment policy.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Per-agent rate limits.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Per-resource pricing.
    #[serde(default)]
    pub pricing: PriceTable,

    /// Webhook notifications.
    #[serde(default)]
    pub webhook: WebhookSettings,
}

/// Upstream service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the priced API.
    #[serde(default)]
    pub base_url: String,

    /// Forward deadline in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

/// Escrow ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Backend selection.
    #[serde(default)]
    pub mode: LedgerMode,

    /// Settlement service URL (http mode).
    #[serde(default)]
    pub url: String,

    /// Timeout per ledger call in seconds.
    #[serde(default = "default_ledger_timeout")]
    pub timeout_secs: u64,

    /// Retries for a failed (retryable) ledger call.
    #[serde(default = "default_ledger_retries")]
    pub retries: u32,

    /// Base backoff between retries in milliseconds.
    #[serde(default = "default_ledger_backoff_ms")]
    pub backoff_ms: u64,
}

/// Proof attestation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationConfig {
    /// Backend selection.
    #[serde(default)]
    pub mode: AttestationMode,

    /// Facilitator URL (http mode).
    #[serde(default)]
    pub url: String,

    /// Timeout per attestation query in seconds.
    #[serde(default = "default_attestation_timeout")]
    pub timeout_secs: u64,
}

/// Payment policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Accepted payment denomination.
    #[serde(default = "default_token")]
    pub accepted_token: String,

    /// Proof freshness window in seconds.
    #[serde(default = "default_freshness")]
    pub freshness_secs: u64,

    /// Maximum claim processing time before the sweep re-drives it, in
    /// seconds.
    #[serde(default = "default_claim_deadline")]
    pub claim_deadline_secs: u64,

    /// Interval between background sweeps in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Capacity of the consumed-claim replay cache.
    #[serde(default = "default_replay_capacity")]
    pub replay_cache_capacity: usize,

    /// Terminal journal entries retained in memory for replay protection.
    #[serde(default = "default_max_terminal")]
    pub journal_max_terminal_entries: usize,
}

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Request window in seconds.
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,

    /// Maximum requests per agent per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Maximum concurrent in-flight claims per agent.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
}

/// Webhook notification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookSettings {
    /// Destination URL; webhooks are disabled when empty.
    #[serde(default)]
    pub url: String,

    /// HMAC signing secret; deliveries are unsigned when empty.
    #[serde(default)]
    pub secret: String,

    /// Timeout per delivery attempt in seconds.
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            log_level: default_log_level(),
            upstream: UpstreamConfig::default(),
            ledger: LedgerConfig::default(),
            attestation: AttestationConfig::default(),
            policy: PolicyConfig::default(),
            rate_limit: RateLimitConfig::default(),
            pricing: PriceTable::default(),
            webhook: WebhookSettings::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            mode: LedgerMode::default(),
            url: String::new(),
            timeout_secs: default_ledger_timeout(),
            retries: default_ledger_retries(),
            backoff_ms: default_ledger_backoff_ms(),
        }
    }
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            mode: AttestationMode::default(),
            url: String::new(),
            timeout_secs: default_attestation_timeout(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            accepted_token: default_token(),
            freshness_secs: default_freshness(),
            claim_deadline_secs: default_claim_deadline(),
            sweep_interval_secs: default_sweep_interval(),
            replay_cache_capacity: default_replay_capacity(),
            journal_max_terminal_entries: default_max_terminal(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window(),
            max_requests: default_max_requests(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "paygate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".paygate"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_token() -> String {
    "USDC".to_string()
}

const fn default_upstream_timeout() -> u64 {
    30
}

const fn default_ledger_timeout() -> u64 {
    10
}

const fn default_ledger_retries() -> u32 {
    3
}

const fn default_ledger_backoff_ms() -> u64 {
    100
}

const fn default_attestation_timeout() -> u64 {
    5
}

const fn default_freshness() -> u64 {
    300
}

const fn default_claim_deadline() -> u64 {
    120
}

const fn default_sweep_interval() -> u64 {
    30
}

const fn default_replay_capacity() -> usize {
    100_000
}

const fn default_max_terminal() -> usize {
    100_000
}

const fn default_rate_window() -> u64 {
    60
}

const fn default_max_requests() -> u32 {
    60
}

const fn default_max_concurrent() -> u32 {
    8
}

const fn default_webhook_timeout() -> u64 {
    5
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

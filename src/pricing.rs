//! Per-resource pricing.
//!
//! Each upstream endpoint carries an advertised price in micro-USDC; paths
//! without an explicit entry fall back to the default price.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Advertised price and denomination for one requested resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Resource path as requested by the agent (e.g. `/v1/predict`).
    pub path: String,
    /// Advertised price in micro-units of `token`.
    pub price: u64,
    /// Accepted denomination.
    pub token: String,
}

/// Price table mapping resource paths to prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTable {
    /// Price applied to paths without an explicit entry.
    #[serde(default = "default_price")]
    pub default_price: u64,
    /// Accepted denomination for all resources.
    #[serde(default = "default_token")]
    pub token: String,
    /// Explicit per-path prices.
    #[serde(default)]
    pub endpoints: HashMap<String, u64>,
}

fn default_price() -> u64 {
    10_000 // 0.01 USDC
}

fn default_token() -> String {
    "USDC".to_string()
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            default_price: default_price(),
            token: default_token(),
            endpoints: HashMap::new(),
        }
    }
}

impl PriceTable {
    /// Resolve the advertised price for a path.
    #[must_use]
    pub fn resource(&self, path: &str) -> Resource {
        let price = self
            .endpoints
            .get(path)
            .copied()
            .unwrap_or(self.default_price);
        Resource {
            path: path.to_string(),
            price,
            token: self.token.clone(),
        }
    }

    /// Number of explicitly priced endpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Whether the table has no explicit entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

//! Per-agent admission control.
//!
//! Two independent limits are checked atomically before any payment
//! processing begins: a windowed request-rate cap and a concurrency cap on
//! in-flight claims. Admission is modeled as scoped acquisition: a
//! successful [`RateLimiter::admit`] returns an [`AdmissionSlot`] whose Drop
//! releases the in-flight count, so every exit path (settlement, rejection,
//! upstream failure, timeout) releases exactly once.
//!
//! Rejections here never touch escrow or the ledger — admission runs
//! strictly before verification.

use crate::claim::AgentId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Length of the request-counting window.
    pub window: Duration,
    /// Maximum requests per agent per window (default cap).
    pub max_requests: u32,
    /// Maximum concurrent in-flight claims per agent.
    pub max_concurrent: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 60,
            max_concurrent: 8,
        }
    }
}

/// Why admission was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// The agent exhausted its request budget for the current window.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// The agent is already at its concurrency cap.
    #[error("too many concurrent claims: cap {cap}")]
    TooManyConcurrent {
        /// The configured concurrency cap.
        cap: u32,
    },
}

/// Per-agent budget state.
#[derive(Debug)]
struct RateBudget {
    window_start: Instant,
    request_count: u32,
    in_flight: u32,
    /// Per-agent request-rate override, if configured.
    max_requests: Option<u32>,
}

impl RateBudget {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            request_count: 0,
            in_flight: 0,
            max_requests: None,
        }
    }
}

struct Inner {
    config: RateLimiterConfig,
    budgets: Mutex<HashMap<AgentId, RateBudget>>,
}

/// Per-agent admission gate.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                budgets: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Admit one request for `agent`, or refuse with the specific reason.
    ///
    /// Both limits are evaluated under one lock so an agent can never slip
    /// past either cap between check and increment.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::RateLimited`] or
    /// [`RateLimitError::TooManyConcurrent`], distinguished for
    /// observability.
    pub fn admit(&self, agent: &AgentId) -> Result<AdmissionSlot, RateLimitError> {
        let now = Instant::now();
        let mut budgets = self.inner.budgets.lock();
        let budget = budgets
            .entry(agent.clone())
            .or_insert_with(|| RateBudget::new(now));

        // Reset an elapsed window.
        if now.duration_since(budget.window_start) >= self.inner.config.window {
            budget.window_start = now;
            budget.request_count = 0;
        }

        if budget.in_flight >= self.inner.config.max_concurrent {
            debug!(
                "agent {agent} refused: {} claims in flight (cap {})",
                budget.in_flight, self.inner.config.max_concurrent
            );
            return Err(RateLimitError::TooManyConcurrent {
                cap: self.inner.config.max_concurrent,
            });
        }

        let cap = budget.max_requests.unwrap_or(self.inner.config.max_requests);
        if budget.request_count >= cap {
            let elapsed = now.duration_since(budget.window_start);
            let retry_after = self.inner.config.window.saturating_sub(elapsed);
            debug!("agent {agent} rate limited ({cap} requests/window)");
            return Err(RateLimitError::RateLimited {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        budget.request_count += 1;
        budget.in_flight += 1;
        trace!(
            "agent {agent} admitted ({}/{} in window, {} in flight)",
            budget.request_count,
            cap,
            budget.in_flight
        );

        Ok(AdmissionSlot {
            inner: Arc::clone(&self.inner),
            agent: agent.clone(),
        })
    }

    /// Set a custom request-rate cap for one agent.
    pub fn set_agent_limit(&self, agent: &AgentId, max_requests: u32) {
        let now = Instant::now();
        let mut budgets = self.inner.budgets.lock();
        budgets
            .entry(agent.clone())
            .or_insert_with(|| RateBudget::new(now))
            .max_requests = Some(max_requests);
    }

    /// Current in-flight claim count for an agent.
    #[must_use]
    pub fn in_flight(&self, agent: &AgentId) -> u32 {
        self.inner
            .budgets
            .lock()
            .get(agent)
            .map_or(0, |b| b.in_flight)
    }
}

/// RAII admission slot; dropping it releases the in-flight count.
pub struct AdmissionSlot {
    inner: Arc<Inner>,
    agent: AgentId,
}

impl std::fmt::Debug for AdmissionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionSlot")
            .field("agent", &self.agent)
            .finish_non_exhaustive()
    }
}

impl AdmissionSlot {
    /// The agent this slot was granted to.
    #[must_use]
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        let mut budgets = self.inner.budgets.lock();
        if let Some(budget) = budgets.get_mut(&self.agent) {
            budget.in_flight = budget.in_flight.saturating_sub(1);
            // Drop idle entries once their window has elapsed so the map
            // does not grow with one-shot agents.
            if budget.in_flight == 0
                && budget.window_start.elapsed() >= self.inner.config.window
                && budget.max_requests.is_none()
            {
                budgets.remove(&self.agent);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, max_concurrent: u32) -> RateLimiter {
        RateLimiter::new(RateLimiterConfig {
            window: Duration::from_secs(60),
            max_requests,
            max_concurrent,
        })
    }

    #[test]
    fn test_admit_within_caps() {
        let limiter = limiter(10, 4);
        let agent = AgentId::from("0xagent");

        let _slot = limiter.admit(&agent).expect("should admit");
        assert_eq!(limiter.in_flight(&agent), 1);
    }

    #[test]
    fn test_concurrency_cap_enforced() {
        let limiter = limiter(100, 2);
        let agent = AgentId::from("0xagent");

        let _a = limiter.admit(&agent).unwrap();
        let _b = limiter.admit(&agent).unwrap();
        let err = limiter.admit(&agent).unwrap_err();

        assert_eq!(err, RateLimitError::TooManyConcurrent { cap: 2 });
    }

    #[test]
    fn test_slot_drop_releases_concurrency() {
        let limiter = limiter(100, 1);
        let agent = AgentId::from("0xagent");

        let slot = limiter.admit(&agent).unwrap();
        assert!(limiter.admit(&agent).is_err());

        drop(slot);
        assert_eq!(limiter.in_flight(&agent), 0);
        assert!(limiter.admit(&agent).is_ok());
    }

    #[test]
    fn test_rate_cap_enforced() {
        let limiter = limiter(3, 100);
        let agent = AgentId::from("0xagent");

        // Slots dropped immediately: concurrency stays free, rate budget burns.
        for _ in 0..3 {
            let _ = limiter.admit(&agent).unwrap();
        }
        let err = limiter.admit(&agent).unwrap_err();
        assert!(matches!(err, RateLimitError::RateLimited { .. }));
    }

    #[test]
    fn test_rate_cap_window_reset() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            window: Duration::from_millis(30),
            max_requests: 1,
            max_concurrent: 100,
        });
        let agent = AgentId::from("0xagent");

        let _ = limiter.admit(&agent).unwrap();
        assert!(limiter.admit(&agent).is_err());

        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.admit(&agent).is_ok());
    }

    #[test]
    fn test_agents_are_independent() {
        let limiter = limiter(100, 1);
        let a = AgentId::from("0xalice");
        let b = AgentId::from("0xbob");

        let _a = limiter.admit(&a).unwrap();
        assert!(limiter.admit(&b).is_ok());
    }

    #[test]
    fn test_per_agent_override() {
        let limiter = limiter(100, 100);
        let agent = AgentId::from("0xquota");

        limiter.set_agent_limit(&agent, 1);
        let _ = limiter.admit(&agent).unwrap();
        let err = limiter.admit(&agent).unwrap_err();
        assert!(matches!(err, RateLimitError::RateLimited { .. }));
    }
}

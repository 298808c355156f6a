// SPDX-License-Identifier: Apache-2.0
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use tracing::{info, warn};

use crate::auth::Claims;
use crate::error::GatewayError;

/// Requests per minute allowed for one user or address
pub const DEFAULT_PER_MINUTE: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: DEFAULT_PER_MINUTE,
            enabled: true,
        }
    }
}

/// Key requests by user when authenticated, by client address otherwise.
pub fn rate_limit_key(claims: Option<&Claims>, peer: Option<&str>) -> String {
    match claims {
        Some(claims) => format!("user:{}", claims.sub),
        None => format!("ip:{}", peer.unwrap_or("unknown")),
    }
}

/// Per-key request limiter shared by all workers.
pub struct GatewayRateLimiter {
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
}

impl GatewayRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiter = match NonZeroU32::new(config.per_minute) {
            Some(n) if config.enabled => Some(RateLimiter::keyed(Quota::per_minute(n))),
            _ => None,
        };
        info!(
            enabled = limiter.is_some(),
            per_minute = config.per_minute,
            "Rate limiting configured"
        );
        Self {
            limiter,
            clock: DefaultClock::default(),
        }
    }

    /// Count one request against `key`.
    pub fn check(&self, key: &str) -> Result<(), GatewayError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        limiter.check_key(&key.to_string()).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            warn!(key, retry_after, "Rate limit exceeded");
            GatewayError::RateLimited {
                retry_after: retry_after.max(1),
            }
        })
    }

    /// Forget keys whose quota has fully replenished.
    pub fn prune(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
        }
    }
}

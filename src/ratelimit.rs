//! Fixed-window rate limiter
//!
//! Boundary policy only: a process-local counter per identity, reset
//! each window. State does not survive restarts and is not shared
//! across instances; that is an accepted limitation of this policy.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{error::EscrowError, EscrowResult};

/// Configuration for the rate limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in seconds
    pub window_secs: i64,
    /// Maximum actions per identity per window
    pub max_actions: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_actions: 30,
        }
    }
}

struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Charge one action against the identity's current window.
    pub async fn charge(&self, identity: &str) -> EscrowResult<()> {
        let now = Utc::now();
        let window_len = Duration::seconds(self.config.window_secs);
        let mut windows = self.windows.lock().await;

        let window = windows.entry(identity.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now - window.started_at >= window_len {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.config.max_actions {
            return Err(EscrowError::RateLimited(format!(
                "identity exceeded {} actions per {}s",
                self.config.max_actions, self.config.window_secs
            )));
        }

        window.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(RateLimitConfig {
            window_secs: 60,
            max_actions: 3,
        });

        for _ in 0..3 {
            limiter.charge("alice").await.unwrap();
        }
        assert!(matches!(
            limiter.charge("alice").await,
            Err(EscrowError::RateLimited(_))
        ));
    }

    #[tokio::test]
    async fn identities_are_counted_separately() {
        let limiter = RateLimiter::new(RateLimitConfig {
            window_secs: 60,
            max_actions: 1,
        });

        limiter.charge("alice").await.unwrap();
        limiter.charge("bob").await.unwrap();
        assert!(limiter.charge("alice").await.is_err());
    }

    #[tokio::test]
    async fn window_resets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            window_secs: 0,
            max_actions: 1,
        });

        limiter.charge("alice").await.unwrap();
        // Zero-length window: every charge starts a fresh window.
        limiter.charge("alice").await.unwrap();
    }
}

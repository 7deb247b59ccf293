// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dial Retry Policy
//!
//! [`RetryPolicy`] bounds how often a connection is dialed and how long to wait between
//! attempts. The delay before retry `n` (0-indexed) is
//! `min(min_timeout × factor^n × r, max_timeout)` where `r` is drawn from `[1, 2)` when
//! `randomize` is set and is `1` otherwise.
//!
//! ```rust
//! use rabbitmq_worker::policy::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy { retries: Some(3), ..RetryPolicy::default() };
//! assert_eq!(policy.delay(0), Duration::from_millis(1000));
//! assert_eq!(policy.delay(2), Duration::from_millis(4000));
//! ```

use crate::errors::AmqpError;
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// Delay cap, in milliseconds, applied to reconnection when the policy leaves it unbounded.
pub const RECONNECT_MAX_TIMEOUT: u64 = 60_000;

/// Retry policy applied when dialing the broker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Extra attempts after the first one. `None` retries forever.
    pub retries: Option<u32>,
    /// Multiplicative growth factor between attempts.
    pub factor: f64,
    /// Delay before the first retry, in milliseconds.
    pub min_timeout: u64,
    /// Delay cap in milliseconds. `None` leaves the delay unbounded.
    pub max_timeout: Option<u64>,
    /// Multiplies every delay by a random factor in `[1, 2)`.
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: Some(0),
            factor: 2.0,
            min_timeout: 1000,
            max_timeout: None,
            randomize: false,
        }
    }
}

impl RetryPolicy {
    /// Same curve, without an attempt limit. Used to re-dial a lost connection.
    ///
    /// The delay is capped at [`RECONNECT_MAX_TIMEOUT`] (or `min_timeout` when larger) unless
    /// `max_timeout` is set.
    pub fn unbounded(&self) -> RetryPolicy {
        RetryPolicy {
            retries: None,
            max_timeout: self
                .max_timeout
                .or(Some(RECONNECT_MAX_TIMEOUT.max(self.min_timeout))),
            ..self.clone()
        }
    }

    /// Whether another attempt is allowed after `attempt` failed ones.
    pub fn allows(&self, attempt: u32) -> bool {
        self.retries.map_or(true, |retries| attempt < retries)
    }

    /// Delay before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let random = if self.randomize {
            rand::thread_rng().gen_range(1.0..2.0)
        } else {
            1.0
        };

        let exp = attempt.min(i32::MAX as u32) as i32;
        let millis = random * self.min_timeout as f64 * self.factor.powi(exp);
        let capped = match self.max_timeout {
            Some(max) if !millis.is_finite() || millis > max as f64 => max as f64,
            None if !millis.is_finite() => u64::MAX as f64,
            _ => millis.round(),
        };

        Duration::from_millis(capped as u64)
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.factor < 1.0 {
            return Err(AmqpError::ConfigError(
                "connection retry factor must be >= 1".to_owned(),
            ));
        }
        if matches!(self.max_timeout, Some(max) if max < self.min_timeout) {
            return Err(AmqpError::ConfigError(
                "connection retry min_timeout exceeds max_timeout".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth_without_randomization() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1000));
        assert_eq!(policy.delay(1), Duration::from_millis(2000));
        assert_eq!(policy.delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_timeout: Some(5000),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(10), Duration::from_millis(5000));
    }

    #[test]
    fn randomized_delay_stays_within_bounds() {
        let policy = RetryPolicy {
            randomize: true,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay < Duration::from_millis(4000));
        }
    }

    #[test]
    fn attempt_budget() {
        let policy = RetryPolicy {
            retries: Some(2),
            ..RetryPolicy::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
        assert!(policy.unbounded().allows(1_000));
    }

    #[test]
    fn reconnect_delay_is_capped_by_default() {
        let policy = RetryPolicy::default().unbounded();
        assert_eq!(policy.delay(30), Duration::from_millis(RECONNECT_MAX_TIMEOUT));

        let explicit = RetryPolicy {
            max_timeout: Some(5000),
            ..RetryPolicy::default()
        };
        assert_eq!(explicit.unbounded().delay(30), Duration::from_millis(5000));
    }

    #[test]
    fn default_policy_never_retries() {
        assert!(!RetryPolicy::default().allows(0));
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Curve
//!
//! Pure functions deciding whether a failed task is retried, how long it waits in the retry
//! queue and at which priority it comes back.

use crate::{config::RetryQueueConfigs, message::DeathRecord};

/// A task is retried while `0 <= retry_count < max_count`. Negative counts opt out.
pub fn should_retry(retry_count: i64, max_count: i64) -> bool {
    (0..max_count).contains(&retry_count)
}

/// Expiration, in milliseconds, of the next retry copy.
///
/// The base is `original_expiration × (count + 1)` of the broker's dead-letter history when
/// present, the message's own expiration otherwise. It is raised to `min_timeout` and, for
/// every retry but the first, multiplied by `factor` and capped to `max_timeout`.
pub fn next_expiration(
    cfg: &RetryQueueConfigs,
    retry_count: i64,
    death: Option<DeathRecord>,
    expiration: u64,
) -> u64 {
    let base = match death {
        Some(death) => death
            .original_expiration
            .saturating_mul(death.count.saturating_add(1).max(0) as u64),
        None => expiration,
    };

    let expiration = base.max(cfg.min_timeout);
    if retry_count > 0 {
        (expiration as f64 * cfg.factor).min(cfg.max_timeout as f64) as u64
    } else {
        expiration
    }
}

/// Priority of the next retry copy: `max_priority - floor(retry_count × max_priority / max_count)`.
/// Zero when the retry queue has no priority support.
pub fn priority(max_priority: u8, retry_count: i64, max_count: i64) -> u8 {
    if max_priority == 0 || max_count <= 0 {
        return 0;
    }

    let max = i64::from(max_priority);
    let decay = retry_count.max(0).saturating_mul(max) / max_count;
    (max - decay).clamp(0, max) as u8
}

/// Reason recorded when a task leaves the retry loop for good.
pub fn exhausted_reason(retry_count: i64, max_count: i64) -> String {
    if retry_count >= max_count {
        format!("Max retries exceeded {retry_count} >= {max_count}")
    } else {
        "General failure".to_owned()
    }
}

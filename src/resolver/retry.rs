//! Retry accounting.
//!
//! A failed message is retried by rejecting it into the dead-letter exchange; the broker
//! records each pass in the `x-death` header. The count that existed *before* the current
//! failure decides: a message is retried while `count < limit`.

use crate::broker::MessageProperties;
use crate::constants::DEFAULT_MAX_RETRIES;

/// Number of times the broker has already dead-lettered this message
///
/// Prefers the `rejected` entry for `primary_queue`; falls back to the most recent entry,
/// then to zero.
pub fn death_count(properties: &MessageProperties, primary_queue: &str) -> u64 {
    let deaths = properties.deaths();
    deaths
        .iter()
        .find(|d| d.queue == primary_queue && d.reason == "rejected")
        .or_else(|| deaths.first())
        .map(|d| d.count)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reject without requeue so the message waits in the retry queue
    Retry { retry_count: u64, limit: u32 },
    /// Acknowledge and drop for good
    Exhausted { retry_count: u64, limit: u32 },
}

impl RetryDecision {
    pub fn limit(&self) -> u32 {
        match self {
            Self::Retry { limit, .. } | Self::Exhausted { limit, .. } => *limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    default_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// `default_limit` of zero falls back to the built-in 60
    pub fn new(default_limit: u32) -> Self {
        Self {
            default_limit: if default_limit == 0 {
                DEFAULT_MAX_RETRIES
            } else {
                default_limit
            },
        }
    }

    /// Limit in force for one error outcome; `Some(0)` counts as not provided
    pub fn effective_limit(&self, max_retries: Option<u32>) -> u32 {
        match max_retries {
            Some(limit) if limit > 0 => limit,
            _ => self.default_limit,
        }
    }

    pub fn decide(&self, retry_count: u64, max_retries: Option<u32>) -> RetryDecision {
        let limit = self.effective_limit(max_retries);
        if retry_count < u64::from(limit) {
            RetryDecision::Retry { retry_count, limit }
        } else {
            RetryDecision::Exhausted { retry_count, limit }
        }
    }
}

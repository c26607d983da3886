//! Error classification, backoff policy and dead-letter promotion.
//!
//! Classification runs a fixed-order rule chain over the error surface
//! ([`ClassifiableError`]): rate limits first, then server errors,
//! timeouts, connection failures, client errors, auth and validation
//! keywords, and finally a retryable default for anything unrecognized.
//! Rule order matters; a 429 is a rate limit even though it is also a
//! 4xx.

use rand::rngs::OsRng;
use rand::Rng;
use std::fmt;
use std::time::Duration;

use crate::model::WorkItem;
use crate::step::ClassifiableError;

/// Consecutive same-step failures before a retryable error promotes the
/// item to the dead-letter status.
pub const DEAD_LETTER_THRESHOLD: u32 = 3;

/// Broad category a failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient failure, retried with exponential backoff.
    Retryable,
    /// Upstream throttling, retried with a longer backoff base.
    RateLimit,
    /// Will not succeed on retry; promoted to dead-letter immediately.
    Terminal,
}

impl ErrorKind {
    /// Stable lowercase string persisted on item records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::RateLimit => "rate_limit",
            Self::Terminal => "terminal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one failure.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Broad category.
    pub kind: ErrorKind,
    /// Whether retrying can help.
    pub retryable: bool,
    /// Which rule matched, for logs.
    pub reason: &'static str,
    /// HTTP status, when the failure carried one.
    pub status: Option<u16>,
}

/// Classifies an error by the fixed-order rule chain.
#[must_use]
pub fn classify(err: &dyn ClassifiableError) -> Classification {
    let status = err.http_status();
    let message = err.message().to_lowercase();
    let code = err.code().unwrap_or("");

    if status == Some(429) || message.contains("rate limit") || message.contains("too many requests")
    {
        return Classification {
            kind: ErrorKind::RateLimit,
            retryable: true,
            reason: "rate limited",
            status,
        };
    }

    if matches!(status, Some(s) if (500..=599).contains(&s)) {
        return Classification {
            kind: ErrorKind::Retryable,
            retryable: true,
            reason: "server error",
            status,
        };
    }

    if code == "ETIMEDOUT"
        || code == "ECONNRESET"
        || message.contains("timeout")
        || message.contains("timed out")
    {
        return Classification {
            kind: ErrorKind::Retryable,
            retryable: true,
            reason: "timeout",
            status,
        };
    }

    if code == "ECONNREFUSED" || code == "ENOTFOUND" {
        return Classification {
            kind: ErrorKind::Retryable,
            retryable: true,
            reason: "connection failure",
            status,
        };
    }

    if matches!(status, Some(s) if (400..=499).contains(&s)) {
        return Classification {
            kind: ErrorKind::Terminal,
            retryable: false,
            reason: "client error",
            status,
        };
    }

    if message.contains("unauthorized")
        || message.contains("forbidden")
        || message.contains("authentication")
    {
        return Classification {
            kind: ErrorKind::Terminal,
            retryable: false,
            reason: "auth failure",
            status,
        };
    }

    if message.contains("validation") || message.contains("invalid") || message.contains("malformed")
    {
        return Classification {
            kind: ErrorKind::Terminal,
            retryable: false,
            reason: "validation failure",
            status,
        };
    }

    Classification {
        kind: ErrorKind::Retryable,
        retryable: true,
        reason: "unclassified",
        status,
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Base delay for ordinary retryable failures.
    pub base_ms: u64,
    /// Base delay for rate-limit failures.
    pub rate_limit_base_ms: u64,
    /// Exponential multiplier per consecutive failure.
    pub multiplier: u64,
    /// Delay ceiling.
    pub max_ms: u64,
    /// Symmetric jitter fraction applied to the computed delay.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            rate_limit_base_ms: 10_000,
            multiplier: 2,
            max_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// Backoff delay before the `failure_count`-th consecutive failure
    /// may be retried.
    ///
    /// `base * multiplier^(failure_count - 1)`, capped at `max_ms`, with
    /// symmetric jitter so simultaneous failures do not retry in
    /// lockstep. Jitter is drawn from the OS entropy source.
    #[must_use]
    pub fn delay(&self, kind: ErrorKind, failure_count: u32) -> Duration {
        let base = if kind == ErrorKind::RateLimit {
            self.rate_limit_base_ms
        } else {
            self.base_ms
        };
        let exponent = failure_count.saturating_sub(1).min(16);
        let raw = base.saturating_mul(self.multiplier.saturating_pow(exponent));
        let capped = raw.min(self.max_ms);

        // Uniform integer jitter from the OS entropy source, not a float
        // RNG, so backoff timing cannot be predicted.
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let span = ((capped as f64) * self.jitter).round() as i64;
        let offset = if span > 0 {
            OsRng.gen_range(-span..=span)
        } else {
            0
        };
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        Duration::from_millis((capped as i64 + offset).max(0) as u64)
    }
}

/// True when a failure should promote the item to the dead-letter status.
///
/// Terminal failures promote immediately; retryable failures promote once
/// the consecutive same-step count reaches [`DEAD_LETTER_THRESHOLD`].
#[must_use]
pub fn should_dead_letter(classification: &Classification, failure_count: u32) -> bool {
    !classification.retryable || failure_count >= DEAD_LETTER_THRESHOLD
}

/// The consecutive-failure count after one more failure at `step_name`.
///
/// The counter tracks the same step failing repeatedly; a failure at a
/// different step resets it to 1.
#[must_use]
pub fn next_failure_count(item: &WorkItem, step_name: &str) -> u32 {
    if item.last_failed_step.as_deref() == Some(step_name) {
        item.failure_count + 1
    } else {
        1
    }
}

//! Retry and dead-letter policy.
//!
//! Handler failures come classified as [`FailureClass::Transient`] (upstream
//! unreachable, timeout) or [`FailureClass::Permanent`] (malformed business
//! data, unrecoverable validation failure). The policy turns a classified
//! failure plus the delivery attempt count into a [`Verdict`]:
//!
//! - `Transient` with attempts remaining → retry after a capped, jittered
//!   exponential backoff
//! - `Transient` with attempts exhausted, or `Permanent` at any attempt →
//!   dead-letter
//!
//! Decode-level failures never reach the policy; the pipeline dead-letters
//! them directly.

use std::time::Duration;

use rand::Rng;
use tracing_error::SpanTrace;

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying: the same input may succeed later.
    Transient,
    /// Never retried: the same input will keep failing.
    Permanent,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
        }
    }
}

/// Business-logic failure reported by a
/// [`ConversationHandler`](crate::consumer::ConversationHandler).
#[derive(Debug)]
pub struct HandlerError {
    context: SpanTrace,
    class: FailureClass,
    source: tower::BoxError,
}

impl HandlerError {
    /// A failure the policy may retry.
    pub fn transient(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            class: FailureClass::Transient,
            source: err.into(),
        }
    }

    /// A failure that must never be retried.
    pub fn permanent(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            class: FailureClass::Permanent,
            source: err.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        self.class
    }

    /// Human-readable reason attached to dead-letter entries.
    pub fn reason(&self) -> String {
        self.source.to_string()
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Handler error ({}): {}", self.class.as_str(), self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// What the pipeline should do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Republish to the input queue with an incremented attempt count after
    /// waiting `delay`.
    Retry { delay: Duration },
    /// Route to the dead-letter queue and acknowledge the original.
    DeadLetter,
}

/// Retry schedule: attempt limit plus backoff shape.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total delivery attempts before a transient failure is dead-lettered.
    pub max_attempts: u32,
    /// Backoff for the first retry; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on any single backoff delay.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Decide the verdict for a failure on delivery attempt `attempt`
    /// (0-based: the first delivery is attempt 0).
    pub fn verdict(&self, class: FailureClass, attempt: u32) -> Verdict {
        match class {
            FailureClass::Permanent => Verdict::DeadLetter,
            FailureClass::Transient if attempt + 1 >= self.max_attempts => Verdict::DeadLetter,
            FailureClass::Transient => Verdict::Retry {
                delay: self.backoff(attempt),
            },
        }
    }

    /// Exponential backoff with full jitter, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.backoff_cap);
        let jittered = rand::thread_rng().gen_range(exp.as_millis() / 2..=exp.as_millis());
        Duration::from_millis(jittered as u64)
    }
}

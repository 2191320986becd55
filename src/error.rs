//! Error types for cascade.
//!
//! All errors that can occur within the pipeline are represented by
//! [`CascadeError`] and propagated via `Result<T, CascadeError>`.
//!
//! # Error Classification
//!
//! Errors are classified into four categories that determine retry behavior:
//! - **User** — bad definitions, type mismatches, cycles, missing grants.
//!   Never retried.
//! - **Schema** — a halted migration sequence. Not retried; requires operator
//!   intervention before the remaining operations may run.
//! - **System** — transient conditions such as a skipped refresh. Retried
//!   with backoff.
//! - **Internal** — bugs. Not retried.
//!
//! # Retry Policy
//!
//! The [`RetryPolicy`] struct encapsulates exponential backoff with jitter.
//! The refresh scheduler uses this to decide whether and when to retry a
//! failed dictionary rebuild.

use std::fmt;

use crate::value::DataType;

/// Primary error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    // ── User errors — fail, don't retry ──────────────────────────────────
    /// An invalid argument was provided to an API function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named table is not registered in the catalog.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The named column does not exist in the table definition.
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// The named dictionary is not registered in the catalog.
    #[error("unknown dictionary: {0}")]
    UnknownDictionary(String),

    /// A table, dictionary, rule, or migration with this name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A value could not be coerced to its declared column type.
    #[error("type mismatch for column '{column}' in table '{table}': expected {expected}, got {got}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: DataType,
        got: String,
    },

    /// Registering this propagation rule would create a cycle.
    #[error("cycle detected in propagation graph: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A re-aggregation rule was declared over a non-additive source.
    /// Replacing-kind buckets cannot be merged across grains and must be
    /// rebuilt from source.
    #[error("cannot re-aggregate from non-additive table '{0}'")]
    NonAdditiveReaggregation(String),

    /// A dictionary lookup requires a grant that has not been issued.
    #[error(
        "missing grant '{grant}' required by dictionary '{dictionary}'. \
         Lookups would silently corrupt every downstream path; issue the \
         grant with Pipeline::grant(\"{grant}\") before resolving"
    )]
    MissingGrant { dictionary: String, grant: String },

    /// A dictionary rebuild produced more entries than its declared bound.
    /// The previous generation stays active.
    #[error(
        "dictionary '{dictionary}' rebuild produced {entries} entries, \
         exceeding max_entries = {max_entries}"
    )]
    DictionaryCapacity {
        dictionary: String,
        entries: usize,
        max_entries: usize,
    },

    // ── Schema errors — halt the migration sequence ──────────────────────
    /// A schema-change operation failed. Later operations may assume this
    /// one succeeded, so the runner halts instead of skipping ahead.
    #[error("migration '{name}' halted: {reason}")]
    MigrationHalted { name: String, reason: String },

    // ── System errors — retry with backoff ───────────────────────────────
    /// A refresh was skipped (e.g. a previous one is still running).
    #[error("refresh skipped: {0}")]
    RefreshSkipped(String),

    // ── Internal errors — should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Classification of error severity/kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    User,
    Schema,
    System,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::User => write!(f, "USER"),
            ErrorKind::Schema => write!(f, "SCHEMA"),
            ErrorKind::System => write!(f, "SYSTEM"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl CascadeError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CascadeError::InvalidArgument(_)
            | CascadeError::UnknownTable(_)
            | CascadeError::UnknownColumn { .. }
            | CascadeError::UnknownDictionary(_)
            | CascadeError::AlreadyExists(_)
            | CascadeError::TypeMismatch { .. }
            | CascadeError::CycleDetected(_)
            | CascadeError::NonAdditiveReaggregation(_)
            | CascadeError::MissingGrant { .. }
            | CascadeError::DictionaryCapacity { .. } => ErrorKind::User,

            CascadeError::MigrationHalted { .. } => ErrorKind::Schema,

            CascadeError::RefreshSkipped(_) => ErrorKind::System,

            CascadeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error is retryable by the scheduler.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CascadeError::RefreshSkipped(_))
    }

    /// Whether this error should count toward the consecutive-error limit
    /// that auto-suspends a dictionary's scheduled refresh.
    ///
    /// Skipped refreshes don't count because the dictionary itself isn't
    /// broken — the scheduler just couldn't run it this time.
    pub fn counts_toward_suspension(&self) -> bool {
        !matches!(self, CascadeError::RefreshSkipped(_))
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Retry policy with exponential backoff for system errors.
///
/// Used by the scheduler to decide whether a failed dictionary refresh
/// should be retried immediately, deferred, or given up on.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of retry attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay in milliseconds for the given attempt
    /// number (0-based).
    ///
    /// Uses exponential backoff: `base_delay * 2^attempt`, capped at
    /// `max_delay`, with deterministic ±25% jitter based on attempt parity.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4 // -25%
        } else {
            capped.saturating_mul(5) / 4 // +25%
        }
    }

    /// Whether the given attempt (0-based) is within the retry limit.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ── Per-dictionary Retry State ─────────────────────────────────────────────

/// Tracks retry state for a single scheduled refresh target.
///
/// Stored in-memory by the scheduler (not persisted). Reset when a refresh
/// succeeds or the scheduler restarts.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Number of consecutive retryable failures.
    pub attempts: u32,
    /// Timestamp (epoch millis) when the next retry is allowed.
    pub next_retry_at_ms: u64,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            next_retry_at_ms: 0,
        }
    }

    /// Record a retryable failure and compute the next retry time.
    ///
    /// Returns `true` if another retry is allowed, `false` if max attempts
    /// are exhausted.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now_ms: u64) -> bool {
        self.attempts += 1;
        if policy.should_retry(self.attempts) {
            self.next_retry_at_ms = now_ms + policy.backoff_ms(self.attempts - 1);
            true
        } else {
            false
        }
    }

    /// Reset retry state after a successful refresh.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_retry_at_ms = 0;
    }

    /// Whether the target is currently in a retry-backoff period.
    pub fn is_in_backoff(&self, now_ms: u64) -> bool {
        self.attempts > 0 && now_ms < self.next_retry_at_ms
    }
}

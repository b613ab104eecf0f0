//! Error types for pg_docsync.
//!
//! All errors that can occur in the change-propagation engine are
//! represented by [`PgDocSyncError`]. Errors are propagated via
//! `Result<T, PgDocSyncError>` throughout the pipeline.
//!
//! # Error Classification
//!
//! Errors are classified into four categories that determine retry
//! behavior:
//! - **Schema** — compiler/catalog validation failures (bad relationship
//!   attributes, missing FK paths, unknown variants/types). Fatal for the
//!   affected index; never retried.
//! - **Replication** — slot missing or lagging past retention. Requires a
//!   full resync, not a simple retry.
//! - **Transient** — sink or DB I/O errors. Retried with backoff.
//! - **Internal** — bugs. Not retried.
//!
//! # Retry Policy
//!
//! [`RetryPolicy`] encapsulates exponential backoff with jitter. The Index
//! Sink and the snapshot/stream stages use it to decide whether and when
//! to retry a failed operation.

use std::fmt;

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum PgDocSyncError {
    // ── Schema compile-time errors — fatal for the affected index ───────
    /// `relationship` carries an attribute outside the recognized set.
    #[error("Relationship attribute {0} is invalid")]
    RelationshipAttributeError(String),

    /// `relationship.variant` is not `object` or `scalar`.
    #[error("Relationship variant \"{0}\" is invalid")]
    RelationshipVariantError(String),

    /// `relationship.type` is not `one_to_one` or `one_to_many`.
    #[error("Relationship type \"{0}\" is invalid")]
    RelationshipTypeError(String),

    /// A non-root node has no `relationship` attribute.
    #[error("Relationship not present on \"{0}\"")]
    RelationshipError(String),

    /// No foreign-key path (direct or through-table) between parent and
    /// child.
    #[error("No foreign key relationship between \"{parent}\" and \"{child}\"")]
    ForeignKeyError { parent: String, child: String },

    /// A `scalar` node projects zero or more than one column.
    #[error("Scalar relationship on \"{0}\" must project exactly one column, got {1}")]
    ScalarColumnCountError(String, usize),

    /// The schema tree contains a cycle (a node's path revisits a table
    /// already on its own root-to-node path).
    #[error("cycle detected in schema tree: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// The named table/column was not found in the live catalog.
    #[error("catalog lookup failed: {0}")]
    CatalogError(String),

    /// An invalid argument was supplied to a public API function.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ── Replication errors — require full resync ─────────────────────────
    /// The named replication slot does not exist.
    #[error("replication slot missing: {0}")]
    ReplicationSlotMissing(String),

    /// The replication slot has lagged past the server's WAL retention.
    #[error("replication lag exceeded retention for slot {0}")]
    ReplicationLagExceeded(String),

    /// A malformed or unsupported pgoutput message was received.
    #[error("replication decode error: {0}")]
    ReplicationDecodeError(String),

    // ── Transient errors — retried with backoff ───────────────────────────
    /// A sink (search index) write failed transiently (network, 5xx,
    /// throttling).
    #[error("transient sink error: {0}")]
    TransientSinkError(String),

    /// A database query failed transiently (connection reset, lock
    /// timeout, etc).
    #[error("transient db error: {0}")]
    TransientDbError(String),

    /// One or more documents failed permanently during a bulk sink call.
    #[error("{0} document(s) failed permanently during sink write")]
    SinkPermanentFailure(usize),

    // ── Internal errors — should not happen ───────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl PgDocSyncError {
    /// Whether this error is retryable by the caller (sink writes, DB
    /// queries during normal operation).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PgDocSyncError::TransientSinkError(_) | PgDocSyncError::TransientDbError(_)
        )
    }

    /// Whether this error requires a full resync rather than a retry.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            PgDocSyncError::ReplicationSlotMissing(_) | PgDocSyncError::ReplicationLagExceeded(_)
        )
    }

    /// Classify the error for monitoring/alerting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PgDocSyncError::RelationshipAttributeError(_)
            | PgDocSyncError::RelationshipVariantError(_)
            | PgDocSyncError::RelationshipTypeError(_)
            | PgDocSyncError::RelationshipError(_)
            | PgDocSyncError::ForeignKeyError { .. }
            | PgDocSyncError::ScalarColumnCountError(_, _)
            | PgDocSyncError::CycleDetected(_)
            | PgDocSyncError::CatalogError(_)
            | PgDocSyncError::InvalidArgument(_) => ErrorKind::Schema,

            PgDocSyncError::ReplicationSlotMissing(_)
            | PgDocSyncError::ReplicationLagExceeded(_)
            | PgDocSyncError::ReplicationDecodeError(_) => ErrorKind::Replication,

            PgDocSyncError::TransientSinkError(_)
            | PgDocSyncError::TransientDbError(_)
            | PgDocSyncError::SinkPermanentFailure(_) => ErrorKind::Transient,

            PgDocSyncError::InternalError(_) => ErrorKind::Internal,
        }
    }
}

/// Classification of error severity/kind for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Schema,
    Replication,
    Transient,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Schema => write!(f, "SCHEMA"),
            ErrorKind::Replication => write!(f, "REPLICATION"),
            ErrorKind::Transient => write!(f, "TRANSIENT"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Retry policy with exponential backoff for transient errors.
///
/// Used by the Index Sink to decide whether a failed write should be
/// retried immediately, deferred, or escalated to the DLQ/halt path.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of retry attempts before escalating.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay in milliseconds for the given attempt
    /// number (0-based).
    ///
    /// Uses exponential backoff: `base_delay * 2^attempt`, capped at
    /// `max_delay`. Adds simple jitter by varying ±25%.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        if attempt % 2 == 0 {
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

/// Tracks retry state for a single in-flight operation (a sink batch, a
/// DB reconnect loop).
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Number of consecutive failures observed.
    pub attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Record a failure. Returns `Some(backoff_ms)` if another attempt is
    /// allowed under `policy`, `None` if attempts are exhausted.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<u64> {
        let this_attempt = self.attempts;
        self.attempts += 1;
        if policy.should_retry(this_attempt) {
            Some(policy.backoff_ms(this_attempt))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            PgDocSyncError::RelationshipTypeError("x".into()).kind(),
            ErrorKind::Schema
        );
        assert_eq!(
            PgDocSyncError::ReplicationSlotMissing("x".into()).kind(),
            ErrorKind::Replication
        );
        assert_eq!(
            PgDocSyncError::TransientDbError("x".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            PgDocSyncError::InternalError("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(PgDocSyncError::TransientSinkError("x".into()).is_retryable());
        assert!(PgDocSyncError::TransientDbError("x".into()).is_retryable());
        assert!(!PgDocSyncError::CycleDetected(vec![]).is_retryable());
        assert!(!PgDocSyncError::InternalError("x".into()).is_retryable());
    }

    #[test]
    fn test_requires_resync() {
        assert!(PgDocSyncError::ReplicationSlotMissing("slot".into()).requires_resync());
        assert!(PgDocSyncError::ReplicationLagExceeded("slot".into()).requires_resync());
        assert!(!PgDocSyncError::TransientDbError("x".into()).requires_resync());
    }

    #[test]
    fn test_foreign_key_error_message() {
        let e = PgDocSyncError::ForeignKeyError {
            parent: "public.book".into(),
            child: "public.city".into(),
        };
        assert_eq!(
            e.to_string(),
            "No foreign key relationship between \"public.book\" and \"public.city\""
        );
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        };
        assert_eq!(policy.backoff_ms(0), 750);
        assert_eq!(policy.backoff_ms(1), 2500);
        assert_eq!(policy.backoff_ms(2), 3000);
        assert_eq!(policy.backoff_ms(3), 10_000);
    }

    #[test]
    fn test_retry_state_lifecycle() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_attempts: 2,
        };
        let mut state = RetryState::new();
        assert!(state.record_failure(&policy).is_some());
        assert_eq!(state.attempts, 1);
        assert!(state.record_failure(&policy).is_none());
        assert_eq!(state.attempts, 2);
        state.reset();
        assert_eq!(state.attempts, 0);
    }
}

//! Index Sink — bulk-applies destination operations with retry and
//! idempotent writes (spec.md §4.8).
//!
//! The search-client transport itself is out of scope (spec.md §1): this
//! module defines the [`SearchTransport`] trait the transport must
//! implement and the [`IndexSink`] that drives it with the retry/backoff
//! policy from [`crate::error::RetryPolicy`], the way `pgtrickle-relay`
//! puts each of its sink backends (NATS, webhook, Kafka, ...) behind one
//! `async_trait` so the relay loop driving them stays backend-agnostic.

use async_trait::async_trait;

use crate::document::AssembledDocument;
use crate::error::{PgDocSyncError, RetryPolicy, RetryState};

/// A single destination write, translated from a [`crate::builder::BuildAction`].
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    Upsert(AssembledDocument),
    Delete { id: String },
}

impl From<crate::builder::BuildAction> for BulkOp {
    fn from(action: crate::builder::BuildAction) -> Self {
        match action {
            crate::builder::BuildAction::Upsert(doc) => BulkOp::Upsert(doc),
            crate::builder::BuildAction::Delete { id } => BulkOp::Delete { id },
        }
    }
}

impl BulkOp {
    pub fn id(&self) -> &str {
        match self {
            BulkOp::Upsert(doc) => &doc.id,
            BulkOp::Delete { id } => id,
        }
    }
}

/// Per-document outcome of a bulk call, as the destination's bulk API
/// reports it.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Ok,
    /// Transient failure (network, 5xx, throttling) — worth retrying.
    Transient(String),
    /// Permanent, per-document failure (e.g. a mapping conflict) — not
    /// worth retrying (spec.md §4.8).
    Permanent(String),
}

/// The pluggable connection to a search engine's bulk write API. A real
/// implementation wraps an HTTP client against Elasticsearch/OpenSearch's
/// `_bulk` endpoint; tests and the snapshot path can use
/// [`InMemoryTransport`].
///
/// Implementations must be idempotent: re-delivering the same [`BulkOp`]
/// twice (e.g. after a retried batch whose first attempt actually
/// succeeded server-side) must be a semantic no-op, which a content-
/// addressed upsert/delete-by-id naturally provides (spec.md §4.8).
#[async_trait]
pub trait SearchTransport: Send + Sync {
    /// Apply a batch of operations, returning one outcome per input
    /// operation, in the same order.
    async fn bulk_apply(&self, ops: &[BulkOp]) -> Result<Vec<OpOutcome>, PgDocSyncError>;
}

/// An in-memory [`SearchTransport`] used by the snapshot path's tests and
/// as a reference implementation. Keeps a map of live document ids to
/// bodies; deletes remove the id; idempotent by construction (re-applying
/// the same upsert/delete just repeats the same map mutation).
#[derive(Default)]
pub struct InMemoryTransport {
    pub documents: std::sync::Mutex<std::collections::HashMap<String, serde_json::Value>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> std::collections::HashMap<String, serde_json::Value> {
        self.documents.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchTransport for InMemoryTransport {
    async fn bulk_apply(&self, ops: &[BulkOp]) -> Result<Vec<OpOutcome>, PgDocSyncError> {
        let mut docs = self.documents.lock().unwrap();
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                BulkOp::Upsert(doc) => {
                    docs.insert(doc.id.clone(), doc.body.clone());
                }
                BulkOp::Delete { id } => {
                    docs.remove(id);
                }
            }
            outcomes.push(OpOutcome::Ok);
        }
        Ok(outcomes)
    }
}

/// The result of [`IndexSink::apply_batch`]: which ids failed
/// permanently, if any (spec.md §4.8 "fails over to DLQ ... on
/// persistent per-document errors").
#[derive(Debug, Clone, Default)]
pub struct SinkResult {
    pub permanent_failures: Vec<String>,
}

impl SinkResult {
    pub fn all_confirmed(&self) -> bool {
        self.permanent_failures.is_empty()
    }
}

/// Drives a [`SearchTransport`] with the engine's retry policy (spec.md
/// §4.8, §7 `TransientSinkError`).
pub struct IndexSink<T: SearchTransport> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: SearchTransport> IndexSink<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Apply `ops`, retrying the whole batch with exponential backoff on a
    /// transport-level error or any per-document `Transient` outcome,
    /// until the retry policy is exhausted. Per-document `Permanent`
    /// outcomes are collected and returned rather than retried.
    ///
    /// The checkpoint is advanced by the caller only once this returns
    /// with `all_confirmed() == true` (spec.md §4.5 "only after the sink
    /// confirms").
    pub async fn apply_batch(&self, ops: Vec<BulkOp>) -> Result<SinkResult, PgDocSyncError> {
        let mut pending = ops;
        let mut permanent_failures = Vec::new();
        let mut retry_state = RetryState::new();

        loop {
            if pending.is_empty() {
                return Ok(SinkResult { permanent_failures });
            }

            match self.transport.bulk_apply(&pending).await {
                Ok(outcomes) => {
                    let mut retryable = Vec::new();
                    for (op, outcome) in pending.into_iter().zip(outcomes) {
                        match outcome {
                            OpOutcome::Ok => {}
                            OpOutcome::Permanent(_reason) => {
                                permanent_failures.push(op.id().to_string());
                            }
                            OpOutcome::Transient(_reason) => retryable.push(op),
                        }
                    }
                    if retryable.is_empty() {
                        return Ok(SinkResult { permanent_failures });
                    }
                    let Some(delay_ms) = retry_state.record_failure(&self.policy) else {
                        permanent_failures.extend(retryable.iter().map(|op| op.id().to_string()));
                        return Ok(SinkResult { permanent_failures });
                    };
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    pending = retryable;
                }
                Err(e) => {
                    let Some(delay_ms) = retry_state.record_failure(&self.policy) else {
                        return Err(PgDocSyncError::TransientSinkError(format!(
                            "sink batch failed after {} attempts: {e}",
                            retry_state.attempts
                        )));
                    };
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }
}

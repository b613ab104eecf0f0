//! Monitoring and alerting for pg_docsync.
//!
//! Where `pg_trickle::monitor` emits `NOTIFY pg_stream_alert` payloads from
//! inside the backend process for `LISTEN`ing clients, this crate has no
//! backend connection to `NOTIFY` from — alerting is generalized to
//! structured `tracing` events carrying the same [`AlertEvent`] payload
//! shape, which any caller can subscribe to via a `tracing_subscriber`
//! layer (or bridge into their own NOTIFY/metrics system).

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Operational events worth surfacing to an operator, mirroring
/// `pg_trickle::monitor`'s alert taxonomy, retargeted at this crate's
/// pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    /// A schema tree failed to compile; the affected index cannot start.
    SchemaCompileFailed { index: String, reason: String },
    /// The replication slot is missing or has lagged past retention; a
    /// full resync is required (spec.md §7).
    ReplicationResyncRequired { index: String, reason: String },
    /// A sink batch exhausted its retry budget and documents were
    /// escalated to permanent failure (spec.md §4.8).
    SinkPermanentFailure { index: String, failed_ids: Vec<String> },
    /// The Work Queue crossed its high-water mark; the Consumer has
    /// paused cursor advance (spec.md §4.6).
    QueueBackpressureEngaged { index: String, queue_len: usize },
    /// The Work Queue has drained back to the low-water mark; cursor
    /// advance has resumed.
    QueueBackpressureReleased { index: String, queue_len: usize },
    /// A stage halted after exhausting consecutive transient-DB-error
    /// retries and is waiting for operator intervention (spec.md §7).
    StageHaltedAwaitingOperator { index: String, stage: String, reason: String },
}

impl AlertEvent {
    /// Emit this event as a structured `tracing` warning, with every field
    /// attached to the span for downstream log processors/subscribers.
    pub fn emit(&self) {
        match self {
            AlertEvent::SchemaCompileFailed { index, reason } => {
                warn!(alert = "schema_compile_failed", index, reason, "schema compile failed");
            }
            AlertEvent::ReplicationResyncRequired { index, reason } => {
                warn!(alert = "replication_resync_required", index, reason, "replication resync required");
            }
            AlertEvent::SinkPermanentFailure { index, failed_ids } => {
                warn!(
                    alert = "sink_permanent_failure",
                    index,
                    count = failed_ids.len(),
                    "sink batch had permanent per-document failures"
                );
            }
            AlertEvent::QueueBackpressureEngaged { index, queue_len } => {
                warn!(alert = "queue_backpressure_engaged", index, queue_len, "work queue backpressure engaged");
            }
            AlertEvent::QueueBackpressureReleased { index, queue_len } => {
                tracing::info!(alert = "queue_backpressure_released", index, queue_len, "work queue backpressure released");
            }
            AlertEvent::StageHaltedAwaitingOperator { index, stage, reason } => {
                warn!(alert = "stage_halted", index, stage, reason, "stage halted awaiting operator");
            }
        }
    }
}

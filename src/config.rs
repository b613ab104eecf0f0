//! Pipeline tuning knobs for pg_docsync.
//!
//! Unlike the Postgres-extension ancestor of this crate, which registered
//! its tunables as GUC variables visible to `SHOW`/`SET`, this crate runs
//! as an ordinary process: there is no GUC registry to hook into. Every
//! tunable is instead a plain field on [`PipelineConfig`], constructed by
//! the caller (a CLI/daemon wrapper, out of scope here) and passed into
//! [`crate::pipeline::Pipeline::new`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for a single index's change-propagation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Work Queue high-water mark. The Replication Consumer halts cursor
    /// advance once the queue holds this many entries.
    pub queue_high_water: usize,

    /// Work Queue low-water mark. The Consumer resumes once the queue has
    /// drained below this many entries.
    pub queue_low_water: usize,

    /// Maximum number of root primary keys the Document Builder requests
    /// from the Planner's root-key-restricted query in a single batch.
    pub builder_batch_size: usize,

    /// How long the Replication Consumer waits for new WAL data before
    /// polling again when the slot is idle.
    pub replication_poll_interval: Duration,

    /// Retry policy applied to transient sink and database errors.
    #[serde(skip)]
    pub retry_policy: crate::error::RetryPolicy,

    /// Maximum number of consecutive transient-error retries before a
    /// stage halts and waits for operator intervention (spec.md §7,
    /// `TransientDbError`).
    pub max_consecutive_db_errors: u32,

    /// Schema name used to qualify the checkpoint/slot bookkeeping tables,
    /// when a durable `CheckpointStore` backend is used.
    pub bookkeeping_schema: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_high_water: 10_000,
            queue_low_water: 2_000,
            builder_batch_size: 500,
            replication_poll_interval: Duration::from_millis(200),
            retry_policy: crate::error::RetryPolicy::default(),
            max_consecutive_db_errors: 10,
            bookkeeping_schema: "pg_docsync".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Validate cross-field invariants. Low-water must be strictly below
    /// high-water or back-pressure never releases.
    pub fn validate(&self) -> Result<(), crate::error::PgDocSyncError> {
        if self.queue_low_water >= self.queue_high_water {
            return Err(crate::error::PgDocSyncError::InvalidArgument(format!(
                "queue_low_water ({}) must be less than queue_high_water ({})",
                self.queue_low_water, self.queue_high_water
            )));
        }
        if self.builder_batch_size == 0 {
            return Err(crate::error::PgDocSyncError::InvalidArgument(
                "builder_batch_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

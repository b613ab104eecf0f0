//! Document Builder — batch root-key rebuild (spec.md §4.5).
//!
//! Grounded on `pg_trickle::refresh`'s `RefreshAction`-style batch
//! executor: given a batch of work, classify each item's outcome and
//! execute the corresponding action. Here the outcome isn't FULL vs
//! DIFFERENTIAL vs NO_DATA, but UPSERT vs DELETE — a root key's row either
//! still exists (rebuild and upsert its document) or it doesn't (the
//! document must be deleted), decided by running the Planner's
//! root-keys-restricted query and checking which requested keys came
//! back.

use serde_json::Value;
use tokio_postgres::Client;

use crate::document::{render_id, AssembledDocument};
use crate::error::PgDocSyncError;
use crate::planner::PlannedQuery;
use crate::queue::WorkItem;

/// The action to take for a single root key after rebuilding.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildAction {
    /// The row still exists: upsert the assembled document.
    Upsert(AssembledDocument),
    /// The row no longer exists (deleted, or never matched the schema
    /// tree's join conditions): delete the document by id.
    Delete { id: String },
}

/// The result of rebuilding one batch of work items: the per-key actions
/// plus the checkpoint cursor this batch has fully accounted for.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub actions: Vec<BuildAction>,
    /// `min(cause_xid) - 1` across the batch: the newest point the
    /// Checkpoint Store can safely advance to, since every change with a
    /// strictly smaller xid is now reflected in `actions` (spec.md §4.7).
    pub checkpoint_xid: Option<u32>,
}

/// Rebuild documents for a batch of coalesced root-key work items.
///
/// Runs the Planner's `root_keys_sql` once against the full set of keys
/// in the batch, then reconciles: keys with a returned row become
/// [`BuildAction::Upsert`]; keys with none become [`BuildAction::Delete`].
pub async fn build_batch(
    client: &Client,
    planned: &PlannedQuery,
    items: &[WorkItem],
) -> Result<BuildResult, PgDocSyncError> {
    if items.is_empty() {
        return Ok(BuildResult {
            actions: vec![],
            checkpoint_xid: None,
        });
    }

    let requested_keys: Vec<Value> = items
        .iter()
        .map(|i| Value::Array(i.root_pk.clone()))
        .collect();
    let keys_param = Value::Array(requested_keys);

    let rows = client
        .query(&planned.root_keys_sql, &[&keys_param])
        .await
        .map_err(|e| PgDocSyncError::TransientDbError(e.to_string()))?;

    let mut found: std::collections::HashMap<String, Value> = std::collections::HashMap::new();
    for row in &rows {
        let root_pk: Vec<Value> = (0..planned.root_primary_key.len())
            .map(|i| pg_value_as_json(row, i))
            .collect();
        let document: Value = row.get::<_, serde_json::Value>("document");
        found.insert(render_id(&root_pk), document);
    }

    let mut actions = Vec::with_capacity(items.len());
    for item in items {
        let id = render_id(&item.root_pk);
        match found.remove(&id) {
            // `document` already carries its own `_meta` block, built by
            // the Planner's query — nothing further to attach here.
            Some(document) => actions.push(BuildAction::Upsert(AssembledDocument::new(id, document))),
            None => actions.push(BuildAction::Delete { id }),
        }
    }

    let checkpoint_xid = items.iter().map(|i| i.cause_xid).min().map(|m| m.saturating_sub(1));

    Ok(BuildResult {
        actions,
        checkpoint_xid,
    })
}

fn pg_value_as_json(row: &tokio_postgres::Row, idx: usize) -> Value {
    // The Planner projects root primary-key columns through `to_jsonb`
    // (see `planner.rs`), so integer/UUID-keyed roots decode here too, not
    // just TEXT ones.
    row.try_get::<_, Option<Value>>(idx).ok().flatten().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_xid_is_min_minus_one() {
        let items = vec![
            WorkItem {
                index: "idx".into(),
                root_pk: vec![Value::from(1)],
                cause_xid: 105,
            },
            WorkItem {
                index: "idx".into(),
                root_pk: vec![Value::from(2)],
                cause_xid: 99,
            },
        ];
        let min_xid = items.iter().map(|i| i.cause_xid).min().unwrap();
        assert_eq!(min_xid.saturating_sub(1), 98);
    }

    #[test]
    fn test_checkpoint_xid_saturates_at_zero() {
        assert_eq!(0u32.saturating_sub(1), 0);
    }
}
